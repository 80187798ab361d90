//! Durable task state for a conversion run.
//!
//! One output directory = one task. `task_state.json` in that directory is
//! the sole source of truth between runs: segments, their completion status,
//! attempt counters, and the fingerprint of the options each segment was
//! recognized with. The file is written atomically (temp + rename) so a
//! crash mid-save never leaves a torn state behind, and it is never deleted
//! by the library.
//!
//! Per-segment artifacts live under `_parts/`:
//!
//! * `<segment_id>.md` — the segment's Markdown,
//! * `<segment_id>_images.json` — image reference map,
//! * `<segment_id>_layout.json` — per-page pruned layout snapshot,
//!
//! and the assembled document is `merged_result.md` next to them.

use crate::error::LayoutMdError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the persisted state file inside the task directory.
pub const STATE_FILENAME: &str = "task_state.json";

/// Directory holding per-segment artifacts.
pub const PARTS_DIR: &str = "_parts";

/// Name of the assembled output document.
pub const MERGED_FILENAME: &str = "merged_result.md";

/// Bumped when the persisted shape changes incompatibly.
const STATE_VERSION: u32 = 2;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

/// What kind of input the task converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Image,
}

impl DocumentKind {
    /// Detect the kind from the file extension.
    pub fn detect(path: &Path) -> Result<Self, LayoutMdError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if ext == "pdf" {
            Ok(DocumentKind::Pdf)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Ok(DocumentKind::Image)
        } else {
            Err(LayoutMdError::UnsupportedFile {
                path: path.to_path_buf(),
            })
        }
    }

    /// Wire value of the `fileType` request field.
    pub fn file_type_code(self) -> u8 {
        match self {
            DocumentKind::Pdf => 0,
            DocumentKind::Image => 1,
        }
    }
}

/// One unit of remote work: a page range submitted in a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentState {
    /// Stable id encoding ordinal and range, e.g. `part_003_p0021-0030`.
    pub segment_id: String,
    /// First page, 1-based inclusive.
    pub start_page: u32,
    /// Last page, 1-based inclusive.
    pub end_page: u32,
    /// File submitted for this segment: the whole input, or an extracted range.
    pub part_path: PathBuf,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub last_http_status: Option<u16>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Fingerprint of the recognition options this segment was completed with.
    #[serde(default)]
    pub options_fingerprint: Option<String>,
}

impl SegmentState {
    pub fn new(
        segment_id: impl Into<String>,
        start_page: u32,
        end_page: u32,
        part_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            segment_id: segment_id.into(),
            start_page,
            end_page,
            part_path: part_path.into(),
            done: false,
            attempts: 0,
            elapsed_ms: 0,
            last_http_status: None,
            last_error: None,
            options_fingerprint: None,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.end_page.saturating_sub(self.start_page) + 1
    }

    /// Human-readable `"21-30"` / `"7"` label for logs and placeholders.
    pub fn page_label(&self) -> String {
        if self.start_page == self.end_page {
            self.start_page.to_string()
        } else {
            format!("{}-{}", self.start_page, self.end_page)
        }
    }

    /// Back to pending, wiping completion status but keeping `attempts` so
    /// the history of how hard a segment has been survives invalidation.
    pub fn reset(&mut self) {
        self.done = false;
        self.last_http_status = None;
        self.last_error = None;
        self.options_fingerprint = None;
    }

    pub fn markdown_path(&self, task_dir: &Path) -> PathBuf {
        parts_dir(task_dir).join(format!("{}.md", self.segment_id))
    }

    pub fn images_path(&self, task_dir: &Path) -> PathBuf {
        parts_dir(task_dir).join(format!("{}_images.json", self.segment_id))
    }

    pub fn layout_path(&self, task_dir: &Path) -> PathBuf {
        parts_dir(task_dir).join(format!("{}_layout.json", self.segment_id))
    }

    pub fn request_options_path(&self, task_dir: &Path) -> PathBuf {
        parts_dir(task_dir).join(format!("{}_request_options.json", self.segment_id))
    }
}

/// Durable state of one conversion task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub version: u32,
    pub input_path: PathBuf,
    pub kind: DocumentKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub segments: Vec<SegmentState>,
    /// Relative paths of image assets already materialized on disk.
    #[serde(default)]
    pub images_downloaded: BTreeSet<String>,
    /// Whether `merged_result.md` was written from fully-done segments.
    #[serde(default)]
    pub assembled: bool,
}

impl TaskState {
    pub fn new(input_path: impl Into<PathBuf>, kind: DocumentKind) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            input_path: input_path.into(),
            kind,
            created_at: now,
            updated_at: now,
            segments: Vec::new(),
            images_downloaded: BTreeSet::new(),
            assembled: false,
        }
    }

    /// Load the state from `task_dir`, or start fresh if none exists.
    ///
    /// A state file that fails to parse is treated as absent (logged): the
    /// run restarts from scratch rather than dying on a corrupt file, since
    /// segment artifacts on disk are re-derived from segment ids anyway.
    pub async fn load_or_new(
        task_dir: &Path,
        input_path: &Path,
        kind: DocumentKind,
    ) -> Result<Self, LayoutMdError> {
        match Self::load(task_dir).await? {
            Some(mut state) => {
                if state.input_path != input_path {
                    debug!(
                        old = %state.input_path.display(),
                        new = %input_path.display(),
                        "task state created for a different input path; keeping segments"
                    );
                    state.input_path = input_path.to_path_buf();
                }
                state.kind = kind;
                Ok(state)
            }
            None => Ok(Self::new(input_path, kind)),
        }
    }

    /// Load the state file if present and parseable.
    pub async fn load(task_dir: &Path) -> Result<Option<Self>, LayoutMdError> {
        let path = state_path(task_dir);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LayoutMdError::io(path, e)),
        };
        match serde_json::from_str::<TaskState>(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable task state; starting fresh");
                Ok(None)
            }
        }
    }

    /// Persist atomically: write a temp file in the task directory, then
    /// rename over the state file.
    pub async fn save(&mut self, task_dir: &Path) -> Result<(), LayoutMdError> {
        self.updated_at = Utc::now();
        tokio::fs::create_dir_all(task_dir)
            .await
            .map_err(|e| LayoutMdError::io(task_dir, e))?;
        let path = state_path(task_dir);
        let tmp = task_dir.join(format!(".{STATE_FILENAME}.tmp"));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| LayoutMdError::Internal(format!("serializing task state: {e}")))?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| LayoutMdError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| LayoutMdError::io(&path, e))?;
        Ok(())
    }

    pub fn done_count(&self) -> usize {
        self.segments.iter().filter(|s| s.done).count()
    }

    pub fn pending_count(&self) -> usize {
        self.segments.len() - self.done_count()
    }

    pub fn any_done(&self) -> bool {
        self.segments.iter().any(|s| s.done)
    }

    pub fn failed_segments(&self) -> impl Iterator<Item = &SegmentState> {
        self.segments
            .iter()
            .filter(|s| !s.done && s.last_error.is_some())
    }
}

pub fn state_path(task_dir: &Path) -> PathBuf {
    task_dir.join(STATE_FILENAME)
}

pub fn parts_dir(task_dir: &Path) -> PathBuf {
    task_dir.join(PARTS_DIR)
}

pub fn merged_path(task_dir: &Path) -> PathBuf {
    task_dir.join(MERGED_FILENAME)
}

/// Write a file atomically via temp + rename in the destination directory.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), LayoutMdError> {
    let dir = path
        .parent()
        .ok_or_else(|| LayoutMdError::Internal(format!("no parent dir for {}", path.display())))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| LayoutMdError::io(dir, e))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = dir.join(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| LayoutMdError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| LayoutMdError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_kind_from_extension() {
        assert_eq!(
            DocumentKind::detect(Path::new("a/b/report.PDF")).unwrap(),
            DocumentKind::Pdf
        );
        assert_eq!(
            DocumentKind::detect(Path::new("scan.jpeg")).unwrap(),
            DocumentKind::Image
        );
        assert!(DocumentKind::detect(Path::new("notes.docx")).is_err());
        assert!(DocumentKind::detect(Path::new("no_extension")).is_err());
    }

    #[test]
    fn reset_keeps_attempts() {
        let mut seg = SegmentState::new("part_001_p0001-0010", 1, 10, "in.pdf");
        seg.done = true;
        seg.attempts = 3;
        seg.last_error = Some("HTTP 500".into());
        seg.options_fingerprint = Some("abc".into());
        seg.reset();
        assert!(!seg.done);
        assert_eq!(seg.attempts, 3);
        assert!(seg.last_error.is_none());
        assert!(seg.options_fingerprint.is_none());
    }

    #[test]
    fn page_labels() {
        assert_eq!(SegmentState::new("s", 21, 30, "p").page_label(), "21-30");
        assert_eq!(SegmentState::new("s", 7, 7, "p").page_label(), "7");
        assert_eq!(SegmentState::new("s", 21, 30, "p").page_count(), 10);
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = TaskState::new("input.pdf", DocumentKind::Pdf);
        state
            .segments
            .push(SegmentState::new("part_001_p0001-0010", 1, 10, "x.pdf"));
        state.segments[0].done = true;
        state.images_downloaded.insert("images/a.png".into());
        state.save(dir.path()).await.unwrap();

        let loaded = TaskState::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.version, STATE_VERSION);
        assert_eq!(loaded.segments.len(), 1);
        assert!(loaded.segments[0].done);
        assert!(loaded.images_downloaded.contains("images/a.png"));
        assert_eq!(loaded.done_count(), 1);
        assert_eq!(loaded.pending_count(), 0);
    }

    #[tokio::test]
    async fn corrupt_state_restarts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(state_path(dir.path()), b"{not json")
            .await
            .unwrap();
        let state = TaskState::load_or_new(dir.path(), Path::new("in.pdf"), DocumentKind::Pdf)
            .await
            .unwrap();
        assert!(state.segments.is_empty());
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TaskState::load(dir.path()).await.unwrap().is_none());
    }
}
