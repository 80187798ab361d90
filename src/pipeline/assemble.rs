//! Joins per-segment results into the final `merged_result.md`.
//!
//! Assembly is pure local work: it reads segment artifacts from `_parts/`,
//! re-runs idempotent post-processing (fragment merging from the layout
//! snapshots, image display-width rewriting), materializes image assets, and
//! concatenates segment blocks with the configured separator. It can be run
//! any number of times without network calls to the parsing service.
//!
//! Two policies:
//!
//! * [`AssemblyPolicy::BestEffort`] renders a placeholder block for every
//!   failed or missing segment, so a partially failed run still yields a
//!   readable document that names exactly which page ranges to re-run.
//! * [`AssemblyPolicy::Strict`] refuses unless every segment is done.

use crate::config::ConversionConfig;
use crate::error::LayoutMdError;
use crate::pipeline::fragments::{merge_fragments_for_page, PageImageSource};
use crate::pipeline::images::ImageDownloader;
use crate::pipeline::postprocess::{apply_image_width, ImageStyle};
use crate::pipeline::render::PdfPageSource;
use crate::pipeline::PageSnapshot;
use crate::segmenter::resolve_part_path;
use crate::task::{merged_path, write_atomic, SegmentState, TaskState};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How missing or failed segments are treated during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyPolicy {
    /// Substitute placeholder blocks for anything not done.
    BestEffort,
    /// Refuse unless every segment is done.
    Strict,
}

static PAGE_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<!--\s*page\s*:\s*\d+\s*-->").unwrap());

/// Render page blocks the way they are persisted: optional machine-readable
/// marker plus a visible page label, joined by the configured separator.
pub(crate) fn render_pages_markdown(
    pages: &[String],
    start_page: u32,
    config: &ConversionConfig,
) -> String {
    let blocks: Vec<String> = pages
        .iter()
        .enumerate()
        .map(|(idx, text)| {
            if config.insert_page_numbers {
                let page_no = start_page + idx as u32;
                format!("<!-- page:{page_no} -->\n\n**Page {page_no}**\n\n{text}")
                    .trim_end()
                    .to_string()
            } else {
                text.trim_end().to_string()
            }
        })
        .filter(|b| !b.is_empty())
        .collect();
    let sep = if config.page_separator.is_empty() {
        "\n\n"
    } else {
        config.page_separator.as_str()
    };
    blocks.join(sep)
}

/// Split persisted segment Markdown back into pages. Page markers take
/// priority over the separator: they survive separator config changes.
pub(crate) fn split_segment_pages(text: &str, config: &ConversionConfig) -> Vec<String> {
    if text.contains("<!--") && text.contains("page:") {
        let starts: Vec<usize> = PAGE_MARKER_RE.find_iter(text).map(|m| m.start()).collect();
        if starts.len() > 1 || (starts.len() == 1 && starts[0] > 0) {
            let mut chunks = Vec::with_capacity(starts.len() + 1);
            if starts[0] > 0 {
                chunks.push(text[..starts[0]].to_string());
            }
            for (i, &s) in starts.iter().enumerate() {
                let end = starts.get(i + 1).copied().unwrap_or(text.len());
                chunks.push(text[s..end].to_string());
            }
            return chunks.into_iter().filter(|c| !c.is_empty()).collect();
        }
        return vec![text.to_string()];
    }
    if config.page_separator.is_empty() {
        vec![text.to_string()]
    } else {
        text.split(&config.page_separator)
            .map(str::to_string)
            .collect()
    }
}

pub(crate) fn join_segment_pages(pages: &[String], config: &ConversionConfig) -> String {
    // Marker-split blocks carry their own markers; concatenate directly.
    if pages
        .first()
        .is_some_and(|p| p.trim_start().to_lowercase().starts_with("<!-- page:"))
    {
        return pages.concat();
    }
    if config.page_separator.is_empty() {
        pages.concat()
    } else {
        pages.join(&config.page_separator)
    }
}

/// Placeholder block for a segment with no usable result.
pub(crate) fn failed_segment_placeholder(seg: &SegmentState, config: &ConversionConfig) -> String {
    let start = seg.start_page;
    let end = seg.end_page;
    let err = seg
        .last_error
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown");
    let mut lines: Vec<String> = Vec::new();
    if config.insert_page_numbers {
        lines.push(format!("<!-- page:{start} -->"));
        lines.push(String::new());
        lines.push(format!("**Page {start} (recognition failed)**"));
    } else {
        lines.push("**Recognition failed**".to_string());
    }
    lines.push(String::new());
    lines.push(format!("> Segment: `{}` (pages {start}-{end})", seg.segment_id));
    lines.push(format!("> Error: {err}"));
    lines.push(String::new());
    lines.push(
        "> Lower `chunk_pages` or raise `read_timeout_secs` and rerun; this block is replaced once the segment succeeds."
            .to_string(),
    );
    lines.join("\n").trim_end().to_string()
}

/// Re-run fragment merging for one segment from its layout snapshot.
///
/// The snapshot's per-page Markdown is preferred over the segment `.md`
/// (which may already have merged references); rebuilt pages are re-rendered
/// with the current page-numbering and separator config.
fn merge_segment_fragments_blocking(
    config: &ConversionConfig,
    task_dir: &Path,
    seg: &SegmentState,
    text: &str,
    snapshots: &[PageSnapshot],
) -> Result<String, LayoutMdError> {
    if snapshots.is_empty() {
        return Ok(text.to_string());
    }

    let from_meta = snapshots.iter().all(|s| s.page_markdown.is_some());
    let mut pages: Vec<String> = if from_meta {
        snapshots
            .iter()
            .map(|s| s.page_markdown.clone().unwrap_or_default())
            .collect()
    } else {
        split_segment_pages(text, config)
    };
    if pages.len() < snapshots.len() {
        return Ok(text.to_string());
    }

    let part_path = resolve_part_path(task_dir, seg);
    let pdf_source = (part_path.extension().and_then(|e| e.to_str()) == Some("pdf")
        && part_path.exists())
    .then(|| PdfPageSource::new(&part_path));

    let mut changed = false;
    for (i, snap) in snapshots.iter().enumerate() {
        let page_no = if snap.page_no > 0 {
            snap.page_no
        } else {
            seg.start_page + i as u32
        };
        let render = pdf_source
            .as_ref()
            .map(|s| (s as &dyn PageImageSource, i as u32));
        let after = merge_fragments_for_page(
            task_dir,
            &pages[i],
            snap.pruned_result.as_ref(),
            &snap.markdown_images,
            page_no,
            render,
            &config.merge_tuning,
        )?;
        if after != pages[i] {
            pages[i] = after;
            changed = true;
        }
    }

    if !changed {
        return Ok(text.to_string());
    }
    if from_meta {
        Ok(render_pages_markdown(&pages, seg.start_page, config))
    } else {
        Ok(join_segment_pages(&pages, config))
    }
}

async fn load_snapshots(task_dir: &Path, seg: &SegmentState) -> Vec<PageSnapshot> {
    let path = seg.layout_path(task_dir);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

async fn postprocess_segment(
    config: &ConversionConfig,
    task_dir: &Path,
    seg: &SegmentState,
    raw: String,
) -> Result<String, LayoutMdError> {
    let merged = if config.merge_image_fragments {
        let snapshots = load_snapshots(task_dir, seg).await;
        let config = config.clone();
        let task_dir = task_dir.to_path_buf();
        let seg = seg.clone();
        tokio::task::spawn_blocking(move || {
            merge_segment_fragments_blocking(&config, &task_dir, &seg, &raw, &snapshots)
        })
        .await
        .map_err(|e| LayoutMdError::Internal(format!("fragment merge task: {e}")))??
    } else {
        raw
    };
    Ok(apply_image_width(
        &merged,
        ImageStyle {
            width_percent: config.image_width_percent,
            max_height_px: config.image_max_height_px,
        },
    ))
}

/// Assemble `merged_result.md` from segment artifacts.
pub async fn assemble(
    config: &ConversionConfig,
    task_dir: &Path,
    state: &mut TaskState,
    policy: AssemblyPolicy,
) -> Result<PathBuf, LayoutMdError> {
    if state.segments.is_empty() {
        return Err(LayoutMdError::NoSegments);
    }
    if policy == AssemblyPolicy::Strict {
        let pending = state.pending_count();
        if pending > 0 {
            return Err(LayoutMdError::Incomplete { pending });
        }
    }

    // Image references from every segment, downloaded up front so the
    // Markdown's relative paths resolve.
    let mut combined_images: BTreeMap<String, String> = BTreeMap::new();
    for seg in &state.segments {
        if let Ok(raw) = tokio::fs::read_to_string(seg.images_path(task_dir)).await {
            if let Ok(map) = serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                combined_images.extend(map);
            }
        }
    }
    if !combined_images.is_empty() {
        info!(count = combined_images.len(), "materializing image assets");
        let downloader = ImageDownloader::new(config)?;
        downloader
            .download(task_dir, state, &combined_images)
            .await?;
    }

    let segments = state.segments.clone();
    let mut parts: Vec<String> = Vec::with_capacity(segments.len());
    for seg in &segments {
        let md_path = seg.markdown_path(task_dir);
        match tokio::fs::read_to_string(&md_path).await {
            Ok(raw) => {
                let processed = postprocess_segment(config, task_dir, seg, raw.clone()).await?;
                if processed != raw {
                    debug!(segment = %seg.segment_id, "segment markdown rewritten by post-processing");
                    write_atomic(&md_path, processed.as_bytes()).await?;
                }
                parts.push(processed);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match policy {
                    AssemblyPolicy::BestEffort => {
                        parts.push(failed_segment_placeholder(seg, config))
                    }
                    // Strict verified done above; a done segment without its
                    // artifact means the directory was tampered with.
                    AssemblyPolicy::Strict => {
                        return Err(LayoutMdError::Internal(format!(
                            "segment {} is done but {} is missing",
                            seg.segment_id,
                            md_path.display()
                        )))
                    }
                }
            }
            Err(e) => return Err(LayoutMdError::io(&md_path, e)),
        }
    }

    let merged = parts.join(&config.page_separator);
    let out_path = merged_path(task_dir);
    write_atomic(&out_path, merged.as_bytes()).await?;

    state.assembled = state.segments.iter().all(|s| s.done);
    state.save(task_dir).await?;
    info!(path = %out_path.display(), assembled = state.assembled, "document written");
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DocumentKind;

    fn config_with_markers() -> ConversionConfig {
        ConversionConfig::builder()
            .insert_page_numbers(true)
            .build()
            .unwrap()
    }

    #[test]
    fn pages_render_with_markers_and_labels() {
        let config = config_with_markers();
        let pages = vec!["first".to_string(), "second".to_string()];
        let out = render_pages_markdown(&pages, 21, &config);
        assert!(out.contains("<!-- page:21 -->"));
        assert!(out.contains("**Page 22**"));
        assert!(out.contains("\n\n---\n\n"));
    }

    #[test]
    fn marker_split_survives_separator_change() {
        let config = config_with_markers();
        let pages = vec!["alpha".to_string(), "beta".to_string()];
        let rendered = render_pages_markdown(&pages, 5, &config);

        // Same content, different separator config: markers still win.
        let mut other = config.clone();
        other.page_separator = "\n\n~~~\n\n".to_string();
        let split = split_segment_pages(&rendered, &other);
        assert_eq!(split.len(), 2);
        assert!(split[0].contains("alpha"));
        assert!(split[1].contains("beta"));
        assert_eq!(join_segment_pages(&split, &other), rendered);
    }

    #[test]
    fn separator_split_without_markers() {
        let config = ConversionConfig::default();
        let text = "one\n\n---\n\ntwo";
        let split = split_segment_pages(text, &config);
        assert_eq!(split, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn placeholder_names_segment_and_error() {
        let mut seg = SegmentState::new("part_002_p0011-0020", 11, 20, "x.pdf");
        seg.last_error = Some("HTTP 503: upstream overloaded".into());
        let block = failed_segment_placeholder(&seg, &ConversionConfig::default());
        assert!(block.contains("part_002_p0011-0020"));
        assert!(block.contains("pages 11-20"));
        assert!(block.contains("HTTP 503"));

        let with_pages = failed_segment_placeholder(&seg, &config_with_markers());
        assert!(with_pages.starts_with("<!-- page:11 -->"));
    }

    #[tokio::test]
    async fn best_effort_mixes_results_and_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConversionConfig::default();
        let mut state = TaskState::new("in.pdf", DocumentKind::Pdf);
        let mut ok = SegmentState::new("part_001_p0001-0002", 1, 2, "a.pdf");
        ok.done = true;
        let mut bad = SegmentState::new("part_002_p0003-0004", 3, 4, "b.pdf");
        bad.last_error = Some("read timeout".into());
        state.segments = vec![ok.clone(), bad];

        tokio::fs::create_dir_all(dir.path().join("_parts"))
            .await
            .unwrap();
        tokio::fs::write(ok.markdown_path(dir.path()), "# Chapter 1\n\ntext")
            .await
            .unwrap();

        let out = assemble(&config, dir.path(), &mut state, AssemblyPolicy::BestEffort)
            .await
            .unwrap();
        let merged = tokio::fs::read_to_string(&out).await.unwrap();
        assert!(merged.contains("# Chapter 1"));
        assert!(merged.contains("part_002_p0003-0004"));
        assert!(merged.contains("read timeout"));
        assert!(!state.assembled);
    }

    #[tokio::test]
    async fn strict_refuses_pending_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = TaskState::new("in.pdf", DocumentKind::Pdf);
        state
            .segments
            .push(SegmentState::new("part_001_p0001-0002", 1, 2, "a.pdf"));
        let err = assemble(
            &ConversionConfig::default(),
            dir.path(),
            &mut state,
            AssemblyPolicy::Strict,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LayoutMdError::Incomplete { pending: 1 }));
    }

    #[tokio::test]
    async fn strict_assembles_when_all_done() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConversionConfig::default();
        let mut state = TaskState::new("in.pdf", DocumentKind::Pdf);
        let mut seg = SegmentState::new("pdf_full_p0001-0001", 1, 1, "a.pdf");
        seg.done = true;
        state.segments.push(seg.clone());
        tokio::fs::create_dir_all(dir.path().join("_parts"))
            .await
            .unwrap();
        tokio::fs::write(seg.markdown_path(dir.path()), "only page")
            .await
            .unwrap();

        let out = assemble(&config, dir.path(), &mut state, AssemblyPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read_to_string(out).await.unwrap(),
            "only page"
        );
        assert!(state.assembled);
    }

    #[tokio::test]
    async fn empty_task_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = TaskState::new("in.pdf", DocumentKind::Pdf);
        let err = assemble(
            &ConversionConfig::default(),
            dir.path(),
            &mut state,
            AssemblyPolicy::BestEffort,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LayoutMdError::NoSegments));
    }

    #[tokio::test]
    async fn width_rewrite_applies_during_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConversionConfig::builder()
            .image_width_percent(50)
            .merge_image_fragments(false)
            .build()
            .unwrap();
        let mut state = TaskState::new("in.pdf", DocumentKind::Pdf);
        let mut seg = SegmentState::new("pdf_full_p0001-0001", 1, 1, "a.pdf");
        seg.done = true;
        state.segments.push(seg.clone());
        tokio::fs::create_dir_all(dir.path().join("_parts"))
            .await
            .unwrap();
        tokio::fs::write(seg.markdown_path(dir.path()), "![f](images/a.png)")
            .await
            .unwrap();

        let out = assemble(&config, dir.path(), &mut state, AssemblyPolicy::BestEffort)
            .await
            .unwrap();
        let merged = tokio::fs::read_to_string(out).await.unwrap();
        assert!(merged.contains("max-width:50%"), "got: {merged}");
        // the segment artifact was rewritten in place too
        let seg_md = tokio::fs::read_to_string(seg.markdown_path(dir.path()))
            .await
            .unwrap();
        assert!(seg_md.contains("max-width:50%"));
    }
}
