//! End-to-end orchestration tests against a scripted recognition backend.
//!
//! A fake [`PageParser`] stands in for the remote service, so everything
//! from segmentation through resumable state to best-effort assembly is
//! exercised offline. Real PDF inputs are built with lopdf on the fly.

use layoutmd::{
    run_task, ConversionConfig, DocumentKind, LayoutMdError, PageParser, ParseOptions,
    RecognizedPage, RunControl, TaskState,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// ── Test helpers ─────────────────────────────────────────────────────────

/// Honor `RUST_LOG` when debugging a test run.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a minimal n-page PDF on disk.
fn make_pdf(dir: &Path, pages: u32) -> PathBuf {
    use lopdf::{dictionary, Document, Object, Stream};
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            Object::Reference(page_id)
        })
        .collect();
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let path = dir.join(format!("input_{pages}p.pdf"));
    doc.save(&path).unwrap();
    path
}

static RANGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"p(\d{4})-(\d{4})").unwrap());

/// Scripted recognition backend. Page counts are read from the segment
/// file name (`..._p0004-0006.pdf`), whole-file inputs fall back to
/// `default_pages`. Failures are injected by file-name substring.
struct ScriptedParser {
    default_pages: u32,
    parse_calls: Mutex<Vec<String>>,
    restructure_calls: AtomicUsize,
    fail_substr: Mutex<Option<String>>,
    auth_fail: Mutex<bool>,
    images: BTreeMap<String, String>,
}

impl ScriptedParser {
    fn new(default_pages: u32) -> Self {
        Self {
            default_pages,
            parse_calls: Mutex::new(Vec::new()),
            restructure_calls: AtomicUsize::new(0),
            fail_substr: Mutex::new(None),
            auth_fail: Mutex::new(false),
            images: BTreeMap::new(),
        }
    }

    fn fail_on(&self, substr: &str) {
        *self.fail_substr.lock().unwrap() = Some(substr.to_string());
    }

    fn recover(&self) {
        *self.fail_substr.lock().unwrap() = None;
    }

    fn parse_call_count(&self) -> usize {
        self.parse_calls.lock().unwrap().len()
    }

    fn pages_in(&self, name: &str) -> (u32, u32) {
        match RANGE_RE.captures(name) {
            Some(c) => (c[1].parse().unwrap(), c[2].parse().unwrap()),
            None => (1, self.default_pages),
        }
    }
}

impl PageParser for ScriptedParser {
    async fn parse_file(
        &self,
        path: &Path,
        _kind: DocumentKind,
    ) -> Result<Vec<RecognizedPage>, LayoutMdError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        self.parse_calls.lock().unwrap().push(name.clone());

        if *self.auth_fail.lock().unwrap() {
            return Err(LayoutMdError::Auth { status: 401 });
        }
        if let Some(s) = self.fail_substr.lock().unwrap().as_deref() {
            if name.contains(s) {
                return Err(LayoutMdError::Retryable {
                    attempts: 4,
                    status: Some(503),
                    detail: "HTTP 503: upstream overloaded".into(),
                });
            }
        }

        let (start, end) = self.pages_in(&name);
        Ok((start..=end)
            .map(|n| RecognizedPage {
                markdown: format!("Recognized text of page {n}."),
                images: self.images.clone(),
                layout: None,
            })
            .collect())
    }

    async fn restructure(
        &self,
        pages: &[RecognizedPage],
        _concatenate: bool,
    ) -> Result<Vec<RecognizedPage>, LayoutMdError> {
        self.restructure_calls.fetch_add(1, Ordering::Relaxed);
        Ok(pages
            .iter()
            .map(|p| RecognizedPage {
                markdown: format!("{} (restructured)", p.markdown),
                images: p.images.clone(),
                layout: p.layout.clone(),
            })
            .collect())
    }
}

fn base_config() -> ConversionConfig {
    ConversionConfig::builder()
        .api_url("https://ocr.example.com/v1/layout-parsing")
        .token("t")
        .chunk_pages(3)
        .insert_page_numbers(true)
        .build()
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn image_input_end_to_end_with_inline_asset() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("scan.png");
    std::fs::write(&input, b"not a real png, never decoded").unwrap();
    let task_dir = dir.path().join("task");

    let mut parser = ScriptedParser::new(1);
    parser.images.insert(
        "images/fig.png".into(),
        "data:image/png;base64,aGVsbG8=".into(),
    );
    let config = base_config();

    let merged = run_task(&parser, &config, &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    let text = std::fs::read_to_string(&merged).unwrap();
    assert!(text.contains("Recognized text of page 1."), "got: {text}");
    assert!(text.contains("<!-- page:1 -->"));

    // inline image asset materialized under the task dir
    assert_eq!(
        std::fs::read(task_dir.join("images/fig.png")).unwrap(),
        b"hello"
    );

    let state = TaskState::load(&task_dir).await.unwrap().unwrap();
    assert!(state.assembled);
    assert_eq!(state.segments.len(), 1);
    assert_eq!(state.segments[0].segment_id, "image_001_p0001-0001");
    assert!(state.segments[0].done);
    assert!(state.images_downloaded.contains("images/fig.png"));
}

#[tokio::test]
async fn multi_segment_pdf_converts_and_resume_is_a_noop() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 7);
    let task_dir = dir.path().join("task");
    let parser = ScriptedParser::new(7);
    let config = base_config();

    let merged = run_task(&parser, &config, &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.parse_call_count(), 3, "7 pages at chunk 3");

    let text = std::fs::read_to_string(&merged).unwrap();
    for n in 1..=7 {
        assert!(text.contains(&format!("Recognized text of page {n}.")));
        assert!(text.contains(&format!("<!-- page:{n} -->")));
    }

    // second run with the same config touches nothing
    run_task(&parser, &config, &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.parse_call_count(), 3);
}

#[tokio::test]
async fn changed_recognition_options_invalidate_done_segments() {
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 7);
    let task_dir = dir.path().join("task");
    let parser = ScriptedParser::new(7);

    run_task(&parser, &base_config(), &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.parse_call_count(), 3);

    let changed = ConversionConfig::builder()
        .api_url("https://ocr.example.com/v1/layout-parsing")
        .token("t")
        .chunk_pages(3)
        .insert_page_numbers(true)
        .options(ParseOptions {
            merge_tables: Some(true),
            ..Default::default()
        })
        .build()
        .unwrap();
    run_task(&parser, &changed, &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.parse_call_count(), 6, "all segments re-recognized");
}

#[tokio::test]
async fn local_display_change_does_not_rerun_recognition() {
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 7);
    let task_dir = dir.path().join("task");
    let mut parser = ScriptedParser::new(7);
    parser.images.insert(
        "images/fig.png".into(),
        "data:image/png;base64,aGVsbG8=".into(),
    );

    run_task(&parser, &base_config(), &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.parse_call_count(), 3);

    // image sizing is local-only post-processing, outside the fingerprint
    let sized = ConversionConfig::builder()
        .api_url("https://ocr.example.com/v1/layout-parsing")
        .token("t")
        .chunk_pages(3)
        .insert_page_numbers(true)
        .image_width_percent(60)
        .build()
        .unwrap();
    let merged = run_task(&parser, &sized, &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.parse_call_count(), 3, "no network re-recognition");
    let _ = std::fs::read_to_string(&merged).unwrap();
}

#[tokio::test]
async fn failed_segment_becomes_placeholder_and_run_reports_it() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 7);
    let task_dir = dir.path().join("task");
    let parser = ScriptedParser::new(7);
    parser.fail_on("part_002");
    let config = base_config();

    let err = run_task(&parser, &config, &input, &task_dir, &RunControl::new())
        .await
        .unwrap_err();
    match err {
        LayoutMdError::SegmentsFailed { failed, summary } => {
            assert_eq!(failed, 1);
            assert!(summary.contains("part_002_p0004-0006"), "got: {summary}");
            assert!(summary.contains("upstream overloaded"), "got: {summary}");
        }
        other => panic!("expected SegmentsFailed, got {other:?}"),
    }

    // best-effort document still written, failed range marked
    let text = std::fs::read_to_string(task_dir.join("merged_result.md")).unwrap();
    assert!(text.contains("Recognized text of page 1."));
    assert!(text.contains("Recognized text of page 7."));
    assert!(!text.contains("Recognized text of page 5."));
    assert!(text.contains("`part_002_p0004-0006` (pages 4-6)"), "got: {text}");
    assert!(text.contains("recognition failed"), "got: {text}");

    let state = TaskState::load(&task_dir).await.unwrap().unwrap();
    assert!(!state.assembled);
    let failed: Vec<_> = state.failed_segments().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].segment_id, "part_002_p0004-0006");
    assert_eq!(failed[0].last_http_status, Some(503));
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("upstream overloaded"));
}

#[tokio::test]
async fn resume_retries_only_the_failed_segment() {
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 7);
    let task_dir = dir.path().join("task");
    let parser = ScriptedParser::new(7);
    parser.fail_on("part_002");
    let config = base_config();

    run_task(&parser, &config, &input, &task_dir, &RunControl::new())
        .await
        .unwrap_err();
    let calls_before = parser.parse_call_count();

    parser.recover();
    let merged = run_task(&parser, &config, &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.parse_call_count(), calls_before + 1);

    let text = std::fs::read_to_string(&merged).unwrap();
    assert!(text.contains("Recognized text of page 5."));
    assert!(!text.contains("recognition failed"), "placeholder survived");

    let state = TaskState::load(&task_dir).await.unwrap().unwrap();
    assert!(state.assembled);
    assert!(state.segments.iter().all(|s| s.done));
}

#[tokio::test]
async fn auth_failure_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 7);
    let task_dir = dir.path().join("task");
    let parser = ScriptedParser::new(7);
    *parser.auth_fail.lock().unwrap() = true;

    let err = run_task(&parser, &base_config(), &input, &task_dir, &RunControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LayoutMdError::Auth { status: 401 }));
    assert_eq!(parser.parse_call_count(), 1, "no further segments submitted");
    assert!(!task_dir.join("merged_result.md").exists());
}

#[tokio::test]
async fn pre_canceled_run_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 2);
    let task_dir = dir.path().join("task");
    let parser = ScriptedParser::new(2);
    let control = RunControl::new();
    control.cancel.cancel();

    let err = run_task(&parser, &base_config(), &input, &task_dir, &control)
        .await
        .unwrap_err();
    assert!(matches!(err, LayoutMdError::Canceled));
    assert_eq!(parser.parse_call_count(), 0);
}

#[tokio::test]
async fn restructure_runs_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let input = make_pdf(dir.path(), 2);
    let task_dir = dir.path().join("task");
    let parser = ScriptedParser::new(2);
    let config = ConversionConfig::builder()
        .api_url("https://ocr.example.com/v1/layout-parsing")
        .token("t")
        .chunk_pages(3)
        .concatenate_pages(Some(false))
        .build()
        .unwrap();

    let merged = run_task(&parser, &config, &input, &task_dir, &RunControl::new())
        .await
        .unwrap();
    assert_eq!(parser.restructure_calls.load(Ordering::Relaxed), 1);
    let text = std::fs::read_to_string(&merged).unwrap();
    assert!(text.contains("(restructured)"), "got: {text}");
}

#[tokio::test]
async fn missing_input_is_reported_before_any_call() {
    let dir = tempfile::tempdir().unwrap();
    let parser = ScriptedParser::new(1);
    let err = run_task(
        &parser,
        &base_config(),
        &dir.path().join("absent.pdf"),
        &dir.path().join("task"),
        &RunControl::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, LayoutMdError::FileNotFound { .. }));
    assert_eq!(parser.parse_call_count(), 0);
}
