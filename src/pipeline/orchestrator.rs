//! Drives a document task segment by segment.
//!
//! For each segment, in order:
//!
//! 1. Completed segments are skipped when their stored options fingerprint
//!    matches the current config; on mismatch they are reset to pending so
//!    stale recognition output is never reused.
//! 2. The attempt counter and fingerprint are persisted *before* the remote
//!    call: a crash mid-call resumes with the attempt on record.
//! 3. The segment file goes through the [`PageParser`], with a heartbeat
//!    task logging a liveness line while the call is outstanding.
//! 4. Results are written to `_parts/` (Markdown, image map, per-page layout
//!    snapshot), image assets are materialized, and the segment is marked
//!    done.
//! 5. A failed segment is recorded and rendered as a placeholder; the run
//!    moves on. Only authentication and configuration errors abort the
//!    whole run, and cancellation ends it at the next suspension point.
//!
//! After the loop the document is assembled: strictly when everything
//! succeeded, best effort (with an aggregate error naming the failed
//! segments) otherwise.

use crate::client::PageParser;
use crate::config::ConversionConfig;
use crate::error::LayoutMdError;
use crate::pipeline::assemble::{assemble, failed_segment_placeholder, render_pages_markdown, AssemblyPolicy};
use crate::pipeline::images::ImageDownloader;
use crate::pipeline::postprocess::{apply_image_width, ImageStyle};
use crate::pipeline::render::render_page_png;
use crate::pipeline::PageSnapshot;
use crate::protocol::RecognizedPage;
use crate::segmenter::{ensure_segments, resolve_part_path};
use crate::task::{parts_dir, write_atomic, DocumentKind, SegmentState, TaskState};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cooperative run control shared with the caller.
///
/// Cancel ends the run at the next suspension point (in-flight network
/// waits are raced against the token). Pause holds the run between steps;
/// cancel is honored while paused.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub paused: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn check_canceled(&self) -> Result<(), LayoutMdError> {
        if self.cancel.is_cancelled() {
            Err(LayoutMdError::Canceled)
        } else {
            Ok(())
        }
    }

    async fn wait_if_paused(&self) -> Result<(), LayoutMdError> {
        while self.paused.load(Ordering::Relaxed) {
            self.check_canceled()?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.check_canceled()
    }
}

/// Abort-on-drop guard around the heartbeat task, so the heartbeat cannot
/// outlive its call on either the success or the error path.
struct Heartbeat(JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn start_heartbeat(title: String, interval: Duration) -> Heartbeat {
    Heartbeat(tokio::spawn(async move {
        let started = Instant::now();
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tick.tick().await;
            info!(waited_s = started.elapsed().as_secs(), "{title}");
        }
    }))
}

async fn with_cancel<T>(
    control: &RunControl,
    fut: impl Future<Output = Result<T, LayoutMdError>>,
) -> Result<T, LayoutMdError> {
    tokio::select! {
        _ = control.cancel.cancelled() => Err(LayoutMdError::Canceled),
        out = fut => out,
    }
}

static PAGE_SPEC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)(?:-(\d+))?$").unwrap());

/// Parse a page spec like `"15,18-20"` into a 1-based page set. Malformed
/// pieces are ignored; spans over 5000 pages are dropped as typos.
pub fn parse_page_spec(value: &str) -> BTreeSet<u32> {
    let mut pages = BTreeSet::new();
    for part in value.split(',') {
        let p = part.trim();
        let Some(caps) = PAGE_SPEC_RE.captures(p) else {
            continue;
        };
        let Some(a) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
            continue;
        };
        let b = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(a);
        if a == 0 || b == 0 {
            continue;
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if hi - lo > 5000 {
            continue;
        }
        pages.extend(lo..=hi);
    }
    pages
}

fn http_status_of(e: &LayoutMdError) -> Option<u16> {
    match e {
        LayoutMdError::Auth { status } | LayoutMdError::Client { status, .. } => Some(*status),
        LayoutMdError::Retryable { status, .. } => *status,
        _ => None,
    }
}

fn is_run_fatal(e: &LayoutMdError) -> bool {
    matches!(
        e,
        LayoutMdError::Canceled | LayoutMdError::Auth { .. } | LayoutMdError::Config(_)
    )
}

/// Run one document conversion to completion (or best effort).
///
/// Resumable: pass the same `task_dir` again and completed segments are
/// skipped, pending ones retried. Returns the path of `merged_result.md`.
pub async fn run_task<P: PageParser>(
    parser: &P,
    config: &ConversionConfig,
    input_path: &Path,
    task_dir: &Path,
    control: &RunControl,
) -> Result<PathBuf, LayoutMdError> {
    control.check_canceled()?;

    if !input_path.exists() {
        return Err(LayoutMdError::FileNotFound {
            path: input_path.to_path_buf(),
        });
    }
    let kind = DocumentKind::detect(input_path)?;

    tokio::fs::create_dir_all(parts_dir(task_dir))
        .await
        .map_err(|e| LayoutMdError::io(task_dir, e))?;

    let mut state = TaskState::load_or_new(task_dir, input_path, kind).await?;
    ensure_segments(&mut state, input_path, task_dir, config.chunk_pages).await?;
    state.save(task_dir).await?;

    let fingerprint = config.recognition_fingerprint();
    let downloader = ImageDownloader::new(config)?;
    let style = ImageStyle {
        width_percent: config.image_width_percent,
        max_height_px: config.image_max_height_px,
    };
    let total = state.segments.len();

    for i in 0..total {
        control.wait_if_paused().await?;

        if state.segments[i].done {
            if state.segments[i].options_fingerprint.as_deref() == Some(fingerprint.as_str()) {
                // Refresh the idempotent local rewrite so config-only changes
                // (image width, say) take effect without a network call.
                let md_path = state.segments[i].markdown_path(task_dir);
                if let Ok(old) = tokio::fs::read_to_string(&md_path).await {
                    let new = apply_image_width(&old, style);
                    if new != old {
                        write_atomic(&md_path, new.as_bytes()).await?;
                    }
                }
                info!(
                    segment = %state.segments[i].segment_id,
                    "segment already done; skipping (delete task_state.json to force a full re-run)"
                );
                continue;
            }
            info!(
                segment = %state.segments[i].segment_id,
                "recognition options changed; re-running segment"
            );
            state.segments[i].reset();
            state.assembled = false;
            state.save(task_dir).await?;
        }

        state.segments[i].attempts += 1;
        state.segments[i].options_fingerprint = Some(fingerprint.clone());
        state.save(task_dir).await?;

        let seg = state.segments[i].clone();
        if config.debug_dump_requests {
            dump_request_options(config, task_dir, &seg, kind, &fingerprint, input_path).await?;
        }

        match process_segment(parser, config, task_dir, &seg, kind, i, total, control).await {
            Ok(outcome) => {
                state.segments[i].elapsed_ms = outcome.elapsed_ms;
                state.segments[i].done = true;
                state.segments[i].last_error = None;
                state.segments[i].last_http_status = None;
                state.save(task_dir).await?;
                if !outcome.images.is_empty() {
                    downloader
                        .download(task_dir, &mut state, &outcome.images)
                        .await?;
                }
                info!(segment = %seg.segment_id, n = i + 1, total, "segment done");
            }
            Err(e) if is_run_fatal(&e) => {
                state.segments[i].last_error = Some(e.to_string());
                state.segments[i].last_http_status = http_status_of(&e);
                state.save(task_dir).await?;
                return Err(e);
            }
            Err(e) => {
                warn!(segment = %seg.segment_id, error = %e, "segment failed; continuing");
                state.segments[i].done = false;
                state.segments[i].last_error = Some(e.to_string());
                state.segments[i].last_http_status = http_status_of(&e);
                state.save(task_dir).await?;
                write_failure_artifacts(task_dir, &state.segments[i], config).await?;
            }
        }
    }

    let failed: Vec<SegmentState> = state.failed_segments().cloned().collect();
    if !failed.is_empty() {
        assemble(config, task_dir, &mut state, AssemblyPolicy::BestEffort).await?;
        let mut summary = failed
            .iter()
            .map(|s| {
                let err = s.last_error.as_deref().unwrap_or("unknown");
                format!("{}: {err}", s.segment_id)
            })
            .collect::<Vec<_>>()
            .join("; ");
        if summary.len() > 800 {
            summary.truncate(800);
            summary.push('…');
        }
        return Err(LayoutMdError::SegmentsFailed {
            failed: failed.len(),
            summary,
        });
    }

    assemble(config, task_dir, &mut state, AssemblyPolicy::Strict).await
}

struct SegmentOutcome {
    elapsed_ms: u64,
    images: BTreeMap<String, String>,
}

#[allow(clippy::too_many_arguments)]
async fn process_segment<P: PageParser>(
    parser: &P,
    config: &ConversionConfig,
    task_dir: &Path,
    seg: &SegmentState,
    kind: DocumentKind,
    index: usize,
    total: usize,
    control: &RunControl,
) -> Result<SegmentOutcome, LayoutMdError> {
    let part_abs = resolve_part_path(task_dir, seg);
    let started = Instant::now();

    info!(
        segment = %seg.segment_id,
        n = index + 1,
        total,
        pages = %seg.page_label(),
        read_timeout_s = config.read_timeout_secs,
        "submitting segment"
    );
    let mut pages = {
        let _beat = start_heartbeat(
            format!(
                "waiting for parsing service (segment {}/{}, pages {})",
                index + 1,
                total,
                seg.page_label()
            ),
            Duration::from_secs(config.heartbeat_secs),
        );
        with_cancel(control, parser.parse_file(&part_abs, kind)).await?
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    // Pages that dropped characters in PDF mode are rerun individually as
    // locally rendered images.
    if kind == DocumentKind::Pdf {
        let rerun = parse_page_spec(&config.rerun_pages);
        if !rerun.is_empty() {
            rerun_pages_as_images(parser, config, task_dir, seg, &part_abs, &mut pages, &rerun, control)
                .await?;
        }
    }

    // The restructure route may omit prunedResult; keep the originals as a
    // per-page fallback so fragment merging still has geometry to work with.
    let pre_restructure: Vec<Option<serde_json::Value>> =
        pages.iter().map(|p| p.layout.clone()).collect();
    if let Some(concatenate) = config.concatenate_pages {
        info!(concatenate, "restructuring pages");
        let _beat = start_heartbeat(
            "waiting for parsing service (restructure-pages)".to_string(),
            Duration::from_secs(config.heartbeat_secs),
        );
        pages = with_cancel(control, parser.restructure(&pages, concatenate)).await?;
    }

    let pages_text: Vec<String> = pages
        .iter()
        .map(|p| {
            apply_image_width(
                &p.markdown,
                ImageStyle {
                    width_percent: config.image_width_percent,
                    max_height_px: config.image_max_height_px,
                },
            )
        })
        .collect();
    let text = render_pages_markdown(&pages_text, seg.start_page, config);
    write_atomic(&seg.markdown_path(task_dir), text.as_bytes()).await?;

    let mut images: BTreeMap<String, String> = BTreeMap::new();
    for p in &pages {
        images.extend(p.images.clone());
    }
    let images_json = serde_json::to_vec_pretty(&images)
        .map_err(|e| LayoutMdError::Internal(format!("serializing image map: {e}")))?;
    write_atomic(&seg.images_path(task_dir), &images_json).await?;

    let snapshots: Vec<PageSnapshot> = pages
        .iter()
        .enumerate()
        .map(|(j, p)| PageSnapshot {
            page_no: seg.start_page + j as u32,
            pruned_result: p
                .layout
                .clone()
                .or_else(|| pre_restructure.get(j).cloned().flatten()),
            markdown_images: p.images.keys().cloned().collect(),
            page_markdown: pages_text.get(j).cloned(),
        })
        .collect();
    let layout_json = serde_json::to_vec_pretty(&snapshots)
        .map_err(|e| LayoutMdError::Internal(format!("serializing layout snapshots: {e}")))?;
    write_atomic(&seg.layout_path(task_dir), &layout_json).await?;

    Ok(SegmentOutcome { elapsed_ms, images })
}

/// Replace listed pages with the result of submitting a local render of that
/// page in image mode. A page that cannot be rendered or re-recognized keeps
/// its PDF-mode result.
#[allow(clippy::too_many_arguments)]
async fn rerun_pages_as_images<P: PageParser>(
    parser: &P,
    config: &ConversionConfig,
    task_dir: &Path,
    seg: &SegmentState,
    part_abs: &Path,
    pages: &mut [RecognizedPage],
    rerun: &BTreeSet<u32>,
    control: &RunControl,
) -> Result<(), LayoutMdError> {
    for j in 0..pages.len() {
        let page_no = seg.start_page + j as u32;
        if !rerun.contains(&page_no) {
            continue;
        }
        let png = match render_page_png(part_abs, j as u32, config.rerun_dpi, config.rerun_max_side_px)
            .await
        {
            Ok(png) => png,
            Err(e) => {
                warn!(page_no, error = %e, "cannot render page for rerun; keeping PDF-mode result");
                continue;
            }
        };
        let img_path =
            parts_dir(task_dir).join(format!("{}_page_{page_no:04}_rerun.png", seg.segment_id));
        write_atomic(&img_path, &png).await?;

        control.wait_if_paused().await?;
        info!(page_no, dpi = config.rerun_dpi, "rerunning page in image mode");
        let result = {
            let _beat = start_heartbeat(
                format!("waiting for parsing service (page {page_no} rerun)"),
                Duration::from_secs(config.heartbeat_secs),
            );
            with_cancel(control, parser.parse_file(&img_path, DocumentKind::Image)).await
        };
        match result {
            Ok(mut rerun_pages) if !rerun_pages.is_empty() => {
                pages[j] = rerun_pages.swap_remove(0);
            }
            Ok(_) => warn!(page_no, "page rerun returned no pages; keeping PDF-mode result"),
            Err(e) if is_run_fatal(&e) => return Err(e),
            Err(e) => warn!(page_no, error = %e, "page rerun failed; keeping PDF-mode result"),
        }
    }
    Ok(())
}

/// Leave readable artifacts for a failed segment so best-effort assembly has
/// something to show and an operator can see what went wrong on disk.
async fn write_failure_artifacts(
    task_dir: &Path,
    seg: &SegmentState,
    config: &ConversionConfig,
) -> Result<(), LayoutMdError> {
    let placeholder = failed_segment_placeholder(seg, config);
    write_atomic(&seg.markdown_path(task_dir), placeholder.as_bytes()).await?;
    write_atomic(&seg.images_path(task_dir), b"{}").await?;
    write_atomic(&seg.layout_path(task_dir), b"[]").await?;
    Ok(())
}

async fn dump_request_options(
    config: &ConversionConfig,
    task_dir: &Path,
    seg: &SegmentState,
    kind: DocumentKind,
    fingerprint: &str,
    input_path: &Path,
) -> Result<(), LayoutMdError> {
    let payload = json!({
        "segmentId": seg.segment_id,
        "fileType": kind.file_type_code(),
        "inputPath": input_path.display().to_string(),
        "apiUrl": config.api_url,
        "restructureApiUrl": config.restructure_api_url,
        "optionsFingerprint": fingerprint,
        "parseOptions": serde_json::Value::Object(config.payload_options()),
    });
    let bytes = serde_json::to_vec_pretty(&payload)
        .map_err(|e| LayoutMdError::Internal(format!("serializing request dump: {e}")))?;
    write_atomic(&seg.request_options_path(task_dir), &bytes).await
}
