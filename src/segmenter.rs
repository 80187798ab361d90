//! Splits the input into bounded segments and keeps them stable across runs.
//!
//! A PDF at or under the page bound is submitted whole (`pdf_full_…`), with
//! `part_path` pointing at the original file so nothing is copied. Larger
//! PDFs are cut into `part_NNN_pSSSS-EEEE.pdf` range extracts under
//! `_parts/`, stored with paths relative to the task directory so the whole
//! directory stays relocatable. Images are always a single one-page segment.
//!
//! Once any segment is done the plan is frozen: page ranges are the join key
//! between persisted results and the document, so replanning would orphan
//! completed work. The one exception is a whole-file PDF segment with no
//! completed work — lowering `chunk_pages` below the page count re-splits it,
//! which is the escape hatch when a single request keeps hitting the read
//! timeout.

use crate::error::LayoutMdError;
use crate::task::{parts_dir, DocumentKind, SegmentState, TaskState};
use lopdf::Document;
use std::path::{Path, PathBuf};
use tracing::info;

/// Plan 1-based inclusive page ranges: disjoint, increasing, covering
/// `[1, total]`, each at most `chunk` pages.
pub fn plan_segments(total: u32, chunk: u32) -> Vec<(u32, u32)> {
    let chunk = chunk.max(1);
    let mut ranges = Vec::new();
    let mut start = 1u32;
    while start <= total {
        let end = (start + chunk - 1).min(total);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Segment id for a range extract, e.g. `part_003_p0021-0030`.
pub fn part_segment_id(ordinal: usize, start: u32, end: u32) -> String {
    format!("part_{ordinal:03}_p{start:04}-{end:04}")
}

/// Segment id for a whole-file PDF submission.
pub fn full_segment_id(total: u32) -> String {
    format!("pdf_full_p0001-{total:04}")
}

fn load_pdf(path: &Path) -> Result<Document, LayoutMdError> {
    Document::load(path).map_err(|e| LayoutMdError::Pdf {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn page_count_blocking(path: &Path) -> Result<u32, LayoutMdError> {
    let doc = load_pdf(path)?;
    let total = doc.get_pages().len() as u32;
    if total == 0 {
        return Err(LayoutMdError::Pdf {
            path: path.to_path_buf(),
            detail: "PDF has no pages".into(),
        });
    }
    Ok(total)
}

/// Number of pages in a PDF.
pub async fn pdf_page_count(path: &Path) -> Result<u32, LayoutMdError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || page_count_blocking(&path))
        .await
        .map_err(|e| LayoutMdError::Internal(format!("page count task: {e}")))?
}

/// Write the inclusive 1-based range `[start, end]` of `src` to `dst`.
fn extract_page_range_blocking(
    src: &Path,
    dst: &Path,
    start: u32,
    end: u32,
) -> Result<(), LayoutMdError> {
    let mut doc = load_pdf(src)?;
    let outside: Vec<u32> = doc
        .get_pages()
        .keys()
        .copied()
        .filter(|p| *p < start || *p > end)
        .collect();
    doc.delete_pages(&outside);
    doc.prune_objects();
    doc.renumber_objects();
    doc.save(dst).map_err(|e| LayoutMdError::Pdf {
        path: dst.to_path_buf(),
        detail: format!("writing page range {start}-{end}: {e}"),
    })?;
    Ok(())
}

fn is_full_pdf_segment(segments: &[SegmentState], input_path: &Path) -> bool {
    let [seg] = segments else { return false };
    if !seg.segment_id.starts_with("pdf_full_") {
        return false;
    }
    match (seg.part_path.canonicalize(), input_path.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => seg.part_path == input_path,
    }
}

/// Ensure the task has a valid segment plan, extracting part files as needed.
///
/// Existing plans are kept verbatim; see module docs for the single re-split
/// exception.
pub async fn ensure_segments(
    state: &mut TaskState,
    input_path: &Path,
    task_dir: &Path,
    chunk_pages: u32,
) -> Result<(), LayoutMdError> {
    if state.kind == DocumentKind::Image {
        if state.segments.is_empty() {
            state
                .segments
                .push(SegmentState::new("image_001_p0001-0001", 1, 1, input_path));
        }
        return Ok(());
    }

    let chunk = chunk_pages.max(1);
    if !state.segments.is_empty() {
        if state.any_done() {
            return Ok(());
        }
        let total = pdf_page_count(input_path).await.unwrap_or(0);
        if total > chunk && is_full_pdf_segment(&state.segments, input_path) {
            info!(total, chunk, "re-splitting whole-file segment into parts");
            state.segments.clear();
        } else {
            return Ok(());
        }
    }

    let total = pdf_page_count(input_path).await?;
    if total <= chunk {
        state.segments.push(SegmentState::new(
            full_segment_id(total),
            1,
            total,
            input_path,
        ));
        return Ok(());
    }

    let parts = parts_dir(task_dir);
    tokio::fs::create_dir_all(&parts)
        .await
        .map_err(|e| LayoutMdError::io(&parts, e))?;

    let ranges = plan_segments(total, chunk);
    let mut segments = Vec::with_capacity(ranges.len());
    for (ordinal, (start, end)) in ranges.into_iter().enumerate() {
        let seg_id = part_segment_id(ordinal + 1, start, end);
        let part_file = parts.join(format!("{seg_id}.pdf"));
        if !part_file.exists() {
            let src = input_path.to_path_buf();
            let dst = part_file.clone();
            tokio::task::spawn_blocking(move || {
                extract_page_range_blocking(&src, &dst, start, end)
            })
            .await
            .map_err(|e| LayoutMdError::Internal(format!("page extract task: {e}")))??;
        }
        segments.push(SegmentState::new(
            seg_id.clone(),
            start,
            end,
            PathBuf::from(crate::task::PARTS_DIR).join(format!("{seg_id}.pdf")),
        ));
    }
    state.segments = segments;
    Ok(())
}

/// Absolute location of a segment's submission file. Relative part paths are
/// anchored at the task directory.
pub fn resolve_part_path(task_dir: &Path, seg: &SegmentState) -> PathBuf {
    if seg.part_path.is_absolute() {
        seg.part_path.clone()
    } else {
        task_dir.join(&seg.part_path)
    }
}
