//! PDF page rasterisation via pdfium.
//!
//! pdfium wraps a C++ library with thread-local state, so all rendering runs
//! on blocking threads (`spawn_blocking` from async callers, or directly from
//! the fragment merger which is already on one). The library is bound at
//! runtime: when no libpdfium is installed, [`PdfPageSource`] simply yields
//! no renders and fragment merging falls back to compositing, while the
//! page-rerun path reports a proper error since it cannot proceed without a
//! render.

use crate::error::LayoutMdError;
use crate::pipeline::fragments::PageImageSource;
use image::RgbaImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pixel size for a page of `w_pts` × `h_pts` points at `dpi`, with the
/// longest side capped at `max_side_px` preserving aspect ratio.
pub(crate) fn scaled_size(w_pts: f32, h_pts: f32, dpi: u32, max_side_px: u32) -> (u32, u32) {
    let scale = dpi as f32 / 72.0;
    let mut w = (w_pts * scale).round().max(1.0);
    let mut h = (h_pts * scale).round().max(1.0);
    let longest = w.max(h);
    let cap = max_side_px.max(1) as f32;
    if longest > cap {
        let shrink = cap / longest;
        w = (w * shrink).round().max(1.0);
        h = (h * shrink).round().max(1.0);
    }
    (w as u32, h as u32)
}

fn bind_pdfium() -> Option<Pdfium> {
    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(e) => {
            debug!(error = %e, "pdfium not available");
            None
        }
    }
}

/// Page render source backed by a PDF on disk.
pub struct PdfPageSource {
    pdf_path: PathBuf,
}

impl PdfPageSource {
    pub fn new(pdf_path: impl Into<PathBuf>) -> Self {
        Self {
            pdf_path: pdf_path.into(),
        }
    }
}

impl PageImageSource for PdfPageSource {
    fn render_page(&self, page_index: u32, width: u32, height: u32) -> Option<RgbaImage> {
        let pdfium = bind_pdfium()?;
        let document = match pdfium.load_pdf_from_file(&self.pdf_path, None) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.pdf_path.display(), error = %e, "cannot open PDF for render");
                return None;
            }
        };
        let page = document.pages().get(page_index as u16).ok()?;
        // Exact target size keeps the render aligned with the layout's
        // coordinate system, which the crop boxes are expressed in.
        let bitmap = page
            .render(width.max(1) as i32, height.max(1) as i32, None)
            .ok()?;
        Some(bitmap.as_image().to_rgba8())
    }
}

/// Render one page (0-based) to PNG bytes at `dpi`, longest side capped.
/// Used by the per-page image-mode rerun.
pub async fn render_page_png(
    pdf_path: &Path,
    page_index: u32,
    dpi: u32,
    max_side_px: u32,
) -> Result<Vec<u8>, LayoutMdError> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || render_page_png_blocking(&path, page_index, dpi, max_side_px))
        .await
        .map_err(|e| LayoutMdError::Internal(format!("render task: {e}")))?
}

fn render_page_png_blocking(
    pdf_path: &Path,
    page_index: u32,
    dpi: u32,
    max_side_px: u32,
) -> Result<Vec<u8>, LayoutMdError> {
    let pdfium = bind_pdfium().ok_or_else(|| {
        LayoutMdError::Pdf {
            path: pdf_path.to_path_buf(),
            detail: "pdfium library not available; page rerun needs a local render".into(),
        }
    })?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| LayoutMdError::Pdf {
            path: pdf_path.to_path_buf(),
            detail: e.to_string(),
        })?;
    let page = document
        .pages()
        .get(page_index as u16)
        .map_err(|e| LayoutMdError::Pdf {
            path: pdf_path.to_path_buf(),
            detail: format!("page {} not renderable: {e}", page_index + 1),
        })?;
    let (w, h) = scaled_size(page.width().value, page.height().value, dpi, max_side_px);
    let bitmap = page
        .render(w as i32, h as i32, None)
        .map_err(|e| LayoutMdError::Pdf {
            path: pdf_path.to_path_buf(),
            detail: format!("rendering page {}: {e}", page_index + 1),
        })?;
    let image = bitmap.as_image();
    debug!(page = page_index + 1, w, h, "rendered page for rerun");

    let mut bytes = Vec::new();
    image
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .map_err(|e| LayoutMdError::Image(format!("encoding rendered page: {e}")))?;
    Ok(bytes)
}
