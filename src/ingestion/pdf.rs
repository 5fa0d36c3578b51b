//! PDF rasterization via pdfium.

use std::io::Cursor;

use image::ImageFormat;
use pdfium_render::prelude::*;

use crate::domain::{ExpenseOpsError, Result};

use super::file_processor::{CanonicalImage, SourceKind};

/// Rendering resolution for the vision model input
pub const RENDER_DPI: f32 = 300.0;

/// Rasterize the first page of a PDF to a PNG canonical image.
///
/// Multi-page documents are rendered first-page-only by contract; a
/// zero-page document is corrupted.
pub fn rasterize_first_page(content: &[u8]) -> Result<CanonicalImage> {
    let pdfium = bind_pdfium()?;

    let document = pdfium
        .load_pdf_from_byte_slice(content, None)
        .map_err(|e| ExpenseOpsError::CorruptedFile(format!("pdf open: {}", e)))?;

    let pages = document.pages();
    if pages.len() == 0 {
        return Err(ExpenseOpsError::CorruptedFile(
            "pdf has zero pages".to_string(),
        ));
    }

    let page = pages
        .get(0)
        .map_err(|e| ExpenseOpsError::CorruptedFile(format!("pdf first page: {}", e)))?;

    // Page sizes are in points (1/72 inch); scale to the target DPI
    let scale = RENDER_DPI / 72.0;
    let config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .rotate_if_landscape(PdfPageRenderRotation::None, false);

    let bitmap = page
        .render_with_config(&config)
        .map_err(|e| ExpenseOpsError::CorruptedFile(format!("pdf render: {}", e)))?;

    let rendered = bitmap.as_image();
    let mut out = Vec::new();
    rendered
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| ExpenseOpsError::CorruptedFile(format!("png encode: {}", e)))?;

    Ok(CanonicalImage {
        width: rendered.width(),
        height: rendered.height(),
        bytes: out,
        source_kind: SourceKind::Pdf,
        mime: "image/png",
    })
}

fn bind_pdfium() -> Result<Pdfium> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| {
            ExpenseOpsError::internal(format!("pdfium library unavailable: {}", e))
        })?;
    Ok(Pdfium::new(bindings))
}
