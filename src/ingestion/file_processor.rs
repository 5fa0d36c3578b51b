use std::io::Cursor;

use image::imageops::FilterType;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::domain::{ExpenseOpsError, Result};
use crate::observability::{AuditKind, AuditLogger, CorrelationId};

use super::pdf;

/// Accepted input size range
pub const MIN_INPUT_BYTES: usize = 100;
pub const MAX_INPUT_BYTES: usize = 50 * 1024 * 1024;

/// Longest edge of the canonical image
pub const MAX_DIMENSION: u32 = 2048;

/// Detected artifact type, decided by magic bytes only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Jpeg,
    Png,
    Gif,
    Bmp,
    WebP,
    Pdf,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Jpeg => "jpeg",
            SourceKind::Png => "png",
            SourceKind::Gif => "gif",
            SourceKind::Bmp => "bmp",
            SourceKind::WebP => "webp",
            SourceKind::Pdf => "pdf",
        }
    }

    /// MIME type of the original artifact
    pub fn mime(&self) -> &'static str {
        match self {
            SourceKind::Jpeg => "image/jpeg",
            SourceKind::Png => "image/png",
            SourceKind::Gif => "image/gif",
            SourceKind::Bmp => "image/bmp",
            SourceKind::WebP => "image/webp",
            SourceKind::Pdf => "application/pdf",
        }
    }
}

/// Decodable raster suitable as vision-model input
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source_kind: SourceKind,
    /// MIME of `bytes` (differs from the source when re-encoded)
    pub mime: &'static str,
}

/// Sniff the artifact type from its leading bytes. Filename extensions play
/// no part in this decision.
pub fn detect_kind(bytes: &[u8]) -> Option<SourceKind> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(SourceKind::Jpeg)
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(SourceKind::Png)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(SourceKind::Gif)
    } else if bytes.starts_with(b"BM") {
        Some(SourceKind::Bmp)
    } else if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some(SourceKind::WebP)
    } else if bytes.starts_with(b"%PDF-") {
        Some(SourceKind::Pdf)
    } else {
        None
    }
}

/// Validates and normalizes receipt artifacts into canonical images
#[derive(Clone)]
pub struct FileProcessor {
    audit: AuditLogger,
}

impl FileProcessor {
    pub fn new(audit: AuditLogger) -> Self {
        Self { audit }
    }

    /// Detect, validate and convert an artifact to a canonical raster.
    ///
    /// PDFs are rasterized first-page-only at 300 DPI; oversized images are
    /// downscaled with Lanczos3 and re-encoded as PNG; in-range images pass
    /// through byte-identical (EXIF intact).
    pub async fn process(
        &self,
        content: Vec<u8>,
        correlation_id: &CorrelationId,
    ) -> Result<CanonicalImage> {
        match self.process_inner(content).await {
            Ok(image) => {
                debug!(
                    kind = image.source_kind.as_str(),
                    width = image.width,
                    height = image.height,
                    "artifact normalized"
                );
                Ok(image)
            }
            Err(e) => {
                self.audit.emit(
                    correlation_id,
                    AuditKind::FileReject,
                    json!({ "reason": e.kind(), "detail": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    async fn process_inner(&self, content: Vec<u8>) -> Result<CanonicalImage> {
        if content.len() < MIN_INPUT_BYTES || content.len() > MAX_INPUT_BYTES {
            return Err(ExpenseOpsError::InvalidSize {
                bytes: content.len(),
                min: MIN_INPUT_BYTES,
                max: MAX_INPUT_BYTES,
            });
        }

        let kind = detect_kind(&content).ok_or_else(|| {
            ExpenseOpsError::UnsupportedFormat(
                "magic bytes match no supported image or PDF type".to_string(),
            )
        })?;

        // Decode and resample off the async runtime
        tokio::task::spawn_blocking(move || match kind {
            SourceKind::Pdf => pdf::rasterize_first_page(&content),
            _ => normalize_image(content, kind),
        })
        .await
        .map_err(|e| ExpenseOpsError::internal(format!("blocking task failed: {}", e)))?
    }
}

fn normalize_image(content: Vec<u8>, kind: SourceKind) -> Result<CanonicalImage> {
    let decoded = image::load_from_memory(&content)
        .map_err(|e| ExpenseOpsError::CorruptedFile(format!("image decode: {}", e)))?;

    let (width, height) = (decoded.width(), decoded.height());
    if width <= MAX_DIMENSION && height <= MAX_DIMENSION {
        // Pass through unchanged; metadata survives untouched
        return Ok(CanonicalImage {
            bytes: content,
            width,
            height,
            source_kind: kind,
            mime: kind.mime(),
        });
    }

    let resized = decoded.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3);
    let mut out = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| ExpenseOpsError::CorruptedFile(format!("png encode: {}", e)))?;

    Ok(CanonicalImage {
        width: resized.width(),
        height: resized.height(),
        bytes: out,
        source_kind: kind,
        mime: "image/png",
    })
}
