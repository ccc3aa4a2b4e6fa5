//! Image format sniffing by magic bytes.

use cropscan_core::ImageFormat;

use crate::error::{StorageError, StorageResult};

/// Bytes retained from the start of an upload for sniffing.
pub const SNIFF_LEN: usize = 12;

pub fn detect_format(head: &[u8]) -> Option<ImageFormat> {
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(ImageFormat::Png)
    } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else if head.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else {
        None
    }
}

/// Accepts `image/*` and the generic binary type browsers send for unknown files.
pub fn validate_content_type(content_type: &str) -> StorageResult<()> {
    let normalized = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if normalized.starts_with("image/") || normalized == "application/octet-stream" {
        Ok(())
    } else {
        Err(StorageError::UnsupportedContentType(content_type.to_string()))
    }
}
