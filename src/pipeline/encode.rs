//! Image encoding: chunk `DynamicImage` → base64 PNG wrapped in `ImageData`.
//!
//! PNG is lossless; JPEG artefacts around thin table rules and small digits
//! make vision models misread cells. Chunks wider than `max_width` are
//! downscaled first to cut upload size and latency.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a chunk image as a base64 PNG ready for the VLM API.
pub fn encode_chunk(
    img: &DynamicImage,
    max_width: Option<u32>,
) -> Result<ImageData, image::ImageError> {
    let scaled = downscale(img, max_width);
    let img = scaled.as_ref().unwrap_or(img);

    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} chunk → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Resize to `max_width` keeping the aspect ratio; `None` when no resize is needed.
fn downscale(img: &DynamicImage, max_width: Option<u32>) -> Option<DynamicImage> {
    let max_w = max_width?;
    if img.width() <= max_w {
        return None;
    }
    let ratio = max_w as f64 / img.width() as f64;
    let new_h = ((img.height() as f64 * ratio).round() as u32).max(1);
    Some(img.resize_exact(max_w, new_h, FilterType::Lanczos3))
}
