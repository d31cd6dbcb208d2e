//! Validation of submitted tile rasters.

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

/// PNG signature bytes
pub const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Largest accepted encoded tile
pub const MAX_TILE_BYTES: usize = 50 * 1024;

/// Check that `bytes` is a PNG decoding to exactly `tile_size`×`tile_size`.
///
/// Dimensions come from the header; the pixel data is only decoded once they
/// match. Returns a human-readable reason on rejection.
pub fn validate_tile_image(bytes: &[u8], tile_size: u32) -> Result<(), String> {
    if bytes.is_empty() {
        return Err("no image data provided".into());
    }
    if bytes.len() < PNG_MAGIC.len() {
        return Err("image data too small".into());
    }
    if !bytes.starts_with(&PNG_MAGIC) {
        return Err("invalid image format, must be PNG".into());
    }
    if bytes.len() > MAX_TILE_BYTES {
        return Err(format!(
            "image too large, maximum size is {}KB",
            MAX_TILE_BYTES / 1024
        ));
    }

    let (width, height) = ImageReader::with_format(Cursor::new(bytes), ImageFormat::Png)
        .into_dimensions()
        .map_err(|e| format!("invalid PNG image: {e}"))?;

    if width != tile_size || height != tile_size {
        return Err(format!(
            "image must be exactly {tile_size}x{tile_size} pixels, got {width}x{height}"
        ));
    }

    image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .map_err(|e| format!("invalid PNG image: {e}"))?;
    Ok(())
}
