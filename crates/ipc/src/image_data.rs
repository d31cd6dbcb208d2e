//! Inline raster encoding used in tile updates.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::error::IpcError;

/// Prefix of every inline PNG.
pub const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Wrap PNG bytes in a data URL.
pub fn encode_png_data_url(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(PNG_DATA_URL_PREFIX.len() + bytes.len().div_ceil(3) * 4);
    out.push_str(PNG_DATA_URL_PREFIX);
    STANDARD.encode_string(bytes, &mut out);
    out
}

/// Recover PNG bytes from a data URL produced by [`encode_png_data_url`].
pub fn decode_png_data_url(url: &str) -> Result<Vec<u8>, IpcError> {
    let payload = url
        .strip_prefix(PNG_DATA_URL_PREFIX)
        .ok_or_else(|| IpcError::InvalidImage("missing png data url prefix".into()))?;
    STANDARD
        .decode(payload)
        .map_err(|e| IpcError::InvalidImage(e.to_string()))
}
