//! Wire protocol for Tesserae
//!
//! Defines the message types exchanged between the server and viewers, the
//! `"x:y"` coordinate identifiers used in every payload, and the inline image
//! encoding carried by tile updates.

pub mod error;
pub mod ids;
pub mod image_data;
pub mod messages;

pub use error::IpcError;
pub use ids::{ChunkCoord, TileCoord, parse_chunk_ids};
pub use image_data::{PNG_DATA_URL_PREFIX, decode_png_data_url, encode_png_data_url};
pub use messages::{ClientMessage, ServerMessage};
