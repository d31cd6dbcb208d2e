//! Coordinate identifiers with the compact `"x:y"` text encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IpcError;

/// Position of a tile in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

/// Position of a chunk in the chunk grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChunkCoord {
    pub cx: u32,
    pub cy: u32,
}

impl TileCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl ChunkCoord {
    pub const fn new(cx: u32, cy: u32) -> Self {
        Self { cx, cy }
    }
}

fn parse_pair(s: &str) -> Result<(u32, u32), IpcError> {
    let invalid = || IpcError::InvalidCoordinate(s.to_string());
    let (a, b) = s.split_once(':').ok_or_else(invalid)?;
    let a = a.parse().map_err(|_| invalid())?;
    let b = b.parse().map_err(|_| invalid())?;
    Ok((a, b))
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.x, self.y)
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cx, self.cy)
    }
}

impl FromStr for TileCoord {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = parse_pair(s)?;
        Ok(Self { x, y })
    }
}

impl FromStr for ChunkCoord {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cx, cy) = parse_pair(s)?;
        Ok(Self { cx, cy })
    }
}

impl TryFrom<String> for TileCoord {
    type Error = IpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for ChunkCoord {
    type Error = IpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TileCoord> for String {
    fn from(value: TileCoord) -> Self {
        value.to_string()
    }
}

impl From<ChunkCoord> for String {
    fn from(value: ChunkCoord) -> Self {
        value.to_string()
    }
}

/// Split raw chunk identifiers into parsed coordinates and rejected strings.
pub fn parse_chunk_ids<S: AsRef<str>>(raw: &[S]) -> (Vec<ChunkCoord>, Vec<String>) {
    let mut parsed = Vec::with_capacity(raw.len());
    let mut rejected = Vec::new();
    for id in raw {
        match id.as_ref().parse() {
            Ok(coord) => parsed.push(coord),
            Err(_) => rejected.push(id.as_ref().to_string()),
        }
    }
    (parsed, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_display_and_parse() {
        let chunk = ChunkCoord::new(5, 3);
        assert_eq!(chunk.to_string(), "5:3");
        assert_eq!("5:3".parse::<ChunkCoord>().unwrap(), chunk);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("5".parse::<ChunkCoord>().is_err());
        assert!("5:".parse::<ChunkCoord>().is_err());
        assert!("a:3".parse::<TileCoord>().is_err());
        assert!("-1:3".parse::<TileCoord>().is_err());
        assert!("1:2:3".parse::<TileCoord>().is_err());
    }

    #[test]
    fn test_serde_uses_text_encoding() {
        let json = serde_json::to_string(&ChunkCoord::new(0, 9)).unwrap();
        assert_eq!(json, "\"0:9\"");
        let back: ChunkCoord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChunkCoord::new(0, 9));
    }

    #[test]
    fn test_parse_chunk_ids_partitions() {
        let (ok, bad) = parse_chunk_ids(&["1:1", "nope", "2:0"]);
        assert_eq!(ok, vec![ChunkCoord::new(1, 1), ChunkCoord::new(2, 0)]);
        assert_eq!(bad, vec!["nope".to_string()]);
    }
}
