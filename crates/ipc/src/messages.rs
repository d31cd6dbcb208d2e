//! Main message enums for communication between the server and viewers.

use serde::{Deserialize, Serialize};

use crate::error::IpcError;
use crate::ids::ChunkCoord;

/// Messages from a viewer to the server.
///
/// Chunk identifiers are kept as raw strings so that one malformed entry
/// does not invalidate the rest of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Start receiving updates for the listed chunks
    Subscribe {
        #[serde(alias = "chunkIds", default)]
        chunks: Vec<String>,
    },

    /// Stop receiving updates for the listed chunks
    Unsubscribe {
        #[serde(alias = "chunkIds", default)]
        chunks: Vec<String>,
    },
}

impl ClientMessage {
    /// Decode a message received as a text frame
    pub fn from_json(text: &str) -> Result<Self, IpcError> {
        serde_json::from_str(text).map_err(|e| IpcError::InvalidFormat(e.to_string()))
    }
}

/// Messages from the server to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// A tile was written; the new raster travels inline
    TileUpdate {
        x: u32,
        y: u32,
        chunk_id: ChunkCoord,
        version: u64,
        /// `data:image/png;base64,...`
        image: String,
    },

    /// A tile was reset to the blank default
    TileReset {
        x: u32,
        y: u32,
        chunk_id: ChunkCoord,
    },

    /// A chunk composite was regenerated
    ChunkReady { chunk_id: ChunkCoord, version: u64 },

    /// The overview composite was regenerated
    OverviewReady { version: u64 },

    /// A request could not be fully honoured
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Encode for a text frame
    pub fn to_json(&self) -> Result<String, IpcError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::TileUpdate { .. } => "tileUpdate",
            ServerMessage::TileReset { .. } => "tileReset",
            ServerMessage::ChunkReady { .. } => "chunkReady",
            ServerMessage::OverviewReady { .. } => "overviewReady",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_accepts_both_field_names() {
        let a = ClientMessage::from_json(r#"{"type":"subscribe","chunks":["0:0","1:0"]}"#).unwrap();
        let b = ClientMessage::from_json(r#"{"type":"subscribe","chunkIds":["0:0","1:0"]}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a,
            ClientMessage::Subscribe {
                chunks: vec!["0:0".into(), "1:0".into()]
            }
        );
    }

    #[test]
    fn test_unknown_type_is_invalid() {
        let err = ClientMessage::from_json(r#"{"type":"paint","chunks":[]}"#).unwrap_err();
        assert!(matches!(err, IpcError::InvalidFormat(_)));
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_tile_update_wire_shape() {
        let msg = ServerMessage::TileUpdate {
            x: 512,
            y: 384,
            chunk_id: ChunkCoord::new(5, 3),
            version: 1,
            image: "data:image/png;base64,AAAA".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tileUpdate",
                "x": 512,
                "y": 384,
                "chunkId": "5:3",
                "version": 1,
                "image": "data:image/png;base64,AAAA"
            })
        );
    }

    #[test]
    fn test_ready_wire_shapes() {
        let chunk = ServerMessage::ChunkReady {
            chunk_id: ChunkCoord::new(2, 7),
            version: 4,
        };
        let value: serde_json::Value = serde_json::from_str(&chunk.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "chunkReady", "chunkId": "2:7", "version": 4}));

        let overview = ServerMessage::OverviewReady { version: 9 };
        let value: serde_json::Value = serde_json::from_str(&overview.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "overviewReady", "version": 9}));
    }
}
