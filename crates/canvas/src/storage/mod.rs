//! Image storage collaborators.
//!
//! Tile bytes and finished composites are addressed by key plus version so a
//! retrieval key changes whenever the content does. Only the newest version of
//! each key is retained.

mod fs;
mod memory;

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use tesserae_ipc::{ChunkCoord, TileCoord};

pub use fs::FsImageStorage;
pub use memory::MemoryImageStorage;

/// Identifies a derived composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompositeKey {
    Chunk(ChunkCoord),
    Overview,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositeKey::Chunk(chunk) => write!(f, "chunk {chunk}"),
            CompositeKey::Overview => f.write_str("overview"),
        }
    }
}

/// A tile found in storage during recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTile {
    pub tile: TileCoord,
    pub version: u64,
    pub updated_at: SystemTime,
}

/// A composite found in storage during recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredComposite {
    pub key: CompositeKey,
    pub version: u64,
    pub rendered_at: SystemTime,
}

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Raw byte storage for tiles and composites.
///
/// `replaces` names the version being superseded, if any, so backends can
/// drop it once the new bytes are durable.
pub trait ImageStorage: Send + Sync + 'static {
    /// Read the bytes of one tile version, `None` if absent
    fn read_tile(&self, tile: TileCoord, version: u64) -> Result<Option<Vec<u8>>, StorageError>;

    /// Persist a tile version
    fn write_tile(
        &self,
        tile: TileCoord,
        version: u64,
        bytes: &[u8],
        replaces: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Remove every stored version of a tile; returns how many were removed
    fn remove_tile(&self, tile: TileCoord) -> Result<usize, StorageError>;

    /// Every tile currently stored (newest version per coordinate)
    fn list_tiles(&self) -> Result<Vec<StoredTile>, StorageError>;

    /// Persist a finished composite
    fn write_composite(
        &self,
        key: CompositeKey,
        version: u64,
        bytes: &[u8],
        replaces: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Read a composite version, `None` if absent
    fn read_composite(&self, key: CompositeKey, version: u64) -> Result<Option<Vec<u8>>, StorageError>;

    /// Every composite currently stored (newest version per key)
    fn list_composites(&self) -> Result<Vec<StoredComposite>, StorageError>;
}
