//! In-process image storage for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tesserae_ipc::TileCoord;

use super::{CompositeKey, ImageStorage, StorageError, StoredComposite, StoredTile};

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    bytes: Vec<u8>,
    written_at: SystemTime,
}

/// Keeps every image in memory; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryImageStorage {
    tiles: RwLock<HashMap<TileCoord, Entry>>,
    composites: RwLock<HashMap<CompositeKey, Entry>>,
    fail_composite_writes: AtomicBool,
}

impl MemoryImageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent composite write fail until cleared
    pub fn set_fail_composite_writes(&self, fail: bool) {
        self.fail_composite_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of tiles currently stored
    pub fn tile_count(&self) -> usize {
        self.tiles.read().expect("MemoryImageStorage lock poisoned").len()
    }
}

impl ImageStorage for MemoryImageStorage {
    fn read_tile(&self, tile: TileCoord, version: u64) -> Result<Option<Vec<u8>>, StorageError> {
        let tiles = self.tiles.read().expect("MemoryImageStorage lock poisoned");
        Ok(tiles
            .get(&tile)
            .filter(|entry| entry.version == version)
            .map(|entry| entry.bytes.clone()))
    }

    fn write_tile(
        &self,
        tile: TileCoord,
        version: u64,
        bytes: &[u8],
        _replaces: Option<u64>,
    ) -> Result<(), StorageError> {
        let mut tiles = self.tiles.write().expect("MemoryImageStorage lock poisoned");
        tiles.insert(
            tile,
            Entry {
                version,
                bytes: bytes.to_vec(),
                written_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn remove_tile(&self, tile: TileCoord) -> Result<usize, StorageError> {
        let mut tiles = self.tiles.write().expect("MemoryImageStorage lock poisoned");
        Ok(usize::from(tiles.remove(&tile).is_some()))
    }

    fn list_tiles(&self) -> Result<Vec<StoredTile>, StorageError> {
        let tiles = self.tiles.read().expect("MemoryImageStorage lock poisoned");
        Ok(tiles
            .iter()
            .map(|(tile, entry)| StoredTile {
                tile: *tile,
                version: entry.version,
                updated_at: entry.written_at,
            })
            .collect())
    }

    fn write_composite(
        &self,
        key: CompositeKey,
        version: u64,
        bytes: &[u8],
        _replaces: Option<u64>,
    ) -> Result<(), StorageError> {
        if self.fail_composite_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("write of {key} refused")));
        }
        let mut composites = self.composites.write().expect("MemoryImageStorage lock poisoned");
        composites.insert(
            key,
            Entry {
                version,
                bytes: bytes.to_vec(),
                written_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn read_composite(&self, key: CompositeKey, version: u64) -> Result<Option<Vec<u8>>, StorageError> {
        let composites = self.composites.read().expect("MemoryImageStorage lock poisoned");
        Ok(composites
            .get(&key)
            .filter(|entry| entry.version == version)
            .map(|entry| entry.bytes.clone()))
    }

    fn list_composites(&self) -> Result<Vec<StoredComposite>, StorageError> {
        let composites = self.composites.read().expect("MemoryImageStorage lock poisoned");
        Ok(composites
            .iter()
            .map(|(key, entry)| StoredComposite {
                key: *key,
                version: entry.version,
                rendered_at: entry.written_at,
            })
            .collect())
    }
}
