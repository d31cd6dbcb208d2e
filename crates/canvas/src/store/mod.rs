//! Authoritative tile state.
//!
//! Only edited tiles have a record; absence means the blank default. Records
//! are grouped by owning chunk so composites can enumerate their tiles without
//! scanning the grid. Mutations of one coordinate are serialised by a striped
//! key lock, and listeners observe every committed change while that lock is
//! still held, so per-tile notifications arrive in version order.

mod validation;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use tesserae_ipc::{ChunkCoord, TileCoord};
use tracing::{debug, info, warn};

use crate::coords::Geometry;
use crate::storage::{ImageStorage, StorageError};

pub use validation::{MAX_TILE_BYTES, PNG_MAGIC, validate_tile_image};

const KEY_LOCK_STRIPES: usize = 64;
const READ_RETRIES: usize = 3;

/// Errors surfaced to the writer of a tile
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("Tile {x}:{y} is outside the grid")]
    OutOfBounds { x: u32, y: u32 },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Metadata of an edited tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub tile: TileCoord,
    pub chunk: ChunkCoord,
    pub version: u64,
    pub updated_at: SystemTime,
}

/// A tile record together with its raster bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub record: TileRecord,
    pub bytes: Vec<u8>,
}

/// Result of a successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWrite {
    pub tile: TileCoord,
    pub chunk: ChunkCoord,
    pub version: u64,
}

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A record existed and was removed
    Deleted { chunk: ChunkCoord, version: u64 },
    /// The tile was already at its default
    Noop,
}

impl DeleteOutcome {
    #[inline]
    pub fn deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted { .. })
    }
}

/// A committed change, handed to listeners
///
/// `version` is `None` when the tile was reset to default.
#[derive(Debug, Clone)]
pub struct TileChange {
    pub tile: TileCoord,
    pub chunk: ChunkCoord,
    pub version: Option<u64>,
    pub image: Option<Arc<[u8]>>,
}

type ChangeListener = Box<dyn Fn(&TileChange) + Send + Sync>;

/// Current state of every edited tile
pub struct TileStore {
    geometry: Geometry,
    storage: Arc<dyn ImageStorage>,
    chunks: RwLock<HashMap<ChunkCoord, BTreeMap<TileCoord, TileRecord>>>,
    key_locks: Box<[Mutex<()>]>,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl std::fmt::Debug for TileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listener_count = self.listeners.read().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("TileStore")
            .field("tile_count", &self.tile_count())
            .field("listener_count", &listener_count)
            .finish()
    }
}

impl TileStore {
    /// Create an empty store over the given storage
    pub fn new(geometry: Geometry, storage: Arc<dyn ImageStorage>) -> Self {
        let key_locks = (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            geometry,
            storage,
            chunks: RwLock::new(HashMap::new()),
            key_locks,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Create a store and rebuild its index from what storage already holds
    pub fn open(geometry: Geometry, storage: Arc<dyn ImageStorage>) -> Result<Self, StorageError> {
        let store = Self::new(geometry, storage);
        let stored = store.storage.list_tiles()?;
        let mut restored = 0usize;
        {
            let mut chunks = store.chunks.write().expect("TileStore lock poisoned");
            for entry in stored {
                if !geometry.contains(entry.tile) {
                    warn!("Ignoring stored tile {} outside the grid", entry.tile);
                    continue;
                }
                let chunk = geometry.chunk_of(entry.tile);
                chunks.entry(chunk).or_default().insert(
                    entry.tile,
                    TileRecord {
                        tile: entry.tile,
                        chunk,
                        version: entry.version,
                        updated_at: entry.updated_at,
                    },
                );
                restored += 1;
            }
        }
        info!("Restored {} tiles from storage", restored);
        Ok(store)
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub(crate) fn storage(&self) -> &Arc<dyn ImageStorage> {
        &self.storage
    }

    /// Register a listener for committed changes.
    ///
    /// Listeners run on the writer's thread while the tile's key lock is held
    /// and must not block.
    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn(&TileChange) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().expect("TileStore lock poisoned");
        listeners.push(Box::new(listener));
    }

    fn emit(&self, change: &TileChange) {
        let listeners = self.listeners.read().expect("TileStore lock poisoned");
        for listener in listeners.iter() {
            listener(change);
        }
    }

    fn key_lock(&self, tile: TileCoord) -> &Mutex<()> {
        let hash = (tile.x as usize).wrapping_mul(31).wrapping_add(tile.y as usize);
        &self.key_locks[hash % self.key_locks.len()]
    }

    fn check_bounds(&self, x: u32, y: u32) -> Result<TileCoord, TileError> {
        let tile = TileCoord { x, y };
        if self.geometry.contains(tile) {
            Ok(tile)
        } else {
            Err(TileError::OutOfBounds { x, y })
        }
    }

    fn record(&self, tile: TileCoord) -> Option<TileRecord> {
        let chunk = self.geometry.chunk_of(tile);
        let chunks = self.chunks.read().expect("TileStore lock poisoned");
        chunks.get(&chunk).and_then(|tiles| tiles.get(&tile)).cloned()
    }

    /// Validate and persist a tile raster, bumping its version
    pub fn put(&self, x: u32, y: u32, bytes: &[u8]) -> Result<TileWrite, TileError> {
        let tile = self.check_bounds(x, y)?;
        validate_tile_image(bytes, self.geometry.tile_size()).map_err(TileError::InvalidImage)?;
        let chunk = self.geometry.chunk_of(tile);

        let _guard = self.key_lock(tile).lock().expect("TileStore key lock poisoned");

        let previous = self.record(tile).map(|r| r.version);
        let version = previous.map_or(1, |v| v + 1);

        self.storage.write_tile(tile, version, bytes, previous)?;

        let record = TileRecord {
            tile,
            chunk,
            version,
            updated_at: SystemTime::now(),
        };
        {
            let mut chunks = self.chunks.write().expect("TileStore lock poisoned");
            chunks.entry(chunk).or_default().insert(tile, record);
        }

        debug!("Saved tile {} (version {})", tile, version);

        self.emit(&TileChange {
            tile,
            chunk,
            version: Some(version),
            image: Some(Arc::from(bytes)),
        });

        Ok(TileWrite {
            tile,
            chunk,
            version,
        })
    }

    /// Current record and bytes, `None` if the tile is at its default
    pub fn get(&self, x: u32, y: u32) -> Result<Option<Tile>, TileError> {
        let tile = self.check_bounds(x, y)?;

        for _ in 0..READ_RETRIES {
            let Some(record) = self.record(tile) else {
                return Ok(None);
            };
            if let Some(bytes) = self.storage.read_tile(tile, record.version)? {
                return Ok(Some(Tile { record, bytes }));
            }
            // A concurrent write superseded this version; look again.
        }

        // Fall back to a consistent read under the key lock.
        let _guard = self.key_lock(tile).lock().expect("TileStore key lock poisoned");
        match self.record(tile) {
            Some(record) => {
                let bytes = self.storage.read_tile(tile, record.version)?;
                Ok(bytes.map(|bytes| Tile { record, bytes }))
            }
            None => Ok(None),
        }
    }

    /// Metadata only, `None` if the tile is at its default
    pub fn metadata(&self, x: u32, y: u32) -> Result<Option<TileRecord>, TileError> {
        let tile = self.check_bounds(x, y)?;
        Ok(self.record(tile))
    }

    /// Reset a tile to its default, removing record and raster
    pub fn delete(&self, x: u32, y: u32) -> Result<DeleteOutcome, TileError> {
        let tile = self.check_bounds(x, y)?;
        let chunk = self.geometry.chunk_of(tile);

        let _guard = self.key_lock(tile).lock().expect("TileStore key lock poisoned");

        let Some(record) = self.record(tile) else {
            return Ok(DeleteOutcome::Noop);
        };

        self.storage.remove_tile(tile)?;
        {
            let mut chunks = self.chunks.write().expect("TileStore lock poisoned");
            if let Some(tiles) = chunks.get_mut(&chunk) {
                tiles.remove(&tile);
                if tiles.is_empty() {
                    chunks.remove(&chunk);
                }
            }
        }

        debug!("Deleted tile {}", tile);

        self.emit(&TileChange {
            tile,
            chunk,
            version: None,
            image: None,
        });

        Ok(DeleteOutcome::Deleted {
            chunk,
            version: record.version,
        })
    }

    /// Adopt a change that an outside tile layer has already persisted.
    ///
    /// The owning chunk is derived from the coordinate. A version no newer
    /// than the recorded one is ignored, as is a reset of a tile without a
    /// record. Returns whether the change was applied and announced.
    pub fn apply_external(
        &self,
        tile: TileCoord,
        version: Option<u64>,
        image: Option<Arc<[u8]>>,
    ) -> Result<bool, TileError> {
        let tile = self.check_bounds(tile.x, tile.y)?;
        let chunk = self.geometry.chunk_of(tile);

        let _guard = self.key_lock(tile).lock().expect("TileStore key lock poisoned");

        let current = self.record(tile).map(|r| r.version);
        match version {
            Some(version) => {
                if current.is_some_and(|current| current >= version) {
                    debug!(
                        "Ignoring tile {} v{}, already at v{}",
                        tile,
                        version,
                        current.unwrap_or_default()
                    );
                    return Ok(false);
                }
                let record = TileRecord {
                    tile,
                    chunk,
                    version,
                    updated_at: SystemTime::now(),
                };
                let mut chunks = self.chunks.write().expect("TileStore lock poisoned");
                chunks.entry(chunk).or_default().insert(tile, record);
            }
            None => {
                if current.is_none() {
                    return Ok(false);
                }
                let mut chunks = self.chunks.write().expect("TileStore lock poisoned");
                if let Some(tiles) = chunks.get_mut(&chunk) {
                    tiles.remove(&tile);
                    if tiles.is_empty() {
                        chunks.remove(&chunk);
                    }
                }
            }
        }

        debug!("Adopted external change to tile {}", tile);

        self.emit(&TileChange {
            tile,
            chunk,
            version,
            image,
        });
        Ok(true)
    }

    /// Snapshot of the records belonging to one chunk
    pub fn chunk_records(&self, chunk: ChunkCoord) -> Vec<TileRecord> {
        let chunks = self.chunks.read().expect("TileStore lock poisoned");
        chunks
            .get(&chunk)
            .map(|tiles| tiles.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Bytes for a record taken from a snapshot, `None` if superseded
    pub fn read_bytes(&self, record: &TileRecord) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage.read_tile(record.tile, record.version)
    }

    /// Most recent edit time of any tile in a chunk
    pub fn latest_update(&self, chunk: ChunkCoord) -> Option<SystemTime> {
        let chunks = self.chunks.read().expect("TileStore lock poisoned");
        chunks
            .get(&chunk)
            .and_then(|tiles| tiles.values().map(|r| r.updated_at).max())
    }

    /// Chunks that contain at least one edited tile
    pub fn occupied_chunks(&self) -> Vec<ChunkCoord> {
        let chunks = self.chunks.read().expect("TileStore lock poisoned");
        chunks.keys().copied().collect()
    }

    /// Total number of edited tiles
    pub fn tile_count(&self) -> usize {
        self.chunks
            .read()
            .map(|chunks| chunks.values().map(|t| t.len()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryImageStorage;
    use crate::test_support::{small_geometry, solid_png};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> (TileStore, Arc<MemoryImageStorage>) {
        let storage = Arc::new(MemoryImageStorage::new());
        let store = TileStore::new(small_geometry(), storage.clone());
        (store, storage)
    }

    #[test]
    fn test_put_then_get() {
        let (store, _) = store();
        let red = solid_png(4, [255, 0, 0, 255]);

        let write = store.put(12, 3, &red).unwrap();
        assert_eq!(write.version, 1);
        assert_eq!(write.chunk, ChunkCoord::new(1, 0));

        let tile = store.get(12, 3).unwrap().unwrap();
        assert_eq!(tile.bytes, red);
        assert_eq!(tile.record.version, 1);
        assert_eq!(tile.record.chunk, ChunkCoord::new(1, 0));
    }

    #[test]
    fn test_version_increments_by_one() {
        let (store, _) = store();
        for expected in 1..=5u64 {
            let shade = (expected * 40) as u8;
            let png = solid_png(4, [shade, shade, shade, 255]);
            let write = store.put(0, 0, &png).unwrap();
            assert_eq!(write.version, expected);
            let tile = store.get(0, 0).unwrap().unwrap();
            assert_eq!(tile.record.version, expected);
            assert_eq!(tile.bytes, png);
        }
    }

    #[test]
    fn test_get_default_is_none() {
        let (store, _) = store();
        assert!(store.get(5, 5).unwrap().is_none());
        assert!(store.metadata(5, 5).unwrap().is_none());
    }

    #[test]
    fn test_invalid_image_leaves_no_state() {
        let (store, storage) = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store.add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = store.put(1, 1, &solid_png(8, [0, 0, 0, 255])).unwrap_err();
        assert!(matches!(err, TileError::InvalidImage(_)));
        assert!(store.get(1, 1).unwrap().is_none());
        assert_eq!(storage.tile_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_out_of_bounds() {
        let (store, _) = store();
        let png = solid_png(4, [0, 0, 0, 255]);
        assert!(matches!(
            store.put(20, 0, &png),
            Err(TileError::OutOfBounds { x: 20, y: 0 })
        ));
        assert!(matches!(store.delete(0, 20), Err(TileError::OutOfBounds { .. })));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, storage) = store();
        assert_eq!(store.delete(3, 3).unwrap(), DeleteOutcome::Noop);

        store.put(3, 3, &solid_png(4, [0, 255, 0, 255])).unwrap();
        assert!(store.delete(3, 3).unwrap().deleted());
        assert_eq!(store.delete(3, 3).unwrap(), DeleteOutcome::Noop);

        assert!(store.get(3, 3).unwrap().is_none());
        assert_eq!(storage.tile_count(), 0);
        assert_eq!(store.tile_count(), 0);
        assert!(store.occupied_chunks().is_empty());
    }

    #[test]
    fn test_rewrite_after_delete_restarts_version() {
        let (store, _) = store();
        let png = solid_png(4, [10, 20, 30, 255]);
        store.put(7, 7, &png).unwrap();
        store.put(7, 7, &png).unwrap();
        store.delete(7, 7).unwrap();
        assert_eq!(store.put(7, 7, &png).unwrap().version, 1);
    }

    #[test]
    fn test_listeners_see_writes_and_resets() {
        let (store, _) = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.add_change_listener(move |change| {
            sink.lock().unwrap().push((change.tile, change.version, change.image.is_some()));
        });

        store.put(2, 2, &solid_png(4, [1, 2, 3, 255])).unwrap();
        store.delete(2, 2).unwrap();
        store.delete(2, 2).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (TileCoord::new(2, 2), Some(1), true),
                (TileCoord::new(2, 2), None, false),
            ]
        );
    }

    #[test]
    fn test_apply_external_updates_index() {
        let (store, storage) = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.add_change_listener(move |change| {
            sink.lock().unwrap().push((change.chunk, change.version));
        });

        let png = solid_png(4, [200, 0, 0, 255]);
        storage.write_tile(TileCoord::new(10, 0), 3, &png, None).unwrap();
        assert!(store.apply_external(TileCoord::new(10, 0), Some(3), None).unwrap());

        let tile = store.get(10, 0).unwrap().unwrap();
        assert_eq!(tile.record.chunk, ChunkCoord::new(1, 0));
        assert_eq!(tile.record.version, 3);
        assert_eq!(tile.bytes, png);
        assert_eq!(store.chunk_records(ChunkCoord::new(1, 0)).len(), 1);

        // Replayed or older versions change nothing
        assert!(!store.apply_external(TileCoord::new(10, 0), Some(3), None).unwrap());
        assert!(!store.apply_external(TileCoord::new(10, 0), Some(2), None).unwrap());

        assert!(store.apply_external(TileCoord::new(10, 0), None, None).unwrap());
        assert!(!store.apply_external(TileCoord::new(10, 0), None, None).unwrap());
        assert!(store.metadata(10, 0).unwrap().is_none());
        assert!(store.occupied_chunks().is_empty());

        assert!(matches!(
            store.apply_external(TileCoord::new(20, 0), Some(1), None),
            Err(TileError::OutOfBounds { x: 20, y: 0 })
        ));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ChunkCoord::new(1, 0), Some(3)), (ChunkCoord::new(1, 0), None)]
        );
    }

    #[test]
    fn test_concurrent_writes_same_key_linearize() {
        let (store, _) = store();
        let store = Arc::new(store);
        let versions = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                let versions = versions.clone();
                std::thread::spawn(move || {
                    let png = solid_png(4, [i * 30, 0, 0, 255]);
                    for _ in 0..10 {
                        let write = store.put(4, 4, &png).unwrap();
                        versions.lock().unwrap().push(write.version);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut versions = versions.lock().unwrap().clone();
        versions.sort_unstable();
        assert_eq!(versions, (1..=80).collect::<Vec<u64>>());
        assert_eq!(store.get(4, 4).unwrap().unwrap().record.version, 80);
    }

    #[test]
    fn test_open_restores_index() {
        let storage = Arc::new(MemoryImageStorage::new());
        let png = solid_png(4, [9, 9, 9, 255]);
        {
            let store = TileStore::new(small_geometry(), storage.clone());
            store.put(15, 15, &png).unwrap();
            store.put(15, 15, &png).unwrap();
            store.put(0, 19, &png).unwrap();
        }

        let reopened = TileStore::open(small_geometry(), storage).unwrap();
        assert_eq!(reopened.tile_count(), 2);
        assert_eq!(reopened.metadata(15, 15).unwrap().unwrap().version, 2);
        assert_eq!(reopened.put(15, 15, &png).unwrap().version, 3);
    }
}
