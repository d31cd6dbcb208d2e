//! The assembled canvas: tile store, composites, and live fan-out.
//!
//! Every committed tile change flows through one [`ChangeFanout`]: subscribers
//! of the tile's chunk get the update first, then the chunk is marked dirty.
//! Because a connection's outbox is FIFO, a viewer always receives a tile's
//! update before the `chunkReady` that includes it. The overview is assembled
//! from chunk composites, so each chunk commit marks it dirty in turn.

use std::sync::Arc;
use std::time::SystemTime;

use tesserae_config::{ConfigError, LevelThresholds, Settings};
use tesserae_ipc::{ChunkCoord, TileCoord, parse_chunk_ids};
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::coords::{Geometry, RenderLevel, select_level};
use crate::registry::{ConnectionId, Outbox, SubscriptionRegistry};
use crate::renderer::{ChunkRenderer, CompositeRenderer, RenderError};
use crate::scheduler::RenderScheduler;
use crate::storage::{CompositeKey, ImageStorage, StorageError};
use crate::store::{DeleteOutcome, Tile, TileChange, TileError, TileRecord, TileStore, TileWrite};

/// Errors surfaced by [`Canvas`]
#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Chunk {0} is outside the grid")]
    ChunkOutOfBounds(ChunkCoord),
}

/// Encoded composite as served to readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeView {
    /// 0 when never rendered
    pub version: u64,
    pub bytes: Arc<[u8]>,
    /// Tiles changed since this version was rendered
    pub stale: bool,
}

/// Version of a composite without its bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeVersion {
    pub version: u64,
    pub stale: bool,
}

/// Outcome of a subscribe or unsubscribe request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChange {
    /// Chunks that were valid, whether or not they changed anything
    pub accepted: Vec<ChunkCoord>,
    /// Identifiers that did not name a chunk of this grid
    pub rejected: Vec<String>,
}

/// Routes one committed change to viewers and to the scheduler
struct ChangeFanout {
    storage: Arc<dyn ImageStorage>,
    broadcaster: Arc<Broadcaster>,
    scheduler: RenderScheduler,
}

impl ChangeFanout {
    fn apply(&self, change: &TileChange) {
        match change.version {
            Some(version) => {
                let image = match &change.image {
                    Some(image) => Some(image.to_vec()),
                    None => self.load(change.tile, version),
                };
                match image {
                    Some(image) => {
                        self.broadcaster
                            .on_tile_written(change.tile, change.chunk, version, &image);
                    }
                    None => debug!("No bytes for tile {} v{}, skipping update", change.tile, version),
                }
            }
            None => {
                self.broadcaster.on_tile_reset(change.tile, change.chunk);
            }
        }
        self.scheduler.mark_dirty(CompositeKey::Chunk(change.chunk));
    }

    fn load(&self, tile: TileCoord, version: u64) -> Option<Vec<u8>> {
        match self.storage.read_tile(tile, version) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read tile {} for broadcast: {}", tile, e);
                None
            }
        }
    }
}

/// Owns every component of one canvas
pub struct Canvas {
    geometry: Geometry,
    levels: LevelThresholds,
    store: Arc<TileStore>,
    renderer: Arc<ChunkRenderer>,
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Arc<Broadcaster>,
    scheduler: RenderScheduler,
    _fanout: Arc<ChangeFanout>,
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("geometry", &self.geometry)
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Canvas {
    /// Open a canvas over `storage`, restoring tiles and composite versions.
    ///
    /// Must be called inside a tokio runtime; the render scheduler starts here.
    /// Nothing is marked dirty; call [`Canvas::reconcile`] or
    /// [`Canvas::render_all`] afterwards as needed.
    pub fn open(settings: &Settings, storage: Arc<dyn ImageStorage>) -> Result<Self, CanvasError> {
        settings.grid.validate()?;
        let geometry = Geometry::new(settings.grid, settings.render);

        let store = Arc::new(TileStore::open(geometry, storage.clone())?);
        let renderer = Arc::new(ChunkRenderer::new(store.clone()));
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let scheduler = RenderScheduler::start(
            settings.scheduler,
            renderer.clone(),
            storage.clone(),
            broadcaster.clone(),
        );
        scheduler.restore(&storage.list_composites()?);
        scheduler.add_commit_listener(|scheduler, key, _| {
            if let CompositeKey::Chunk(_) = key {
                scheduler.mark_dirty(CompositeKey::Overview);
            }
        });

        let fanout = Arc::new(ChangeFanout {
            storage,
            broadcaster: broadcaster.clone(),
            scheduler: scheduler.clone(),
        });
        // Weak, since the scheduler already reaches the store through the renderer
        let listener = Arc::downgrade(&fanout);
        store.add_change_listener(move |change| {
            if let Some(fanout) = listener.upgrade() {
                fanout.apply(change);
            }
        });

        info!(
            "Canvas opened: {}x{} tiles, {} chunks, {} edited tiles",
            settings.grid.grid_width,
            settings.grid.grid_height,
            settings.grid.chunks_x() * settings.grid.chunks_y(),
            store.tile_count()
        );

        Ok(Self {
            geometry,
            levels: settings.levels,
            store,
            renderer,
            registry,
            broadcaster,
            scheduler,
            _fanout: fanout,
        })
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline]
    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    #[inline]
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    #[inline]
    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    // ---- tiles ----

    /// Validate and store a tile; viewers and composites follow asynchronously
    pub fn write_tile(&self, x: u32, y: u32, bytes: &[u8]) -> Result<TileWrite, CanvasError> {
        Ok(self.store.put(x, y, bytes)?)
    }

    /// Reset a tile to blank; a no-op when it was never written
    pub fn reset_tile(&self, x: u32, y: u32) -> Result<DeleteOutcome, CanvasError> {
        Ok(self.store.delete(x, y)?)
    }

    pub fn tile(&self, x: u32, y: u32) -> Result<Option<Tile>, CanvasError> {
        Ok(self.store.get(x, y)?)
    }

    pub fn tile_metadata(&self, x: u32, y: u32) -> Result<Option<TileRecord>, CanvasError> {
        Ok(self.store.metadata(x, y)?)
    }

    /// Entry point for a tile layer that persists tiles on its own.
    ///
    /// The change is recorded in the tile index and then fanned out like a
    /// local write, so composites pick the tile up. The chunk is always derived
    /// from the coordinate. Returns `false` for a replayed or stale version and
    /// for a reset of a tile that has no record.
    pub fn notify_tile_changed(&self, change: &TileChange) -> Result<bool, CanvasError> {
        let chunk = self.geometry.chunk_of(change.tile);
        if chunk != change.chunk && self.geometry.contains(change.tile) {
            warn!(
                "Tile {} was reported in chunk {}, using {}",
                change.tile, change.chunk, chunk
            );
        }
        Ok(self
            .store
            .apply_external(change.tile, change.version, change.image.clone())?)
    }

    // ---- composites ----

    pub fn chunk_composite(&self, chunk: ChunkCoord) -> Result<CompositeView, CanvasError> {
        self.check_chunk(chunk)?;
        self.composite(CompositeKey::Chunk(chunk))
    }

    pub fn overview_composite(&self) -> Result<CompositeView, CanvasError> {
        self.composite(CompositeKey::Overview)
    }

    pub fn chunk_version(&self, chunk: ChunkCoord) -> Result<CompositeVersion, CanvasError> {
        self.check_chunk(chunk)?;
        Ok(self.version_of(CompositeKey::Chunk(chunk)))
    }

    pub fn overview_version(&self) -> CompositeVersion {
        self.version_of(CompositeKey::Overview)
    }

    fn version_of(&self, key: CompositeKey) -> CompositeVersion {
        let snapshot = self.scheduler.snapshot(key);
        CompositeVersion {
            version: snapshot.version,
            stale: snapshot.is_stale(),
        }
    }

    /// Latest committed composite; cache, then storage, then blank
    fn composite(&self, key: CompositeKey) -> Result<CompositeView, CanvasError> {
        let snapshot = self.scheduler.snapshot(key);
        let stale = snapshot.is_stale();

        if let Some(bytes) = snapshot.bytes {
            return Ok(CompositeView {
                version: snapshot.version,
                bytes,
                stale,
            });
        }

        if snapshot.version > 0 {
            match self.store.storage().read_composite(key, snapshot.version)? {
                Some(bytes) => {
                    let bytes: Arc<[u8]> = bytes.into();
                    self.scheduler.cache_bytes(key, snapshot.version, bytes.clone());
                    return Ok(CompositeView {
                        version: snapshot.version,
                        bytes,
                        stale,
                    });
                }
                None => {
                    warn!("Composite {} v{} missing from storage", key, snapshot.version);
                    self.scheduler.mark_dirty(key);
                    // Not the committed content, so it must not carry its version
                    return Ok(CompositeView {
                        version: 0,
                        bytes: self.renderer.blank(key)?,
                        stale: true,
                    });
                }
            }
        }

        Ok(CompositeView {
            version: 0,
            bytes: self.renderer.blank(key)?,
            stale,
        })
    }

    /// Mark dirty every composite older than the tiles it covers.
    ///
    /// Returns the number of chunks queued.
    pub fn reconcile(&self) -> usize {
        let mut dirty = 0;
        let mut newest: Option<SystemTime> = None;

        for chunk in self.store.occupied_chunks() {
            let Some(updated) = self.store.latest_update(chunk) else {
                continue;
            };
            newest = newest.max(Some(updated));

            let key = CompositeKey::Chunk(chunk);
            let rendered = self.scheduler.snapshot(key).rendered_at;
            if rendered.is_none_or(|rendered| rendered < updated) {
                self.scheduler.mark_dirty(key);
                dirty += 1;
            }
        }

        let overview_rendered = self.scheduler.snapshot(CompositeKey::Overview).rendered_at;
        let overview_behind = match (newest, overview_rendered) {
            (Some(updated), Some(rendered)) => rendered < updated,
            (Some(_), None) => true,
            (None, _) => false,
        };
        // Queued chunks mark the overview dirty when they commit
        if dirty == 0 && overview_behind {
            self.scheduler.mark_dirty(CompositeKey::Overview);
        }

        info!(
            "Reconciled composites: {} chunks queued, overview {}",
            dirty,
            if dirty > 0 || overview_behind { "queued" } else { "current" }
        );
        dirty
    }

    /// Queue every chunk for rendering; the overview follows their commits
    pub fn render_all(&self) {
        let mut count = 0;
        for chunk in self.geometry.all_chunks() {
            self.scheduler.mark_dirty(CompositeKey::Chunk(chunk));
            count += 1;
        }
        info!("Queued {} chunks for rendering", count);
    }

    // ---- viewers ----

    /// Register a live connection
    pub fn connect(&self, outbox: Outbox) -> ConnectionId {
        self.registry.register(outbox)
    }

    /// Drop a connection and all of its subscriptions
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.registry.remove_connection(id)
    }

    /// Subscribe to chunks named by `"cx:cy"` identifiers
    pub fn subscribe<S: AsRef<str>>(&self, id: ConnectionId, chunk_ids: &[S]) -> SubscriptionChange {
        let change = self.resolve_chunk_ids(chunk_ids);
        self.registry.subscribe(id, change.accepted.iter().copied());
        change
    }

    /// Unsubscribe from chunks named by `"cx:cy"` identifiers
    pub fn unsubscribe<S: AsRef<str>>(&self, id: ConnectionId, chunk_ids: &[S]) -> SubscriptionChange {
        let change = self.resolve_chunk_ids(chunk_ids);
        self.registry.unsubscribe(id, change.accepted.iter().copied());
        change
    }

    fn resolve_chunk_ids<S: AsRef<str>>(&self, chunk_ids: &[S]) -> SubscriptionChange {
        let (parsed, mut rejected) = parse_chunk_ids(chunk_ids);
        let mut accepted = Vec::with_capacity(parsed.len());
        for chunk in parsed {
            if self.geometry.contains_chunk(chunk) {
                accepted.push(chunk);
            } else {
                rejected.push(chunk.to_string());
            }
        }
        SubscriptionChange { accepted, rejected }
    }

    /// Chunks a viewer showing the tile rectangle `[min, max)` should watch
    pub fn visible_chunks(&self, min: TileCoord, max: TileCoord) -> Vec<ChunkCoord> {
        self.geometry.visible_chunks(min, max)
    }

    /// Tier to draw at the given on-screen density
    pub fn level_for(&self, screen_px_per_tile: f32) -> RenderLevel {
        select_level(&self.levels, screen_px_per_tile)
    }

    fn check_chunk(&self, chunk: ChunkCoord) -> Result<(), CanvasError> {
        if self.geometry.contains_chunk(chunk) {
            Ok(())
        } else {
            Err(CanvasError::ChunkOutOfBounds(chunk))
        }
    }
}
