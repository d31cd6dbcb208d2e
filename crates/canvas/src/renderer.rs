//! Chunk and overview compositing.
//!
//! A chunk composite places every tile of the chunk at its rounded rectangle,
//! starting from opaque white (the blank tile appearance) and only visiting
//! tiles that have a record. A tile that cannot be read or decoded is left
//! blank instead of failing the composite.
//!
//! The overview never touches tiles directly. Each chunk render also keeps a
//! copy downsampled to the chunk's rectangle in the overview, and the overview
//! pastes those cells together. A chunk holding tiles but no cell yet (after a
//! restart) is composited once on demand.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, OnceLock};

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use tesserae_ipc::ChunkCoord;
use tracing::{debug, warn};

use crate::coords::PixelRect;
use crate::storage::{CompositeKey, StorageError};
use crate::store::{TileRecord, TileStore};

/// Blank tile colour
pub const BLANK_RGBA: [u8; 4] = [255, 255, 255, 255];

/// Errors that fail a whole composite
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to encode composite: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Render task failed: {0}")]
    Task(String),
}

/// Produces encoded composites on demand.
///
/// Called from the blocking thread pool; implementations may take their time.
pub trait CompositeRenderer: Send + Sync + 'static {
    /// Composite the current state of `key` and encode it
    fn render(&self, key: CompositeKey) -> Result<Vec<u8>, RenderError>;

    /// Encoded all-blank composite for `key`
    fn blank(&self, key: CompositeKey) -> Result<Arc<[u8]>, RenderError>;
}

/// Composites tiles from a [`TileStore`]
pub struct ChunkRenderer {
    store: Arc<TileStore>,
    overview_cells: Mutex<HashMap<ChunkCoord, RgbaImage>>,
    blank_chunk: OnceLock<Arc<[u8]>>,
    blank_overview: OnceLock<Arc<[u8]>>,
}

impl std::fmt::Debug for ChunkRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRenderer")
            .field("geometry", self.store.geometry())
            .finish()
    }
}

impl ChunkRenderer {
    pub fn new(store: Arc<TileStore>) -> Self {
        Self {
            store,
            overview_cells: Mutex::new(HashMap::new()),
            blank_chunk: OnceLock::new(),
            blank_overview: OnceLock::new(),
        }
    }

    fn blank_raster(size: u32) -> RgbaImage {
        RgbaImage::from_pixel(size, size, Rgba(BLANK_RGBA))
    }

    /// Composite one chunk and refresh its overview cell
    pub fn render_chunk(&self, chunk: ChunkCoord) -> RgbaImage {
        let raster = self.composite_chunk(chunk);
        if let Some(cell) = self.overview_cell(chunk, &raster) {
            let mut cells = self.overview_cells.lock().expect("ChunkRenderer lock poisoned");
            cells.insert(chunk, cell);
        }
        raster
    }

    fn composite_chunk(&self, chunk: ChunkCoord) -> RgbaImage {
        let geometry = *self.store.geometry();
        let mut raster = Self::blank_raster(geometry.render().chunk_preview_size);

        let records = self.store.chunk_records(chunk);
        let placed = self.place_tiles(&mut raster, &records, |record| {
            geometry.tile_rect_in_chunk(record.tile)
        });

        debug!("Rendered chunk {} with {} tiles", chunk, placed);
        raster
    }

    /// Chunk composite scaled down to its rectangle in the overview
    fn overview_cell(&self, chunk: ChunkCoord, raster: &RgbaImage) -> Option<RgbaImage> {
        let rect = self.store.geometry().chunk_rect_in_overview(chunk);
        if rect.is_empty() {
            return None;
        }
        Some(imageops::resize(raster, rect.width, rect.height, FilterType::Lanczos3))
    }

    /// Assemble the overview from the chunk cells
    pub fn render_overview(&self) -> RgbaImage {
        let geometry = *self.store.geometry();
        let mut raster = Self::blank_raster(geometry.render().overview_size);

        let occupied = self.store.occupied_chunks();
        let missing: Vec<ChunkCoord> = {
            let cells = self.overview_cells.lock().expect("ChunkRenderer lock poisoned");
            occupied.into_iter().filter(|chunk| !cells.contains_key(chunk)).collect()
        };
        for chunk in &missing {
            let composite = self.composite_chunk(*chunk);
            if let Some(cell) = self.overview_cell(*chunk, &composite) {
                // A chunk render that finished meanwhile has the newer cell
                let mut cells = self.overview_cells.lock().expect("ChunkRenderer lock poisoned");
                cells.entry(*chunk).or_insert(cell);
            }
        }

        let cells = self.overview_cells.lock().expect("ChunkRenderer lock poisoned");
        for (chunk, cell) in cells.iter() {
            let rect = geometry.chunk_rect_in_overview(*chunk);
            imageops::replace(&mut raster, cell, rect.x as i64, rect.y as i64);
        }

        debug!(
            "Rendered overview from {} chunk cells ({} rebuilt)",
            cells.len(),
            missing.len()
        );
        raster
    }

    fn place_tiles<F>(&self, raster: &mut RgbaImage, records: &[TileRecord], rect_of: F) -> usize
    where
        F: Fn(&TileRecord) -> PixelRect,
    {
        let mut placed = 0;
        for record in records {
            let rect = rect_of(record);
            if rect.is_empty() {
                continue;
            }
            let Some(tile) = self.load_tile(record) else {
                continue;
            };
            let scaled = if tile.width() == rect.width && tile.height() == rect.height {
                tile
            } else {
                imageops::resize(&tile, rect.width, rect.height, FilterType::Lanczos3)
            };
            imageops::overlay(raster, &scaled, rect.x as i64, rect.y as i64);
            placed += 1;
        }
        placed
    }

    /// Decode one tile, `None` (rendered blank) when unreadable
    fn load_tile(&self, record: &TileRecord) -> Option<RgbaImage> {
        let bytes = match self.store.read_bytes(record) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                // Superseded or reset after the snapshot; a later pass picks it up.
                debug!("Tile {} v{} vanished during render", record.tile, record.version);
                return None;
            }
            Err(e) => {
                warn!("Failed to read tile {} for composite: {}", record.tile, e);
                return None;
            }
        };
        match image::load_from_memory_with_format(&bytes, ImageFormat::Png) {
            Ok(decoded) => Some(decoded.to_rgba8()),
            Err(e) => {
                warn!("Failed to decode tile {} for composite: {}", record.tile, e);
                None
            }
        }
    }
}

/// Encode a raster as PNG
pub fn encode_png(raster: &RgbaImage) -> Result<Vec<u8>, RenderError> {
    let mut buffer = Cursor::new(Vec::new());
    raster.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

impl CompositeRenderer for ChunkRenderer {
    fn render(&self, key: CompositeKey) -> Result<Vec<u8>, RenderError> {
        let raster = match key {
            CompositeKey::Chunk(chunk) => self.render_chunk(chunk),
            CompositeKey::Overview => self.render_overview(),
        };
        encode_png(&raster)
    }

    fn blank(&self, key: CompositeKey) -> Result<Arc<[u8]>, RenderError> {
        let render = self.store.geometry().render();
        let (cell, size) = match key {
            CompositeKey::Chunk(_) => (&self.blank_chunk, render.chunk_preview_size),
            CompositeKey::Overview => (&self.blank_overview, render.overview_size),
        };
        if let Some(bytes) = cell.get() {
            return Ok(bytes.clone());
        }
        let encoded: Arc<[u8]> = encode_png(&Self::blank_raster(size))?.into();
        Ok(cell.get_or_init(|| encoded).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ImageStorage, MemoryImageStorage};
    use crate::test_support::{small_geometry, solid_png};
    use tesserae_ipc::TileCoord;

    fn setup() -> (Arc<TileStore>, Arc<MemoryImageStorage>, ChunkRenderer) {
        let storage = Arc::new(MemoryImageStorage::new());
        let store = Arc::new(TileStore::new(small_geometry(), storage.clone()));
        let renderer = ChunkRenderer::new(store.clone());
        (store, storage, renderer)
    }

    fn decode(bytes: &[u8]) -> RgbaImage {
        image::load_from_memory(bytes).unwrap().to_rgba8()
    }

    #[test]
    fn test_empty_chunk_is_blank() {
        let (_, _, renderer) = setup();
        let raster = renderer.render_chunk(ChunkCoord::new(0, 0));
        assert_eq!(raster.dimensions(), (40, 40));
        assert!(raster.pixels().all(|p| p.0 == BLANK_RGBA));
    }

    #[test]
    fn test_tile_lands_in_its_rect() {
        let (store, _, renderer) = setup();
        // small geometry: 4px per tile in a 40px chunk composite
        store.put(13, 12, &solid_png(4, [255, 0, 0, 255])).unwrap();

        let raster = renderer.render_chunk(ChunkCoord::new(1, 1));
        assert_eq!(raster.get_pixel(13, 9).0, [255, 0, 0, 255]);
        assert_eq!(raster.get_pixel(12, 8).0, [255, 0, 0, 255]);
        assert_eq!(raster.get_pixel(11, 8).0, BLANK_RGBA);
        assert_eq!(raster.get_pixel(0, 0).0, BLANK_RGBA);

        // other chunks are unaffected
        let other = renderer.render_chunk(ChunkCoord::new(0, 0));
        assert!(other.pixels().all(|p| p.0 == BLANK_RGBA));
    }

    fn fill(store: &TileStore, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>, rgba: [u8; 4]) {
        let png = solid_png(4, rgba);
        for y in ys {
            for x in xs.clone() {
                store.put(x, y, &png).unwrap();
            }
        }
    }

    #[test]
    fn test_overview_rebuilds_cells_for_occupied_chunks() {
        let (store, _, renderer) = setup();
        fill(&store, 0..2, 0..2, [0, 0, 255, 255]);
        fill(&store, 18..20, 18..20, [0, 255, 0, 255]);

        // 40px overview over a 20-tile grid: 2px per tile, 20px per chunk
        let raster = renderer.render_overview();
        assert_eq!(raster.dimensions(), (40, 40));
        assert_eq!(raster.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(raster.get_pixel(39, 39).0, [0, 255, 0, 255]);
        assert_eq!(raster.get_pixel(20, 20).0, BLANK_RGBA);
        assert_eq!(raster.get_pixel(30, 5).0, BLANK_RGBA);
    }

    #[test]
    fn test_overview_follows_chunk_renders() {
        let (store, _, renderer) = setup();
        fill(&store, 10..12, 0..2, [0, 0, 255, 255]);
        assert_eq!(renderer.render_overview().get_pixel(20, 0).0, [0, 0, 255, 255]);

        fill(&store, 10..12, 0..2, [255, 0, 0, 255]);
        renderer.render_chunk(ChunkCoord::new(1, 0));
        assert_eq!(renderer.render_overview().get_pixel(20, 0).0, [255, 0, 0, 255]);

        for x in 10..12 {
            for y in 0..2 {
                store.delete(x, y).unwrap();
            }
        }
        renderer.render_chunk(ChunkCoord::new(1, 0));
        let raster = renderer.render_overview();
        assert!(raster.pixels().all(|p| p.0 == BLANK_RGBA));
    }

    #[test]
    fn test_corrupt_tile_rendered_blank() {
        let (store, storage, renderer) = setup();
        store.put(0, 0, &solid_png(4, [0, 0, 0, 255])).unwrap();
        store.put(1, 0, &solid_png(4, [0, 0, 0, 255])).unwrap();
        // Corrupt tile (1,0) behind the store's back
        storage
            .write_tile(TileCoord::new(1, 0), 1, b"\x89PNG garbage", None)
            .unwrap();

        let raster = renderer.render_chunk(ChunkCoord::new(0, 0));
        assert_eq!(raster.get_pixel(1, 1).0, [0, 0, 0, 255]);
        assert_eq!(raster.get_pixel(5, 1).0, BLANK_RGBA);
    }

    #[test]
    fn test_transparent_tile_composites_over_white() {
        let (store, _, renderer) = setup();
        store.put(0, 0, &solid_png(4, [0, 0, 0, 0])).unwrap();
        let raster = renderer.render_chunk(ChunkCoord::new(0, 0));
        assert_eq!(raster.get_pixel(0, 0).0, BLANK_RGBA);
    }

    #[test]
    fn test_render_encodes_png() {
        let (store, _, renderer) = setup();
        store.put(2, 2, &solid_png(4, [9, 8, 7, 255])).unwrap();
        let bytes = renderer.render(CompositeKey::Chunk(ChunkCoord::new(0, 0))).unwrap();
        assert!(bytes.starts_with(&crate::store::PNG_MAGIC));
        assert_eq!(decode(&bytes).get_pixel(9, 9).0, [9, 8, 7, 255]);

        let blank = renderer.blank(CompositeKey::Overview).unwrap();
        assert_eq!(decode(&blank).dimensions(), (40, 40));
        assert!(Arc::ptr_eq(&blank, &renderer.blank(CompositeKey::Overview).unwrap()));
    }
}
