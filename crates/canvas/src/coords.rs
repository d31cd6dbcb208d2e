//! Coordinate model: tile → chunk mapping, composite placement, and tier
//! selection. Everything here is a pure function of the configured geometry.

use std::ops::Range;

use tesserae_config::{GridConfig, LevelThresholds, RenderConfig};
use tesserae_ipc::{ChunkCoord, TileCoord};

/// Pixel rectangle inside a composite raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Which pre-composited tier a viewer should draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderLevel {
    /// Single grid-wide composite
    Overview,
    /// Per-chunk composites
    Chunk,
    /// Individual tiles
    Tile,
}

/// Choose the tier for a given on-screen density.
pub fn select_level(thresholds: &LevelThresholds, screen_px_per_tile: f32) -> RenderLevel {
    if screen_px_per_tile < thresholds.overview_max_px_per_tile {
        RenderLevel::Overview
    } else if screen_px_per_tile < thresholds.chunk_max_px_per_tile {
        RenderLevel::Chunk
    } else {
        RenderLevel::Tile
    }
}

/// Grid and composite geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    grid: GridConfig,
    render: RenderConfig,
}

impl Geometry {
    pub fn new(grid: GridConfig, render: RenderConfig) -> Self {
        Self { grid, render }
    }

    #[inline]
    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    #[inline]
    pub fn render(&self) -> &RenderConfig {
        &self.render
    }

    /// Edge of a tile raster in pixels
    #[inline]
    pub fn tile_size(&self) -> u32 {
        self.grid.tile_size
    }

    #[inline]
    pub fn contains(&self, tile: TileCoord) -> bool {
        tile.x < self.grid.grid_width && tile.y < self.grid.grid_height
    }

    #[inline]
    pub fn contains_chunk(&self, chunk: ChunkCoord) -> bool {
        chunk.cx < self.grid.chunks_x() && chunk.cy < self.grid.chunks_y()
    }

    /// Chunk owning a tile
    #[inline]
    pub fn chunk_of(&self, tile: TileCoord) -> ChunkCoord {
        ChunkCoord {
            cx: tile.x / self.grid.chunk_tile_span,
            cy: tile.y / self.grid.chunk_tile_span,
        }
    }

    /// Tile ranges (x, y) covered by a chunk
    pub fn chunk_tiles(&self, chunk: ChunkCoord) -> (Range<u32>, Range<u32>) {
        let span = self.grid.chunk_tile_span;
        let x0 = chunk.cx * span;
        let y0 = chunk.cy * span;
        (
            x0..(x0 + span).min(self.grid.grid_width),
            y0..(y0 + span).min(self.grid.grid_height),
        )
    }

    /// Every chunk in row-major order
    pub fn all_chunks(&self) -> impl Iterator<Item = ChunkCoord> + use<> {
        let chunks_x = self.grid.chunks_x();
        let chunks_y = self.grid.chunks_y();
        (0..chunks_y).flat_map(move |cy| (0..chunks_x).map(move |cx| ChunkCoord { cx, cy }))
    }

    /// Where a tile lands inside its chunk composite
    pub fn tile_rect_in_chunk(&self, tile: TileCoord) -> PixelRect {
        let span = self.grid.chunk_tile_span;
        let per_tile = self.render.chunk_preview_size as f64 / span as f64;
        let (x, width) = rounded_span(tile.x % span, per_tile);
        let (y, height) = rounded_span(tile.y % span, per_tile);
        PixelRect { x, y, width, height }
    }

    /// Where a tile lands inside the overview composite
    pub fn tile_rect_in_overview(&self, tile: TileCoord) -> PixelRect {
        let size = self.render.overview_size as f64;
        let (x, width) = rounded_span(tile.x, size / self.grid.grid_width as f64);
        let (y, height) = rounded_span(tile.y, size / self.grid.grid_height as f64);
        PixelRect { x, y, width, height }
    }

    /// Where a whole chunk lands inside the overview composite.
    ///
    /// Edges are rounded the same way as [`Geometry::tile_rect_in_overview`],
    /// so the rectangle is exactly the union of its tiles' rectangles.
    pub fn chunk_rect_in_overview(&self, chunk: ChunkCoord) -> PixelRect {
        let size = self.render.overview_size as f64;
        let (xs, ys) = self.chunk_tiles(chunk);
        let (x, width) = rounded_range(xs, size / self.grid.grid_width as f64);
        let (y, height) = rounded_range(ys, size / self.grid.grid_height as f64);
        PixelRect { x, y, width, height }
    }

    /// Chunks intersecting a tile-space rectangle, clamped to the grid.
    ///
    /// Bounds are inclusive of `min` and exclusive of `max`.
    pub fn visible_chunks(&self, min: TileCoord, max: TileCoord) -> Vec<ChunkCoord> {
        let x_end = max.x.min(self.grid.grid_width);
        let y_end = max.y.min(self.grid.grid_height);
        if min.x >= x_end || min.y >= y_end {
            return Vec::new();
        }

        let first = self.chunk_of(min);
        let last = self.chunk_of(TileCoord {
            x: x_end - 1,
            y: y_end - 1,
        });

        let mut chunks = Vec::new();
        for cy in first.cy..=last.cy {
            for cx in first.cx..=last.cx {
                chunks.push(ChunkCoord { cx, cy });
            }
        }
        chunks
    }
}

/// Start and length of cell `index` when cells are `per_cell` pixels wide.
/// Rounding both edges keeps neighbouring cells gap-free.
#[inline]
fn rounded_span(index: u32, per_cell: f64) -> (u32, u32) {
    let start = (index as f64 * per_cell).round() as u32;
    let end = ((index + 1) as f64 * per_cell).round() as u32;
    (start, end - start)
}

/// Start and length of the cells `range` when cells are `per_cell` pixels wide
#[inline]
fn rounded_range(range: Range<u32>, per_cell: f64) -> (u32, u32) {
    let start = (range.start as f64 * per_cell).round() as u32;
    let end = (range.end as f64 * per_cell).round() as u32;
    (start, end.saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> Geometry {
        Geometry::new(GridConfig::default(), RenderConfig::default())
    }

    #[test]
    fn test_chunk_of_reference_grid() {
        let geometry = reference();
        assert_eq!(geometry.chunk_of(TileCoord::new(512, 384)), ChunkCoord::new(5, 3));
        assert_eq!(geometry.chunk_of(TileCoord::new(0, 0)), ChunkCoord::new(0, 0));
        assert_eq!(geometry.chunk_of(TileCoord::new(999, 999)), ChunkCoord::new(9, 9));
    }

    #[test]
    fn test_bounds() {
        let geometry = reference();
        assert!(geometry.contains(TileCoord::new(999, 0)));
        assert!(!geometry.contains(TileCoord::new(1000, 0)));
        assert!(geometry.contains_chunk(ChunkCoord::new(9, 9)));
        assert!(!geometry.contains_chunk(ChunkCoord::new(10, 0)));
        assert_eq!(geometry.all_chunks().count(), 100);
    }

    #[test]
    fn test_chunk_tiles_range() {
        let (xs, ys) = reference().chunk_tiles(ChunkCoord::new(5, 3));
        assert_eq!(xs, 500..600);
        assert_eq!(ys, 300..400);
    }

    #[test]
    fn test_tile_rects_abut_without_gaps() {
        let geometry = reference();
        let mut expected_x = 0;
        for x in 0..100 {
            let rect = geometry.tile_rect_in_chunk(TileCoord::new(x, 0));
            assert_eq!(rect.x, expected_x);
            assert!(rect.width == 10 || rect.width == 11);
            expected_x = rect.x + rect.width;
        }
        assert_eq!(expected_x, 1024);
    }

    #[test]
    fn test_overview_rect() {
        let geometry = reference();
        let rect = geometry.tile_rect_in_overview(TileCoord::new(512, 384));
        assert_eq!(rect, PixelRect { x: 2048, y: 1536, width: 4, height: 4 });
    }

    #[test]
    fn test_chunk_rect_covers_its_tiles() {
        let geometry = Geometry::new(
            GridConfig {
                grid_width: 35,
                grid_height: 35,
                tile_size: 4,
                chunk_tile_span: 7,
            },
            RenderConfig {
                chunk_preview_size: 28,
                overview_size: 99,
            },
        );
        for chunk in geometry.all_chunks() {
            let rect = geometry.chunk_rect_in_overview(chunk);
            let (xs, ys) = geometry.chunk_tiles(chunk);
            let first = geometry.tile_rect_in_overview(TileCoord::new(xs.start, ys.start));
            let last = geometry.tile_rect_in_overview(TileCoord::new(xs.end - 1, ys.end - 1));
            assert_eq!((rect.x, rect.y), (first.x, first.y));
            assert_eq!(rect.x + rect.width, last.x + last.width);
            assert_eq!(rect.y + rect.height, last.y + last.height);
        }
        assert_eq!(
            geometry.chunk_rect_in_overview(ChunkCoord::new(4, 4)),
            PixelRect { x: 79, y: 79, width: 20, height: 20 }
        );
    }

    #[test]
    fn test_visible_chunks_clamped() {
        let geometry = reference();
        let chunks = geometry.visible_chunks(TileCoord::new(150, 950), TileCoord::new(260, 5000));
        assert_eq!(
            chunks,
            vec![ChunkCoord::new(1, 9), ChunkCoord::new(2, 9)]
        );
        assert!(geometry.visible_chunks(TileCoord::new(10, 10), TileCoord::new(10, 20)).is_empty());
    }

    #[test]
    fn test_select_level() {
        let thresholds = LevelThresholds::default();
        assert_eq!(select_level(&thresholds, 1.0), RenderLevel::Overview);
        assert_eq!(select_level(&thresholds, 10.24), RenderLevel::Chunk);
        assert_eq!(select_level(&thresholds, 32.0), RenderLevel::Tile);
    }
}
