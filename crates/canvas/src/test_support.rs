//! Helpers shared by unit tests and downstream integration tests.

use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};
use tesserae_config::{GridConfig, RenderConfig, SchedulerConfig, Settings};

use crate::coords::Geometry;

/// Encode a `size`×`size` PNG filled with one colour
pub fn solid_png(size: u32, rgba: [u8; 4]) -> Vec<u8> {
    let raster = RgbaImage::from_pixel(size, size, Rgba(rgba));
    let mut buffer = Cursor::new(Vec::new());
    raster
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encoding a solid PNG cannot fail");
    buffer.into_inner()
}

/// 20×20 grid of 4px tiles in 10-tile chunks, with 40px composites
pub fn small_geometry() -> Geometry {
    Geometry::new(
        GridConfig {
            grid_width: 20,
            grid_height: 20,
            tile_size: 4,
            chunk_tile_span: 10,
        },
        RenderConfig {
            chunk_preview_size: 40,
            overview_size: 40,
        },
    )
}

/// Settings over [`small_geometry`] with no render debounce
pub fn small_settings() -> Settings {
    let geometry = small_geometry();
    Settings {
        grid: *geometry.grid(),
        render: *geometry.render(),
        scheduler: SchedulerConfig::immediate(),
        ..Settings::default()
    }
}
