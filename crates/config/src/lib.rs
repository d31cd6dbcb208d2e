//! Shared configuration for Tesserae
//!
//! This crate provides the single source of truth for grid geometry, render
//! sizes, scheduler and broadcast tuning, and server settings. Every value has
//! a default and can be overridden through a `TESSERAE_*` environment variable.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default grid width in tiles
pub const DEFAULT_GRID_WIDTH: u32 = 1000;

/// Default grid height in tiles
pub const DEFAULT_GRID_HEIGHT: u32 = 1000;

/// Default tile edge in pixels
pub const DEFAULT_TILE_SIZE: u32 = 32;

/// Default chunk edge in tiles (100 chunks over a 1000x1000 grid)
pub const DEFAULT_CHUNK_TILE_SPAN: u32 = 100;

/// Default chunk composite edge in pixels
pub const DEFAULT_CHUNK_PREVIEW_SIZE: u32 = 1024;

/// Default overview composite edge in pixels (4 pixels per tile)
pub const DEFAULT_OVERVIEW_SIZE: u32 = 4000;

/// Prefix shared by every environment variable this crate reads
pub const ENV_PREFIX: &str = "TESSERAE_";

/// Errors raised while loading or validating settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid grid geometry: {0}")]
    Geometry(String),
}

/// Grid dimensions and the chunk partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Grid width in tiles
    pub grid_width: u32,
    /// Grid height in tiles
    pub grid_height: u32,
    /// Edge of one tile raster in pixels
    pub tile_size: u32,
    /// Edge of one chunk in tiles
    pub chunk_tile_span: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_width: DEFAULT_GRID_WIDTH,
            grid_height: DEFAULT_GRID_HEIGHT,
            tile_size: DEFAULT_TILE_SIZE,
            chunk_tile_span: DEFAULT_CHUNK_TILE_SPAN,
        }
    }
}

impl GridConfig {
    /// Create a grid config, validating the chunk partition
    pub fn new(
        grid_width: u32,
        grid_height: u32,
        tile_size: u32,
        chunk_tile_span: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            grid_width,
            grid_height,
            tile_size,
            chunk_tile_span,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the chunk span evenly partitions the grid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(ConfigError::Geometry("grid dimensions must be non-zero".into()));
        }
        if self.tile_size == 0 {
            return Err(ConfigError::Geometry("tile size must be non-zero".into()));
        }
        if self.chunk_tile_span == 0 {
            return Err(ConfigError::Geometry("chunk tile span must be non-zero".into()));
        }
        if self.grid_width % self.chunk_tile_span != 0 || self.grid_height % self.chunk_tile_span != 0 {
            return Err(ConfigError::Geometry(format!(
                "grid {}x{} is not divisible by chunk span {}",
                self.grid_width, self.grid_height, self.chunk_tile_span
            )));
        }
        Ok(())
    }

    /// Number of chunks along x
    pub fn chunks_x(&self) -> u32 {
        self.grid_width / self.chunk_tile_span
    }

    /// Number of chunks along y
    pub fn chunks_y(&self) -> u32 {
        self.grid_height / self.chunk_tile_span
    }
}

/// Pixel sizes of the pre-composited tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Edge of a chunk composite in pixels
    pub chunk_preview_size: u32,
    /// Edge of the overview composite in pixels
    pub overview_size: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            chunk_preview_size: DEFAULT_CHUNK_PREVIEW_SIZE,
            overview_size: DEFAULT_OVERVIEW_SIZE,
        }
    }
}

/// Render scheduler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time a dirty chunk waits before its render starts
    pub chunk_debounce_ms: u64,
    /// Time a dirty overview waits before its render starts
    pub overview_debounce_ms: u64,
    /// Upper bound on composites rendered at the same time
    pub max_concurrent_renders: usize,
    /// Delay before retrying a failed render
    pub retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_debounce_ms: 100,
            overview_debounce_ms: 1000,
            max_concurrent_renders: 4,
            retry_delay_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Settings without any debounce, useful for tests
    pub fn immediate() -> Self {
        Self {
            chunk_debounce_ms: 0,
            overview_debounce_ms: 0,
            retry_delay_ms: 10,
            ..Self::default()
        }
    }
}

/// Per-connection delivery tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Messages buffered per connection before new ones are dropped
    pub outbox_capacity: usize,
    /// Longest a single socket send may take before the connection is closed
    pub send_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            send_timeout_ms: 5000,
        }
    }
}

/// Screen density thresholds for choosing which tier a client draws
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThresholds {
    /// Below this many screen pixels per tile, draw the overview
    pub overview_max_px_per_tile: f32,
    /// Below this many screen pixels per tile, draw chunk composites
    pub chunk_max_px_per_tile: f32,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            overview_max_px_per_tile: 6.0,
            chunk_max_px_per_tile: 16.0,
        }
    }
}

/// Network and process settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root directory of the image storage
    pub storage_path: String,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Re-render every chunk and the overview at startup
    pub render_on_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            storage_path: "storage".into(),
            log_level: "info".into(),
            render_on_start: false,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// All settings for one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub grid: GridConfig,
    pub render: RenderConfig,
    pub scheduler: SchedulerConfig,
    pub broadcast: BroadcastConfig,
    pub levels: LevelThresholds,
    pub server: ServerConfig,
}

impl Settings {
    /// Load settings from `TESSERAE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup
    ///
    /// Keys are passed with the `TESSERAE_` prefix already applied.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Settings::default();

        let grid = GridConfig::new(
            env.read("GRID_WIDTH", defaults.grid.grid_width)?,
            env.read("GRID_HEIGHT", defaults.grid.grid_height)?,
            env.read("TILE_SIZE", defaults.grid.tile_size)?,
            env.read("CHUNK_TILE_SPAN", defaults.grid.chunk_tile_span)?,
        )?;

        let render = RenderConfig {
            chunk_preview_size: env.read("CHUNK_PREVIEW_SIZE", defaults.render.chunk_preview_size)?,
            overview_size: env.read("OVERVIEW_SIZE", defaults.render.overview_size)?,
        };
        if render.chunk_preview_size == 0 || render.overview_size == 0 {
            return Err(ConfigError::Geometry("composite sizes must be non-zero".into()));
        }

        let scheduler = SchedulerConfig {
            chunk_debounce_ms: env.read("CHUNK_DEBOUNCE_MS", defaults.scheduler.chunk_debounce_ms)?,
            overview_debounce_ms: env.read(
                "OVERVIEW_DEBOUNCE_MS",
                defaults.scheduler.overview_debounce_ms,
            )?,
            max_concurrent_renders: env
                .read("MAX_CONCURRENT_RENDERS", defaults.scheduler.max_concurrent_renders)?
                .max(1),
            retry_delay_ms: env.read("RETRY_DELAY_MS", defaults.scheduler.retry_delay_ms)?,
        };

        let broadcast = BroadcastConfig {
            outbox_capacity: env
                .read("OUTBOX_CAPACITY", defaults.broadcast.outbox_capacity)?
                .max(1),
            send_timeout_ms: env.read("SEND_TIMEOUT_MS", defaults.broadcast.send_timeout_ms)?,
        };

        let levels = LevelThresholds {
            overview_max_px_per_tile: env.read(
                "OVERVIEW_MAX_PX_PER_TILE",
                defaults.levels.overview_max_px_per_tile,
            )?,
            chunk_max_px_per_tile: env.read(
                "CHUNK_MAX_PX_PER_TILE",
                defaults.levels.chunk_max_px_per_tile,
            )?,
        };

        let server = ServerConfig {
            host: env.read("HOST", defaults.server.host)?,
            port: env.read("PORT", defaults.server.port)?,
            storage_path: env.read("STORAGE_PATH", defaults.server.storage_path)?,
            log_level: env.read("LOG_LEVEL", defaults.server.log_level)?,
            render_on_start: env.read("RENDER_ON_START", defaults.server.render_on_start)?,
        };

        Ok(Self {
            grid,
            render,
            scheduler,
            broadcast,
            levels,
            server,
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn read<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        let key = format!("{ENV_PREFIX}{name}");
        match (self.lookup)(&key) {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key,
                value: raw,
            }),
            None => Ok(default),
        }
    }
}
