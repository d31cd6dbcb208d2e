//! Filesystem-backed image storage.
//!
//! Layout under the root directory:
//! - `tiles/{cx}/{cy}/{x}_{y}_v{version}.png`
//! - `chunks/{cx}_{cy}_v{version}.png`
//! - `overview/overview_v{version}.png`

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tesserae_ipc::{ChunkCoord, TileCoord};
use tracing::{debug, warn};

use super::{CompositeKey, ImageStorage, StorageError, StoredComposite, StoredTile};

const TILES_DIR: &str = "tiles";
const CHUNKS_DIR: &str = "chunks";
const OVERVIEW_DIR: &str = "overview";
const OVERVIEW_STEM: &str = "overview";

/// Stores images as PNG files in a hierarchical directory tree
#[derive(Debug, Clone)]
pub struct FsImageStorage {
    root: PathBuf,
    chunk_tile_span: u32,
}

impl FsImageStorage {
    /// Open (and create if needed) a storage root
    pub fn open(root: impl Into<PathBuf>, chunk_tile_span: u32) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [TILES_DIR, CHUNKS_DIR, OVERVIEW_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|source| StorageError::Io { path, source })?;
        }
        Ok(Self {
            root,
            chunk_tile_span: chunk_tile_span.max(1),
        })
    }

    fn tile_dir(&self, tile: TileCoord) -> PathBuf {
        let cx = tile.x / self.chunk_tile_span;
        let cy = tile.y / self.chunk_tile_span;
        self.root
            .join(TILES_DIR)
            .join(cx.to_string())
            .join(cy.to_string())
    }

    /// Path of one tile version
    pub fn tile_path(&self, tile: TileCoord, version: u64) -> PathBuf {
        self.tile_dir(tile)
            .join(format!("{}_{}_v{}.png", tile.x, tile.y, version))
    }

    /// Path of one composite version
    pub fn composite_path(&self, key: CompositeKey, version: u64) -> PathBuf {
        match key {
            CompositeKey::Chunk(chunk) => self
                .root
                .join(CHUNKS_DIR)
                .join(format!("{}_{}_v{}.png", chunk.cx, chunk.cy, version)),
            CompositeKey::Overview => self
                .root
                .join(OVERVIEW_DIR)
                .join(format!("{OVERVIEW_STEM}_v{version}.png")),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write through a temporary file so readers never see partial bytes
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = path.with_extension("png.tmp");
    fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn remove_optional(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Split `{stem}_v{version}.png` into stem and version
fn parse_versioned_name(name: &str) -> Option<(&str, u64)> {
    let base = name.strip_suffix(".png")?;
    let (stem, version) = base.rsplit_once("_v")?;
    Some((stem, version.parse().ok()?))
}

fn parse_pair(stem: &str) -> Option<(u32, u32)> {
    let (a, b) = stem.split_once('_')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn list_dir(path: &Path) -> Result<Vec<PathBuf>, StorageError> {
    match fs::read_dir(path) {
        Ok(entries) => {
            let mut paths = Vec::new();
            for entry in entries {
                paths.push(entry.map_err(io_err(path))?.path());
            }
            Ok(paths)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_err(path)(e)),
    }
}

impl ImageStorage for FsImageStorage {
    fn read_tile(&self, tile: TileCoord, version: u64) -> Result<Option<Vec<u8>>, StorageError> {
        read_optional(&self.tile_path(tile, version))
    }

    fn write_tile(
        &self,
        tile: TileCoord,
        version: u64,
        bytes: &[u8],
        replaces: Option<u64>,
    ) -> Result<(), StorageError> {
        let path = self.tile_path(tile, version);
        write_atomic(&path, bytes)?;
        debug!("Saved tile image: {}", path.display());

        if let Some(old) = replaces.filter(|old| *old != version) {
            remove_optional(&self.tile_path(tile, old))?;
        }
        Ok(())
    }

    fn remove_tile(&self, tile: TileCoord) -> Result<usize, StorageError> {
        let mut removed = 0;
        for file in list_dir(&self.tile_dir(tile))? {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((stem, _)) = parse_versioned_name(name) else {
                continue;
            };
            if parse_pair(stem) != Some((tile.x, tile.y)) {
                continue;
            }
            if remove_optional(&file)? {
                debug!("Deleted tile image: {}", file.display());
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn list_tiles(&self) -> Result<Vec<StoredTile>, StorageError> {
        let mut newest: HashMap<TileCoord, (u64, PathBuf)> = HashMap::new();

        for cx_dir in list_dir(&self.root.join(TILES_DIR))? {
            for cy_dir in list_dir(&cx_dir)? {
                for file in list_dir(&cy_dir)? {
                    let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let Some((stem, version)) = parse_versioned_name(name) else {
                        continue;
                    };
                    let Some((x, y)) = parse_pair(stem) else {
                        warn!("Ignoring unrecognised tile file {}", file.display());
                        continue;
                    };
                    let tile = TileCoord { x, y };
                    if newest.get(&tile).is_none_or(|(existing, _)| *existing < version) {
                        newest.insert(tile, (version, file));
                    }
                }
            }
        }

        Ok(newest
            .into_iter()
            .map(|(tile, (version, path))| StoredTile {
                tile,
                version,
                updated_at: modified(&path),
            })
            .collect())
    }

    fn write_composite(
        &self,
        key: CompositeKey,
        version: u64,
        bytes: &[u8],
        replaces: Option<u64>,
    ) -> Result<(), StorageError> {
        let path = self.composite_path(key, version);
        write_atomic(&path, bytes)?;
        debug!("Saved {} composite: {}", key, path.display());

        if let Some(old) = replaces.filter(|old| *old != version) {
            remove_optional(&self.composite_path(key, old))?;
        }
        Ok(())
    }

    fn read_composite(&self, key: CompositeKey, version: u64) -> Result<Option<Vec<u8>>, StorageError> {
        read_optional(&self.composite_path(key, version))
    }

    fn list_composites(&self) -> Result<Vec<StoredComposite>, StorageError> {
        let mut newest: HashMap<CompositeKey, (u64, PathBuf)> = HashMap::new();

        let chunk_files = list_dir(&self.root.join(CHUNKS_DIR))?;
        let overview_files = list_dir(&self.root.join(OVERVIEW_DIR))?;

        for file in chunk_files.into_iter().chain(overview_files) {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((stem, version)) = parse_versioned_name(name) else {
                continue;
            };
            let key = if stem == OVERVIEW_STEM {
                CompositeKey::Overview
            } else if let Some((cx, cy)) = parse_pair(stem) {
                CompositeKey::Chunk(ChunkCoord { cx, cy })
            } else {
                warn!("Ignoring unrecognised composite file {}", file.display());
                continue;
            };
            if newest.get(&key).is_none_or(|(existing, _)| *existing < version) {
                newest.insert(key, (version, file));
            }
        }

        Ok(newest
            .into_iter()
            .map(|(key, (version, path))| StoredComposite {
                key,
                version,
                rendered_at: modified(&path),
            })
            .collect())
    }
}
