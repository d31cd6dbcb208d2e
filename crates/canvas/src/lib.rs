//! Tesserae canvas core - tiles, composites, and live fan-out
//!
//! This crate holds everything between a tile write and the viewers watching it:
//! - [`coords`] - Tile → chunk mapping, composite placement, tier selection
//! - [`storage`] - Versioned image storage (filesystem and in-memory)
//! - [`store`] - Authoritative tile state with per-tile linearised writes
//! - [`renderer`] - Chunk and overview compositing
//! - [`scheduler`] - Coalescing render scheduler
//! - [`registry`] - Connection ↔ chunk subscription indices
//! - [`broadcaster`] - Non-blocking fan-out of change notifications
//! - [`pipeline`] - The assembled [`Canvas`]

pub mod broadcaster;
pub mod coords;
pub mod pipeline;
pub mod registry;
pub mod renderer;
pub mod scheduler;
pub mod storage;
pub mod store;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;

pub use broadcaster::*;
pub use coords::*;
pub use pipeline::*;
pub use registry::*;
pub use renderer::*;
pub use scheduler::*;
pub use storage::*;
pub use store::*;
