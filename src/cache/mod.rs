//! Response caches and the fetch strategies built on them.
//!
//! This module provides:
//! - Named, versioned response caches persisted in SQLite
//! - Cache-first, network-first, stale-while-revalidate and network-only
//!   strategies
//! - Version-driven cleanup of old cache generations

mod generation;
mod layer;
mod storage;
mod traits;

pub use generation::{CacheCategory, CacheGeneration, CacheNames, Cleanup};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedResponse, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Cacheable};
