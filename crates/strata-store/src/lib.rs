//! Content-addressed layer cache, object store, and image registry for strata.
//!
//! This crate provides the storage layer: the `LayerCache` trait with an
//! on-disk implementation (`DiskLayerCache`, atomic writes and
//! first-writer-wins key binding) and an in-memory one (`MemoryLayerCache`),
//! a blake3 `ObjectStore` for layer archives, deterministic layer packing
//! with whiteout-aware application, LRU eviction that preserves lineage,
//! the `ImageStore` registry of assembled images, and store integrity checks.

pub mod cache;
pub mod gc;
pub mod images;
pub mod integrity;
pub mod layers;
pub mod layout;
pub mod memory;
pub mod objects;

pub use cache::{CacheEntry, CacheKey, DiskLayerCache, LayerCache};
pub use gc::{evict_lru, plan_eviction, EvictionReport, GarbageCollector, GcReport};
pub use images::{Image, ImageLayer, ImageStore};
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layers::{apply_layer, pack_layer, Layer, LayerSource, WHITEOUT_PREFIX};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use memory::MemoryLayerCache;
pub use objects::ObjectStore;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee rename durability without an explicit fsync
/// of the parent directory.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{hash}': expected {expected}, got {actual}")]
    IntegrityFailure {
        hash: String,
        expected: String,
        actual: String,
    },
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("layer not found: {0}")]
    LayerNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("ambiguous image prefix '{prefix}': matches {count} images")]
    AmbiguousImage { prefix: String, count: usize },
    #[error("layer {layer} does not belong to cache key {expected} (layer step is {found})")]
    KeyMismatch {
        layer: String,
        expected: String,
        found: String,
    },
    #[error("invalid layer {layer}: {reason}")]
    InvalidLayer { layer: String, reason: String },
    #[error("broken layer chain at {layer}: {reason}")]
    BrokenChain { layer: String, reason: String },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache state poisoned: {0}")]
    Poisoned(String),
}
