//! # lsmvec-core
//!
//! Persistent approximate nearest-neighbor index over dense `f32` vectors.
//!
//! Records are keyed by a caller-assigned [`RecordId`]. Writes go through a
//! write-ahead log before they reach the in-memory store, and are then applied
//! incrementally to a hierarchical navigable graph. A full rebuild, triggered
//! explicitly or after a configurable number of mutations, reclaims tombstones and
//! retrains the product-quantization codebook, then atomically publishes a new
//! graph generation while searches keep running on the old one.
//!
//! ```no_run
//! use lsmvec_core::{IndexMetadata, Storage, VectorIndex};
//!
//! let index = VectorIndex::create(IndexMetadata::new(3), Storage::InMemory)?;
//! index.put(1u64, &[0.1, 0.2, 0.3])?;
//! let hits = index.search(&[0.1, 0.2, 0.25], 5)?;
//! # Ok::<(), lsmvec_core::IndexError>(())
//! ```

/// Bounded LRU caches for search and graph construction.
pub mod cache;
/// Global configuration constants: limits, defaults, and file names.
pub mod config;
/// Error type and result alias.
pub mod error;
/// Navigable graph: arena, insertion, layered search and distance metrics.
pub mod hnsw;
/// The index itself: transactions, search, rebuilds and maintenance.
pub mod index;
/// Vector encodings: INT8 scalar, binary and product quantization.
pub mod quantization;
/// Record identity and search result types.
pub mod record;
/// Storage layer: vector store, write-ahead log, and snapshot persistence.
pub mod storage;

pub use error::{IndexError, Result};
pub use hnsw::{DistanceFunction, SearchBudget};
pub use index::{
    BuildHandle, BuildReport, GraphSettings, IndexMetadata, IndexState, IndexStats,
    IndexTransaction, RebuildMode, Storage, VectorIndex,
};
pub use quantization::{PqParams, QuantizationKind};
pub use record::{ApproximateResults, RecordId, SearchHit};
