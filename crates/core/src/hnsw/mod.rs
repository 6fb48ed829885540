//! Hierarchical Navigable Small World (HNSW) graph over record ids.
//!
//! The graph never owns the authoritative vectors. Construction reads them through
//! a [`VectorSource`]; search scores nodes through a caller-supplied closure, so the
//! same traversal serves every quantization kind. Deleted records stay in the graph
//! as tombstones until the next full rebuild.

/// Distance functions over dense and bit-packed vectors.
pub mod distance;
/// Graph arena, configuration and tombstones.
pub mod graph;
/// Two-phase insertion with heuristic pruning.
pub mod insert;
/// Single-layer beam search, multi-layer KNN, search budgets and visited tracking.
pub mod search;

pub use distance::DistanceFunction;
pub use graph::{GraphConfig, GraphIndex, VectorSource};
pub use insert::InsertPlan;
pub use search::{GraphSearch, SearchBudget};
