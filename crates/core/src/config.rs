//! Global configuration constants for lsmvec.
//!
//! All tuning defaults, input validation limits, and on-disk file names are defined here.
//! These are compile-time constants; per-index runtime configuration is carried by
//! [`IndexMetadata`](crate::index::IndexMetadata).

/// Default number of bidirectional links per graph node on upper layers.
///
/// Layer 0 allows twice as many links. Higher values improve recall but
/// increase memory and build time. Typical range: 8–64. Default: 16.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default candidate list size used during graph construction and search.
///
/// Higher values produce a better graph and better recall at the cost of latency.
pub const DEFAULT_BEAM_WIDTH: usize = 100;

/// Default number of inserts/updates/deletes after which a full rebuild is due.
/// 0 disables the automatic trigger.
pub const DEFAULT_MUTATIONS_BEFORE_REBUILD: usize = 1_000;

/// Default capacity (entries) of the search-side location cache.
pub const DEFAULT_LOCATION_CACHE_SIZE: usize = 100_000;

/// Default capacity (entries) of the construction-side graph build cache.
pub const DEFAULT_GRAPH_BUILD_CACHE_SIZE: usize = 10_000;

/// Maximum number of layers in the hierarchical graph.
pub const GRAPH_MAX_LAYERS: usize = 16;

/// Seed used for level assignment, PQ sampling and k-means initialisation
/// when the caller does not provide one.
pub const DEFAULT_SEED: u64 = 0x5eed_1e55_0f_a11ce;

/// Default number of PQ subspaces. 0 means "derive from dimension"
/// (one subspace per 4 dimensions, at least 1).
pub const PQ_DEFAULT_SUBSPACES: usize = 0;

/// Default number of centroids per PQ subspace. Codes are stored as u8,
/// so this is also the upper bound.
pub const PQ_DEFAULT_CLUSTERS: usize = 256;

/// Upper bound on the number of centroids per subspace (u8 codes).
pub const PQ_MAX_CLUSTERS: usize = 256;

/// Default cap on the number of vectors sampled for PQ training.
pub const PQ_DEFAULT_TRAINING_LIMIT: usize = 100_000;

/// Number of Lloyd iterations after k-means++ seeding.
pub const PQ_KMEANS_ITERATIONS: usize = 15;

/// Maximum allowed embedding dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum number of results (`k`) per search request.
pub const MAX_K: usize = 10_000;

/// Maximum overquery factor accepted by search calls.
pub const MAX_OVERQUERY_FACTOR: usize = 1_024;

/// Number of graph expansions between two deadline checks in budgeted searches.
pub const BUDGET_CHECK_INTERVAL: usize = 64;

/// File name of the write-ahead log inside an index directory.
pub const WAL_FILE_NAME: &str = "wal.bin";

/// File name of the vector snapshot inside an index directory.
pub const VECTOR_SNAPSHOT_FILE_NAME: &str = "vectors.snap";

/// File name of the graph snapshot inside an index directory.
pub const GRAPH_SNAPSHOT_FILE_NAME: &str = "graph.snap";
