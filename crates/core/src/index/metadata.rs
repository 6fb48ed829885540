//! Index configuration, fixed at creation time.
//!
//! Only the graph settings can change afterwards, through
//! [`VectorIndex::reconfigure`](crate::index::VectorIndex::reconfigure), which
//! forces a full rebuild.

use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::{DistanceFunction, GraphConfig};
use crate::quantization::pq::PqParams;
use crate::quantization::QuantizationKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where an index keeps its log and snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// Volatile: nothing survives the process.
    InMemory,
    /// WAL and snapshots under this directory.
    Directory(PathBuf),
}

/// How automatic rebuilds run once the mutation threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RebuildMode {
    /// The committing thread rebuilds before applying the next mutation.
    #[default]
    Synchronous,
    /// The maintenance worker rebuilds while mutations continue.
    Background,
}

impl fmt::Display for RebuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RebuildMode::Synchronous => "synchronous",
            RebuildMode::Background => "background",
        })
    }
}

impl FromStr for RebuildMode {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(RebuildMode::Synchronous),
            "background" | "async" => Ok(RebuildMode::Background),
            other => Err(IndexError::InvalidArgument(format!(
                "unknown rebuild mode '{}'",
                other
            ))),
        }
    }
}

/// Graph settings that may be changed after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSettings {
    pub max_connections: usize,
    pub beam_width: usize,
    pub add_hierarchy: bool,
    pub store_vectors_in_graph: bool,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            max_connections: config::DEFAULT_MAX_CONNECTIONS,
            beam_width: config::DEFAULT_BEAM_WIDTH,
            add_hierarchy: true,
            store_vectors_in_graph: false,
        }
    }
}

impl GraphSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections < 2 {
            return Err(IndexError::InvalidArgument(format!(
                "max_connections must be at least 2, got {}",
                self.max_connections
            )));
        }
        if self.beam_width == 0 {
            return Err(IndexError::InvalidArgument(
                "beam_width must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything that defines an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub dimension: usize,
    pub distance: DistanceFunction,
    pub quantization: QuantizationKind,
    pub pq: PqParams,
    pub graph: GraphSettings,
    /// Mutations after which a rebuild is due. 0 disables automatic rebuilds.
    pub mutations_before_rebuild: usize,
    pub location_cache_size: usize,
    pub graph_build_cache_size: usize,
    pub rebuild_mode: RebuildMode,
    /// Seed for level assignment, PQ sampling and k-means initialization.
    pub seed: u64,
}

impl IndexMetadata {
    /// Defaults for an index of `dimension`-dimensional vectors.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            distance: DistanceFunction::Cosine,
            quantization: QuantizationKind::None,
            pq: PqParams::default(),
            graph: GraphSettings::default(),
            mutations_before_rebuild: config::DEFAULT_MUTATIONS_BEFORE_REBUILD,
            location_cache_size: config::DEFAULT_LOCATION_CACHE_SIZE,
            graph_build_cache_size: config::DEFAULT_GRAPH_BUILD_CACHE_SIZE,
            rebuild_mode: RebuildMode::default(),
            seed: config::DEFAULT_SEED,
        }
    }

    /// Build metadata from string options, as accepted at index creation.
    pub fn from_options<'a, I>(dimension: usize, options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut metadata = Self::new(dimension);
        for (key, value) in options {
            metadata.apply_option(key, value)?;
        }
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn with_distance(mut self, distance: DistanceFunction) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_quantization(mut self, kind: QuantizationKind) -> Self {
        self.quantization = kind;
        self
    }

    pub fn with_pq(mut self, pq: PqParams) -> Self {
        self.pq = pq;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.graph.max_connections = max_connections;
        self
    }

    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.graph.beam_width = beam_width;
        self
    }

    pub fn with_hierarchy(mut self, add_hierarchy: bool) -> Self {
        self.graph.add_hierarchy = add_hierarchy;
        self
    }

    pub fn with_vectors_in_graph(mut self, store_vectors_in_graph: bool) -> Self {
        self.graph.store_vectors_in_graph = store_vectors_in_graph;
        self
    }

    pub fn with_mutations_before_rebuild(mut self, mutations: usize) -> Self {
        self.mutations_before_rebuild = mutations;
        self
    }

    pub fn with_cache_sizes(mut self, location_cache_size: usize, graph_build_cache_size: usize) -> Self {
        self.location_cache_size = location_cache_size;
        self.graph_build_cache_size = graph_build_cache_size;
        self
    }

    pub fn with_rebuild_mode(mut self, mode: RebuildMode) -> Self {
        self.rebuild_mode = mode;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set one option by name. Keys are the creation-time option names.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "distance" | "distance_function" => self.distance = value.parse()?,
            "quantization" => self.quantization = value.parse()?,
            "max_connections" => self.graph.max_connections = parse_number(key, value)?,
            "beam_width" => self.graph.beam_width = parse_number(key, value)?,
            "add_hierarchy" => self.graph.add_hierarchy = parse_bool(key, value)?,
            "store_vectors_in_graph" => self.graph.store_vectors_in_graph = parse_bool(key, value)?,
            "mutations_before_rebuild" => self.mutations_before_rebuild = parse_number(key, value)?,
            "location_cache_size" => self.location_cache_size = parse_number(key, value)?,
            "graph_build_cache_size" => self.graph_build_cache_size = parse_number(key, value)?,
            "rebuild_mode" => self.rebuild_mode = value.parse()?,
            "seed" => self.seed = parse_number(key, value)?,
            "pq_subspaces" => self.pq.subspaces = parse_pq_number(key, value)?,
            "pq_clusters" => self.pq.clusters = parse_pq_number(key, value)?,
            "pq_training_limit" => self.pq.training_limit = parse_pq_number(key, value)?,
            "pq_center_globally" => {
                self.pq.center_globally = parse_bool(key, value)
                    .map_err(|e| IndexError::InvalidQuantizationConfig(e.to_string()))?
            }
            other => {
                return Err(IndexError::InvalidArgument(format!(
                    "unknown index option '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 || self.dimension > config::MAX_DIMENSION {
            return Err(IndexError::InvalidArgument(format!(
                "dimension must be in 1..={}, got {}",
                config::MAX_DIMENSION,
                self.dimension
            )));
        }
        self.graph.validate()?;
        if self.quantization == QuantizationKind::Product {
            self.pq.validate(self.dimension)?;
        }
        Ok(())
    }

    /// Check that an index persisted with `persisted` can be opened with `self`.
    ///
    /// Dimension, distance function and quantization must match. Graph settings,
    /// cache sizes and the rebuild policy are taken from `self`.
    pub fn check_compatible(&self, persisted: &IndexMetadata) -> Result<()> {
        if self.dimension != persisted.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: persisted.dimension,
                actual: self.dimension,
            });
        }
        if self.distance != persisted.distance {
            return Err(IndexError::InvalidDistanceFunction(format!(
                "index was created with {}, opened with {}",
                persisted.distance, self.distance
            )));
        }
        if self.quantization != persisted.quantization
            || (self.quantization == QuantizationKind::Product && self.pq != persisted.pq)
        {
            return Err(IndexError::InvalidQuantizationConfig(format!(
                "index was created with {} {:?}, opened with {} {:?}",
                persisted.quantization, persisted.pq, self.quantization, self.pq
            )));
        }
        Ok(())
    }

    /// Graph configuration derived from these settings.
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            dimension: self.dimension,
            distance: self.distance,
            max_connections: self.graph.max_connections,
            beam_width: self.graph.beam_width,
            add_hierarchy: self.graph.add_hierarchy,
            store_vectors_in_graph: self.graph.store_vectors_in_graph,
            max_layers: config::GRAPH_MAX_LAYERS,
            seed: self.seed,
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        IndexError::InvalidArgument(format!("option '{}' expects a number, got '{}'", key, value))
    })
}

fn parse_pq_number(key: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| {
        IndexError::InvalidQuantizationConfig(format!(
            "option '{}' expects a number, got '{}'",
            key, value
        ))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(IndexError::InvalidArgument(format!(
            "option '{}' expects a boolean, got '{}'",
            key, value
        ))),
    }
}
