//! Graph structure and configuration.
//!
//! [`GraphConfig`] defines tuning parameters (max connections, beam width, hierarchy).
//! [`GraphIndex`] stores the graph as a Struct-of-Arrays arena indexed by `u32` node
//! ids: neighbor lists hold node ids, never references, so cycles in the graph are
//! just numbers. Node ids are assigned in insertion order and never reused; a
//! deleted record leaves a tombstoned node behind until the next full rebuild.

use crate::config;
use crate::hnsw::distance::DistanceFunction;
use crate::record::RecordId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration parameters for a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub dimension: usize,
    pub distance: DistanceFunction,
    /// Links per node on upper layers. Layer 0 allows twice as many.
    pub max_connections: usize,
    /// Candidate list size during construction and search.
    pub beam_width: usize,
    /// Multi-layer graph when true, flat single-layer graph otherwise.
    pub add_hierarchy: bool,
    /// Keep a copy of each live node's vector inside the graph.
    pub store_vectors_in_graph: bool,
    pub max_layers: usize,
    /// Seed for level assignment.
    pub seed: u64,
}

impl GraphConfig {
    pub fn new(dimension: usize, distance: DistanceFunction) -> Self {
        Self {
            dimension,
            distance,
            max_connections: config::DEFAULT_MAX_CONNECTIONS,
            beam_width: config::DEFAULT_BEAM_WIDTH,
            add_hierarchy: true,
            store_vectors_in_graph: false,
            max_layers: config::GRAPH_MAX_LAYERS,
            seed: config::DEFAULT_SEED,
        }
    }

    /// Adjacency bound for `layer`.
    #[inline]
    pub fn connection_bound(&self, layer: usize) -> usize {
        if layer == 0 {
            self.max_connections * 2
        } else {
            self.max_connections
        }
    }
}

/// Source of full-precision vectors for graph construction.
///
/// Returns `None` when the record no longer exists at `version`.
pub trait VectorSource {
    fn full_vector(&self, id: RecordId, version: u64) -> Option<Arc<[f32]>>;
}

impl<F> VectorSource for F
where
    F: Fn(RecordId, u64) -> Option<Arc<[f32]>>,
{
    fn full_vector(&self, id: RecordId, version: u64) -> Option<Arc<[f32]>> {
        self(id, version)
    }
}

/// Graph arena using Struct-of-Arrays layout.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphIndex {
    pub config: GraphConfig,
    ids: Vec<RecordId>,
    versions: Vec<u64>,
    layers: Vec<u8>,
    neighbors: Vec<Vec<Vec<u32>>>, // [node][layer][neighbor ids]
    deleted: Vec<bool>,
    /// Live node of each record.
    node_of: HashMap<RecordId, u32>,
    entry_point: Option<u32>,
    max_layer: usize,
    live_count: usize,
    /// Vector copies (`store_vectors_in_graph`). Never serialized; refilled from
    /// the store after a snapshot is loaded.
    #[serde(skip)]
    vectors: Vec<Option<Arc<[f32]>>>,
}

impl GraphIndex {
    /// Creates a new empty graph.
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            ids: Vec::new(),
            versions: Vec::new(),
            layers: Vec::new(),
            neighbors: Vec::new(),
            deleted: Vec::new(),
            node_of: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            live_count: 0,
            vectors: Vec::new(),
        }
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Number of node slots, including tombstones.
    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.node_count() - self.live_count
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    #[inline]
    pub fn record_id(&self, node: u32) -> RecordId {
        self.ids[node as usize]
    }

    #[inline]
    pub fn version(&self, node: u32) -> u64 {
        self.versions[node as usize]
    }

    #[inline]
    pub fn is_deleted(&self, node: u32) -> bool {
        self.deleted[node as usize]
    }

    #[inline]
    pub fn layer_of(&self, node: u32) -> usize {
        self.layers[node as usize] as usize
    }

    /// Neighbor list of `node` at `layer` (empty above the node's level).
    #[inline]
    pub fn neighbors(&self, node: u32, layer: usize) -> &[u32] {
        self.neighbors[node as usize]
            .get(layer)
            .map_or(&[], |l| l.as_slice())
    }

    /// Live node currently holding `id`.
    pub fn node_of(&self, id: RecordId) -> Option<u32> {
        self.node_of.get(&id).copied()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.node_of.contains_key(&id)
    }

    /// Version of the live node holding `id`.
    pub fn live_version(&self, id: RecordId) -> Option<u64> {
        self.node_of(id).map(|n| self.version(n))
    }

    /// Iterate `(record, version)` of every live node.
    pub fn live_records(&self) -> impl Iterator<Item = (RecordId, u64)> + '_ {
        self.node_of.values().map(|&n| (self.record_id(n), self.version(n)))
    }

    /// Vector copy held by the graph, if `store_vectors_in_graph` is on.
    #[inline]
    pub fn vector_copy(&self, node: u32) -> Option<&Arc<[f32]>> {
        self.vectors.get(node as usize).and_then(Option::as_ref)
    }

    /// Number of vector copies currently held.
    pub fn vector_copy_count(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }

    /// Full-precision vector of `node`: the graph copy when present, the source otherwise.
    pub(crate) fn full_vector<S: VectorSource + ?Sized>(
        &self,
        node: u32,
        source: &S,
    ) -> Option<Arc<[f32]>> {
        if self.is_deleted(node) {
            return None;
        }
        if let Some(v) = self.vector_copy(node) {
            return Some(Arc::clone(v));
        }
        source.full_vector(self.record_id(node), self.version(node))
    }

    /// Deterministic level for a record: geometric distribution with
    /// `mL = 1 / ln(M)`, derived from the seed, the record and its version.
    pub fn random_level(&self, id: RecordId, version: u64) -> usize {
        if !self.config.add_hierarchy {
            return 0;
        }
        let mixed = self.config.seed
            ^ id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ version.rotate_left(32);
        let mut rng = StdRng::seed_from_u64(mixed);
        let ml = 1.0 / (self.config.max_connections.max(2) as f64).ln();
        let r: f64 = rng.gen::<f64>();
        let level = (-(1.0 - r).ln() * ml).floor() as usize;
        level.min(self.config.max_layers.saturating_sub(1))
    }

    /// Push a new node slot. Returns its id. Adjacency is filled by the caller.
    pub(crate) fn push_node(
        &mut self,
        id: RecordId,
        version: u64,
        level: usize,
        vector: Option<Arc<[f32]>>,
    ) -> u32 {
        let node = self.ids.len() as u32;
        self.ids.push(id);
        self.versions.push(version);
        self.layers.push(level as u8);
        self.neighbors.push(vec![Vec::new(); level + 1]);
        self.deleted.push(false);
        self.vectors
            .push(if self.config.store_vectors_in_graph { vector } else { None });
        self.node_of.insert(id, node);
        self.live_count += 1;
        node
    }

    pub(crate) fn neighbors_mut(&mut self, node: u32, layer: usize) -> &mut Vec<u32> {
        &mut self.neighbors[node as usize][layer]
    }

    pub(crate) fn set_entry_point(&mut self, node: u32, layer: usize) {
        self.entry_point = Some(node);
        self.max_layer = layer;
    }

    /// Tombstone the live node of `id`. Its vector copy is dropped at once;
    /// edges pointing at it are pruned lazily. Returns the tombstoned node.
    pub fn mark_deleted(&mut self, id: RecordId) -> Option<u32> {
        let node = self.node_of.remove(&id)?;
        self.deleted[node as usize] = true;
        if let Some(slot) = self.vectors.get_mut(node as usize) {
            *slot = None;
        }
        self.live_count -= 1;
        if self.entry_point == Some(node) {
            self.reassign_entry_point();
        }
        Some(node)
    }

    /// Pick the live node with the highest level (lowest id on ties) as entry point.
    fn reassign_entry_point(&mut self) {
        let best = self
            .node_of
            .values()
            .copied()
            .max_by(|&a, &b| self.layers[a as usize].cmp(&self.layers[b as usize]).then(b.cmp(&a)));
        match best {
            Some(node) => {
                self.entry_point = Some(node);
                self.max_layer = self.layers[node as usize] as usize;
            }
            None => {
                self.entry_point = None;
                self.max_layer = 0;
            }
        }
    }

    /// Refill vector copies from `source` (after loading a snapshot).
    pub fn refill_vectors<S: VectorSource + ?Sized>(&mut self, source: &S) -> usize {
        self.vectors = vec![None; self.ids.len()];
        if !self.config.store_vectors_in_graph {
            return 0;
        }
        let mut filled = 0;
        for &node in self.node_of.values() {
            let n = node as usize;
            if let Some(v) = source.full_vector(self.ids[n], self.versions[n]) {
                self.vectors[n] = Some(v);
                filled += 1;
            }
        }
        filled
    }

    /// Validate internal invariants after deserialization.
    ///
    /// Checks that all parallel arrays have consistent lengths, that neighbor ids
    /// are in bounds and respect hierarchy and connection bounds, and that the
    /// live map and entry point agree with the tombstones.
    pub fn validate(&self) -> Result<(), String> {
        let nc = self.ids.len();
        if nc > u32::MAX as usize {
            return Err(format!("node count {} exceeds u32 range", nc));
        }
        for (name, len) in [
            ("versions", self.versions.len()),
            ("layers", self.layers.len()),
            ("neighbors", self.neighbors.len()),
            ("deleted", self.deleted.len()),
        ] {
            if len != nc {
                return Err(format!("{} length {} != node_count {}", name, len, nc));
            }
        }

        let live = self.deleted.iter().filter(|&&d| !d).count();
        if live != self.live_count || live != self.node_of.len() {
            return Err(format!(
                "live count {} disagrees with tombstones ({}) or live map ({})",
                self.live_count,
                live,
                self.node_of.len()
            ));
        }
        for (&id, &node) in &self.node_of {
            let n = node as usize;
            if n >= nc || self.deleted[n] || self.ids[n] != id {
                return Err(format!("live map entry {} -> {} is inconsistent", id, node));
            }
        }

        match self.entry_point {
            Some(ep) => {
                let e = ep as usize;
                if e >= nc || self.deleted[e] {
                    return Err(format!("entry_point {} is out of bounds or deleted", ep));
                }
                if self.layers[e] as usize != self.max_layer {
                    return Err(format!(
                        "entry_point level {} != max_layer {}",
                        self.layers[e], self.max_layer
                    ));
                }
            }
            None if live > 0 => return Err("live nodes but no entry point".to_string()),
            None => {}
        }

        for (node, node_neighbors) in self.neighbors.iter().enumerate() {
            if node_neighbors.len() != self.layers[node] as usize + 1 {
                return Err(format!(
                    "node {} has {} adjacency layers, level {}",
                    node,
                    node_neighbors.len(),
                    self.layers[node]
                ));
            }
            for (layer, list) in node_neighbors.iter().enumerate() {
                if list.len() > self.config.connection_bound(layer) {
                    return Err(format!(
                        "node {} layer {} has {} neighbors (bound {})",
                        node,
                        layer,
                        list.len(),
                        self.config.connection_bound(layer)
                    ));
                }
                for &neighbor in list {
                    let nb = neighbor as usize;
                    if nb >= nc {
                        return Err(format!(
                            "neighbor {} out of bounds (node_count={}) at node {} layer {}",
                            neighbor, nc, node, layer
                        ));
                    }
                    if (self.layers[nb] as usize) < layer {
                        return Err(format!(
                            "neighbor {} at layer {} of node {} is above its level {}",
                            neighbor, layer, node, self.layers[nb]
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Estimates the memory usage of this graph in bytes.
    pub fn memory_bytes(&self) -> usize {
        let mut total = self.ids.len() * (8 + 8 + 1 + 1);
        for node_neighbors in &self.neighbors {
            for layer in node_neighbors {
                total += layer.len() * 4 + 24; // Vec overhead
            }
            total += 24; // Vec<Vec<u32>> overhead
        }
        total += self.node_of.len() * 16;
        total += self
            .vectors
            .iter()
            .flatten()
            .map(|v| v.len() * 4)
            .sum::<usize>();
        total
    }
}
