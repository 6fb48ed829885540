//! Graph insertion with bidirectional connections and heuristic neighbor pruning
//! (Algorithm 4 from the HNSW paper).
//!
//! Insertion is split in two so that concurrent searches are blocked only briefly:
//! [`GraphIndex::plan_insert`] runs the neighbor searches against a shared borrow of
//! the graph, and [`GraphIndex::apply_insert`] links the planned node under an
//! exclusive borrow. Edges to tombstoned nodes are dropped from every neighbor list
//! the insert touches.

use crate::hnsw::graph::{GraphIndex, VectorSource};
use crate::hnsw::search::{search_layer, BudgetTracker, SearchBudget, VisitedSet};
use crate::record::RecordId;
use std::collections::HashSet;
use std::sync::Arc;

/// Neighbor selection computed by [`GraphIndex::plan_insert`].
#[derive(Debug, Clone)]
pub struct InsertPlan {
    pub id: RecordId,
    pub version: u64,
    pub level: usize,
    vector: Arc<[f32]>,
    /// Selected neighbors for layers `0..=min(level, max_layer)`.
    layers: Vec<Vec<u32>>,
}

impl InsertPlan {
    pub fn selected(&self, layer: usize) -> &[u32] {
        self.layers.get(layer).map_or(&[], |l| l.as_slice())
    }
}

impl GraphIndex {
    /// Compute the level and neighbor lists for a new node without mutating the graph.
    ///
    /// Nodes of the record being inserted are ignored, so an update never links
    /// the new version to the old one.
    pub fn plan_insert<S: VectorSource + ?Sized>(
        &self,
        id: RecordId,
        version: u64,
        vector: Arc<[f32]>,
        source: &S,
    ) -> InsertPlan {
        let level = self.random_level(id, version);
        let Some(entry_point) = self.entry_point() else {
            return InsertPlan {
                id,
                version,
                level,
                vector,
                layers: Vec::new(),
            };
        };

        let metric = self.config.distance;
        let mut score = |node: u32| {
            if self.record_id(node) == id {
                return None;
            }
            let other = self.full_vector(node, source)?;
            Some(metric.distance(&vector, &other))
        };
        // Construction is never budgeted
        let mut budget = BudgetTracker::new(SearchBudget::unlimited());
        let mut visited = VisitedSet::new(self.node_count());

        // Phase 1: Greedily traverse from top layer down to node's level + 1
        let mut current_ep = entry_point;
        for layer in (level + 1..=self.max_layer()).rev() {
            let results = search_layer(
                self,
                std::slice::from_ref(&current_ep),
                1,
                layer,
                &mut visited,
                &mut score,
                &mut budget,
            );
            if let Some(&(_, nearest)) = results.first() {
                current_ep = nearest;
            }
        }

        // Phase 2: Search each layer and select neighbors for the new node
        let top = level.min(self.max_layer());
        let mut layers: Vec<Vec<u32>> = vec![Vec::new(); top + 1];
        let mut layer_eps: Vec<u32> = vec![current_ep];
        for layer in (0..=top).rev() {
            let candidates = search_layer(
                self,
                &layer_eps,
                self.config.beam_width,
                layer,
                &mut visited,
                &mut score,
                &mut budget,
            );
            let bound = self.config.connection_bound(layer);
            let selected = self.select_neighbors_heuristic(&candidates, bound, source);
            layers[layer] = selected.iter().map(|&(_, n)| n).collect();

            // Update entry points for next (lower) layer
            if !candidates.is_empty() {
                layer_eps.clear();
                layer_eps.extend(candidates.iter().map(|&(_, n)| n));
            }
        }

        InsertPlan {
            id,
            version,
            level,
            vector,
            layers,
        }
    }

    /// Link a planned node into the graph. A live node of the same record is
    /// tombstoned first. Returns the new node.
    pub fn apply_insert<S: VectorSource + ?Sized>(&mut self, plan: InsertPlan, source: &S) -> u32 {
        self.mark_deleted(plan.id);
        let node = self.push_node(plan.id, plan.version, plan.level, Some(plan.vector));

        // Phase 3: Add bidirectional connections and prune over-capacity neighbors
        for (layer, selected) in plan.layers.into_iter().enumerate() {
            let selected: Vec<u32> = selected
                .into_iter()
                .filter(|&n| !self.is_deleted(n))
                .collect();
            *self.neighbors_mut(node, layer) = selected.clone();
            for neighbor in selected {
                self.link(neighbor, node, layer, source);
            }
        }

        if self.entry_point().is_none() || plan.level > self.max_layer() {
            self.set_entry_point(node, plan.level);
        }
        node
    }

    /// Plan and apply in one step.
    pub fn insert<S: VectorSource + ?Sized>(
        &mut self,
        id: RecordId,
        version: u64,
        vector: Arc<[f32]>,
        source: &S,
    ) -> u32 {
        let plan = self.plan_insert(id, version, vector, source);
        self.apply_insert(plan, source)
    }

    /// Add the reverse edge `neighbor -> node`, pruning `neighbor`'s list when it
    /// exceeds the layer bound.
    fn link<S: VectorSource + ?Sized>(&mut self, neighbor: u32, node: u32, layer: usize, source: &S) {
        let bound = self.config.connection_bound(layer);
        let mut list = std::mem::take(self.neighbors_mut(neighbor, layer));
        list.retain(|&n| !self.is_deleted(n));
        list.push(node);

        if list.len() > bound {
            list = match self.full_vector(neighbor, source) {
                Some(base) => {
                    let metric = self.config.distance;
                    let candidates: Vec<(f32, u32)> = list
                        .iter()
                        .filter_map(|&c| {
                            let v = self.full_vector(c, source)?;
                            Some((metric.distance(&base, &v), c))
                        })
                        .collect();
                    self.select_neighbors_heuristic(&candidates, bound, source)
                        .into_iter()
                        .map(|(_, n)| n)
                        .collect()
                }
                None => {
                    list.truncate(bound);
                    list
                }
            };
        }
        *self.neighbors_mut(neighbor, layer) = list;
    }

    /// Heuristic neighbor selection (Algorithm 4 from the HNSW paper).
    /// A candidate is selected only if it is closer to the base node than to any
    /// already-selected neighbor; remaining slots are filled with the closest unused
    /// candidates. Candidates whose vectors are unavailable are not selected.
    fn select_neighbors_heuristic<S: VectorSource + ?Sized>(
        &self,
        candidates: &[(f32, u32)],
        m: usize,
        source: &S,
    ) -> Vec<(f32, u32)> {
        let mut sorted = candidates.to_vec();
        crate::hnsw::search::sort_by_distance(&mut sorted);

        let metric = self.config.distance;
        let mut selected: Vec<(f32, u32, Arc<[f32]>)> = Vec::with_capacity(m);
        let mut scorable: Vec<(f32, u32)> = Vec::with_capacity(sorted.len());

        for &(dist_to_base, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            let Some(cv) = self.full_vector(cid, source) else {
                continue;
            };
            scorable.push((dist_to_base, cid));
            let is_diverse = selected
                .iter()
                .all(|(_, _, sv)| dist_to_base <= metric.distance(&cv, sv));
            if is_diverse {
                selected.push((dist_to_base, cid, cv));
            }
        }

        let mut result: Vec<(f32, u32)> = selected.into_iter().map(|(d, n, _)| (d, n)).collect();
        if result.len() < m {
            let chosen: HashSet<u32> = result.iter().map(|&(_, n)| n).collect();
            for &(dist, cid) in &scorable {
                if result.len() >= m {
                    break;
                }
                if !chosen.contains(&cid) {
                    result.push((dist, cid));
                }
            }
            crate::hnsw::search::sort_by_distance(&mut result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::distance::DistanceFunction;
    use crate::hnsw::graph::GraphConfig;
    use std::collections::HashMap;

    fn make_embedding(dim: usize, seed: u64) -> Vec<f32> {
        (0..dim)
            .map(|j| {
                (((seed + 1).wrapping_mul(2654435761) + j as u64 * 40503) & 0xFFFF) as f32 / 65535.0
            })
            .collect()
    }

    type Vectors = HashMap<RecordId, Arc<[f32]>>;

    fn build(n: u64, dim: usize, m: usize) -> (GraphIndex, Vectors) {
        let mut cfg = GraphConfig::new(dim, DistanceFunction::Euclidean);
        cfg.max_connections = m;
        cfg.beam_width = 32;
        let mut g = GraphIndex::new(cfg);
        let vectors: Vectors = (0..n)
            .map(|i| (RecordId(i), Arc::from(make_embedding(dim, i))))
            .collect();
        let source = |id: RecordId, _v: u64| vectors.get(&id).cloned();
        for i in 0..n {
            g.insert(RecordId(i), 1, Arc::clone(&vectors[&RecordId(i)]), &source);
        }
        (g, vectors)
    }

    #[test]
    fn test_first_insert_becomes_entry_point() {
        let (g, _) = build(1, 4, 4);
        assert_eq!(g.entry_point(), Some(0));
        assert_eq!(g.len(), 1);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_connection_bounds_hold() {
        let (g, _) = build(300, 8, 4);
        assert!(g.validate().is_ok());
        for node in 0..g.node_count() as u32 {
            assert!(g.neighbors(node, 0).len() <= 8);
            for layer in 1..=g.layer_of(node) {
                assert!(g.neighbors(node, layer).len() <= 4);
            }
        }
    }

    #[test]
    fn test_all_nodes_reachable_at_layer_0() {
        let (g, _) = build(200, 8, 8);
        let mut seen = vec![false; g.node_count()];
        let mut stack = vec![g.entry_point().unwrap()];
        while let Some(n) = stack.pop() {
            if std::mem::replace(&mut seen[n as usize], true) {
                continue;
            }
            stack.extend_from_slice(g.neighbors(n, 0));
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_update_tombstones_previous_node() {
        let (mut g, mut vectors) = build(20, 4, 4);
        let updated: Arc<[f32]> = Arc::from(make_embedding(4, 999));
        vectors.insert(RecordId(3), Arc::clone(&updated));
        let source = |id: RecordId, _v: u64| vectors.get(&id).cloned();
        let node = g.insert(RecordId(3), 2, updated, &source);

        assert_eq!(g.len(), 20);
        assert_eq!(g.tombstone_count(), 1);
        assert_eq!(g.node_of(RecordId(3)), Some(node));
        assert_eq!(g.live_version(RecordId(3)), Some(2));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_insert_prunes_edges_to_tombstones() {
        let (mut g, vectors) = build(50, 4, 3);
        let dead = g.mark_deleted(RecordId(0)).unwrap();
        let source = |id: RecordId, _v: u64| vectors.get(&id).cloned();
        let mut touched = Vec::new();
        for i in 100..140 {
            let v: Arc<[f32]> = Arc::from(make_embedding(4, i));
            let node = g.insert(RecordId(i), 1, v, &source);
            touched.extend_from_slice(g.neighbors(node, 0));
        }
        for n in touched {
            assert!(!g.neighbors(n, 0).contains(&dead));
        }
    }
}
