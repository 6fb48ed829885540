//! Graph search: single-layer beam search and multi-layer KNN.
//!
//! Distances come from a caller-supplied scoring closure `FnMut(u32) -> Option<f32>`,
//! so the same traversal serves full-precision, INT8, binary and PQ scoring. A node
//! that is tombstoned, or that the closure cannot score because its record changed
//! since it was linked, is never returned. It is still expanded, ranked at the
//! distance of the node it was reached from, so dead regions of the graph do not
//! cut off the live nodes behind them.
//!
//! Equal distances are broken by node id, lower first. Node ids follow insertion
//! order, so ties favor the earlier-inserted record.

use crate::config;
use crate::hnsw::graph::GraphIndex;
use ordered_float::OrderedFloat;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Nodes seen during one layer search, indexed by arena node id.
///
/// Each slot holds the epoch in which it was last marked; starting a new search
/// bumps the epoch, so resetting costs nothing until the counter wraps.
#[derive(Debug, Default)]
pub struct VisitedSet {
    marks: Vec<u32>,
    epoch: u32,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            marks: vec![0; capacity],
            epoch: 1,
        }
    }

    pub fn clear(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.marks.fill(0);
            self.epoch = 1;
        }
    }

    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.marks.len() {
            self.marks.resize(capacity, 0);
        }
    }

    /// Returns `true` the first time `node` is seen in the current epoch.
    #[inline]
    pub fn insert(&mut self, node: u32) -> bool {
        let slot = node as usize;
        if slot >= self.marks.len() {
            self.marks.resize(slot + 1, 0);
        }
        let fresh = self.marks[slot] != self.epoch;
        self.marks[slot] = self.epoch;
        fresh
    }
}

thread_local! {
    /// Per-thread visited set, reused across searches.
    static SEARCH_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::new(0));
}

/// Caller-supplied limits for a best-effort search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchBudget {
    /// Stop expanding once this instant has passed.
    pub deadline: Option<Instant>,
    /// Stop after this many distance evaluations.
    pub max_visits: Option<usize>,
}

impl SearchBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            max_visits: None,
        }
    }

    pub fn with_max_visits(max_visits: usize) -> Self {
        Self {
            deadline: None,
            max_visits: Some(max_visits),
        }
    }
}

/// Counts distance evaluations against a [`SearchBudget`].
#[derive(Debug)]
pub struct BudgetTracker {
    budget: SearchBudget,
    visits: usize,
    exhausted: bool,
}

impl BudgetTracker {
    pub fn new(budget: SearchBudget) -> Self {
        Self {
            budget,
            visits: 0,
            exhausted: false,
        }
    }

    /// Account for one distance evaluation. Returns `false` once the budget is spent.
    #[inline]
    pub fn charge(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if let Some(max) = self.budget.max_visits {
            if self.visits >= max {
                self.exhausted = true;
                return false;
            }
        }
        if let Some(deadline) = self.budget.deadline {
            if self.visits % config::BUDGET_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                self.exhausted = true;
                return false;
            }
        }
        self.visits += 1;
        true
    }

    pub fn visits(&self) -> usize {
        self.visits
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// A candidate during search: (negative distance, node id).
/// BinaryHeap is a max-heap; we use negative distance for min-heap behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    neg_distance: OrderedFloat<f32>,
    id: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.neg_distance
            .cmp(&other.neg_distance)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A result entry: (distance, node id). Max-heap by distance for pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    id: u32,
}

impl Ord for ResultEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ResultEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort `(distance, node)` pairs by distance, then node id.
pub fn sort_by_distance(results: &mut [(f32, u32)]) {
    results.sort_unstable_by(|a, b| OrderedFloat(a.0).cmp(&OrderedFloat(b.0)).then(a.1.cmp(&b.1)));
}

/// Search a single layer of the graph.
///
/// Returns up to `ef` closest live, scorable nodes, sorted by distance. `visited`
/// is cleared at the start of each call. Tombstoned or unscorable nodes count
/// against the budget and are expanded but never returned: entry points rank
/// last, other nodes inherit the distance of the node that reached them.
#[allow(clippy::too_many_arguments)]
pub fn search_layer<F>(
    graph: &GraphIndex,
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    score: &mut F,
    budget: &mut BudgetTracker,
) -> Vec<(f32, u32)>
where
    F: FnMut(u32) -> Option<f32>,
{
    visited.clear();
    let ef = ef.max(1);
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    // Cached worst distance, avoids repeated heap peeks in the hot loop
    let mut worst_dist = f32::INFINITY;

    for &ep in entry_points {
        if !visited.insert(ep) {
            continue;
        }
        if !budget.charge() {
            break;
        }
        let scored = if graph.is_deleted(ep) { None } else { score(ep) };
        match scored {
            Some(dist) => {
                candidates.push(Candidate {
                    neg_distance: OrderedFloat(-dist),
                    id: ep,
                });
                results.push(ResultEntry {
                    distance: OrderedFloat(dist),
                    id: ep,
                });
                if results.len() > ef {
                    results.pop();
                }
                if results.len() >= ef {
                    worst_dist = results.peek().map_or(f32::INFINITY, |r| r.distance.0);
                }
            }
            None => candidates.push(Candidate {
                neg_distance: OrderedFloat(f32::NEG_INFINITY),
                id: ep,
            }),
        }
    }

    'expand: while let Some(candidate) = candidates.pop() {
        let c_dist = -candidate.neg_distance.0;

        // If the closest candidate is farther than the worst result, stop
        if results.len() >= ef && c_dist > worst_dist {
            break;
        }

        for &neighbor in graph.neighbors(candidate.id, layer) {
            if !visited.insert(neighbor) {
                continue;
            }
            if !budget.charge() {
                break 'expand;
            }
            let scored = if graph.is_deleted(neighbor) { None } else { score(neighbor) };
            let Some(dist) = scored else {
                // Pass through at the parent's rank
                candidates.push(Candidate {
                    neg_distance: candidate.neg_distance,
                    id: neighbor,
                });
                continue;
            };

            if results.len() < ef || dist < worst_dist {
                candidates.push(Candidate {
                    neg_distance: OrderedFloat(-dist),
                    id: neighbor,
                });
                results.push(ResultEntry {
                    distance: OrderedFloat(dist),
                    id: neighbor,
                });
                if results.len() > ef {
                    results.pop(); // remove worst
                }
                if results.len() >= ef {
                    worst_dist = results.peek().map_or(f32::INFINITY, |r| r.distance.0);
                }
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|r| (r.distance.0, r.id))
        .collect()
}

/// Outcome of a multi-layer search.
#[derive(Debug, Default)]
pub struct GraphSearch {
    /// Up to `ef` nodes, sorted by distance then node id.
    pub hits: Vec<(f32, u32)>,
    pub budget_exhausted: bool,
    pub visits: usize,
}

impl GraphIndex {
    /// Multi-layer search: greedy descent with ef=1 from the entry point down to
    /// layer 1, then a beam of `ef` at layer 0.
    ///
    /// When the budget runs out, the best nodes of the layer being searched are
    /// returned; upper-layer nodes are also layer-0 nodes, so they are valid hits.
    pub fn search<F>(&self, ef: usize, score: &mut F, budget: SearchBudget) -> GraphSearch
    where
        F: FnMut(u32) -> Option<f32>,
    {
        let Some(entry_point) = self.entry_point() else {
            return GraphSearch::default();
        };
        let mut tracker = BudgetTracker::new(budget);

        SEARCH_VISITED.with(|cell| {
            let mut visited = cell.borrow_mut();
            visited.ensure_capacity(self.node_count());

            let mut current = vec![entry_point];
            for layer in (1..=self.max_layer()).rev() {
                let results =
                    search_layer(self, &current, 1, layer, &mut visited, score, &mut tracker);
                if tracker.is_exhausted() {
                    return GraphSearch {
                        hits: results,
                        budget_exhausted: true,
                        visits: tracker.visits(),
                    };
                }
                if let Some(&(_, nearest)) = results.first() {
                    current = vec![nearest];
                }
            }

            let hits = search_layer(self, &current, ef, 0, &mut visited, score, &mut tracker);
            GraphSearch {
                hits,
                budget_exhausted: tracker.is_exhausted(),
                visits: tracker.visits(),
            }
        })
    }
}
