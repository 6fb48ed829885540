//! Product-quantization search engine.
//!
//! Owns the trained codebook and one PQ code per live record. Approximate search
//! walks the current graph scoring nodes through a per-query distance table
//! (asymmetric distance computation), keeps `k * overquery_factor` candidates and
//! reranks them with exact distances from the vector store.

use crate::error::{IndexError, Result};
use crate::hnsw::{DistanceFunction, GraphIndex, SearchBudget};
use crate::quantization::pq::{PqCodebook, PqDistanceTable, PqParams};
use crate::record::{ApproximateResults, RecordId, SearchHit};
use crate::storage::VectorStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// PQ code of one record version.
#[derive(Debug, Clone)]
struct PqCode {
    version: u64,
    codebook_version: u64,
    codes: Vec<u8>,
}

#[derive(Debug, Default)]
struct PqState {
    codebook: Option<Arc<PqCodebook>>,
    codes: HashMap<RecordId, PqCode>,
}

#[derive(Debug)]
pub struct PqSearchEngine {
    params: PqParams,
    dimension: usize,
    distance: DistanceFunction,
    seed: u64,
    state: RwLock<PqState>,
    /// Version handed to the next trained codebook.
    next_version: AtomicU64,
}

impl PqSearchEngine {
    pub fn new(params: PqParams, dimension: usize, distance: DistanceFunction, seed: u64) -> Self {
        Self {
            params,
            dimension,
            distance,
            seed,
            state: RwLock::new(PqState::default()),
            next_version: AtomicU64::new(1),
        }
    }

    pub fn params(&self) -> &PqParams {
        &self.params
    }

    /// Train a new codebook on `samples`. The codebook is not installed.
    pub fn train<V: AsRef<[f32]>>(&self, samples: &[V]) -> Result<PqCodebook> {
        let version = self.next_version.fetch_add(1, Ordering::AcqRel);
        PqCodebook::train(
            samples,
            self.dimension,
            &self.params,
            version,
            self.seed ^ version,
        )
    }

    /// Install `codebook` and eagerly re-encode every live record with it.
    /// Codes from the previous codebook are discarded.
    pub fn install(&self, codebook: PqCodebook, live: &[(RecordId, u64, Arc<[f32]>)]) -> Result<()> {
        let mut codes = HashMap::with_capacity(live.len());
        for (id, version, vector) in live {
            codes.insert(
                *id,
                PqCode {
                    version: *version,
                    codebook_version: codebook.version,
                    codes: codebook.encode(vector)?,
                },
            );
        }
        // Keep versions monotonic across reopen
        self.next_version
            .fetch_max(codebook.version + 1, Ordering::AcqRel);
        let mut state = self.state.write();
        state.codebook = Some(Arc::new(codebook));
        state.codes = codes;
        Ok(())
    }

    pub fn codebook(&self) -> Option<Arc<PqCodebook>> {
        self.state.read().codebook.clone()
    }

    /// Encode `vector` with the current codebook.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let state = self.state.read();
        let codebook = state.codebook.as_ref().ok_or(IndexError::CodebookNotTrained)?;
        codebook.encode(vector)
    }

    /// Store the code of a newly written record version. No-op before training.
    pub fn upsert(&self, id: RecordId, version: u64, vector: &[f32]) -> Result<()> {
        let Some(codebook) = self.codebook() else {
            return Ok(());
        };
        let code = PqCode {
            version,
            codebook_version: codebook.version,
            codes: codebook.encode(vector)?,
        };
        self.state.write().codes.insert(id, code);
        Ok(())
    }

    pub fn remove(&self, id: RecordId) {
        self.state.write().codes.remove(&id);
    }

    pub fn code_count(&self) -> usize {
        self.state.read().codes.len()
    }

    /// Whether every stored code was encoded with the installed codebook.
    pub fn is_fresh(&self) -> bool {
        let state = self.state.read();
        match &state.codebook {
            Some(cb) => state.codes.values().all(|c| c.codebook_version == cb.version),
            None => state.codes.is_empty(),
        }
    }

    /// Precomputed lookup table for `query`.
    pub fn distance_table(&self, query: &[f32]) -> Result<PqDistanceTable> {
        let state = self.state.read();
        let codebook = state.codebook.as_ref().ok_or(IndexError::CodebookNotTrained)?;
        Ok(codebook.distance_table(query, self.distance))
    }

    /// Approximate distance from the query behind `table` to a stored code.
    pub fn approximate_distance(&self, table: &PqDistanceTable, codes: &[u8]) -> f32 {
        table.distance(codes)
    }

    /// Approximate search over `graph` with exact rerank from `store`.
    ///
    /// The caller holds the graph read lock; this takes the PQ state lock after it.
    #[allow(clippy::too_many_arguments)]
    pub fn search_approximate(
        &self,
        graph: &GraphIndex,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        overquery_factor: usize,
        budget: SearchBudget,
    ) -> Result<ApproximateResults> {
        let state = self.state.read();
        let codebook = state.codebook.as_ref().ok_or(IndexError::CodebookNotTrained)?;
        let table = codebook.distance_table(query, self.distance);
        let candidates_wanted = k.saturating_mul(overquery_factor);
        let ef = graph.config.beam_width.max(candidates_wanted);

        let mut stale: Option<u64> = None;
        let mut score = |node: u32| -> Option<f32> {
            if graph.is_deleted(node) {
                return None;
            }
            let code = state.codes.get(&graph.record_id(node))?;
            if code.version != graph.version(node) {
                return None;
            }
            if code.codebook_version != codebook.version {
                stale = Some(code.codebook_version);
                return None;
            }
            Some(self.approximate_distance(&table, &code.codes))
        };
        let outcome = graph.search(ef, &mut score, budget);
        if let Some(encoded_version) = stale {
            return Err(IndexError::StaleCodebook {
                codebook_version: codebook.version,
                encoded_version,
            });
        }

        // Exact rerank of the best k * overquery_factor candidates
        let mut reranked: Vec<(f32, u32)> = outcome
            .hits
            .iter()
            .take(candidates_wanted)
            .filter_map(|&(_, node)| {
                let vector = store.vector_at(graph.record_id(node), graph.version(node))?;
                Some((self.distance.distance(query, &vector), node))
            })
            .collect();
        crate::hnsw::search::sort_by_distance(&mut reranked);
        reranked.truncate(k);

        Ok(ApproximateResults {
            hits: reranked
                .into_iter()
                .map(|(distance, node)| SearchHit {
                    id: graph.record_id(node),
                    distance,
                })
                .collect(),
            budget_exhausted: outcome.budget_exhausted,
        })
    }

    pub fn memory_bytes(&self) -> usize {
        let state = self.state.read();
        let codebook = state.codebook.as_ref().map_or(0, |cb| cb.memory_bytes());
        let codes: usize = state.codes.values().map(|c| c.codes.len() + 24).sum();
        codebook + codes
    }
}
