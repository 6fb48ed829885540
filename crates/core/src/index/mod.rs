//! The vector index: durable store, navigable graph, PQ engine and maintenance.
//!
//! Mutations are serialized by a single write lock and follow one path: append a
//! [`WalBatch`] to the [`DurableLog`], apply it to the [`VectorStore`], then update
//! PQ codes and the published graph. Searches never take the write lock; they load
//! the current [`GraphGeneration`] and score nodes through the shared
//! [`LocationCache`].
//!
//! Lock order: write lock, then graph lock, then PQ state lock. Writers update PQ
//! codes before taking the graph lock, so no thread ever holds the PQ lock while
//! waiting for the graph.

pub mod approximate;
pub mod generation;
pub mod maintenance;
pub mod metadata;
pub mod scheduler;

pub use approximate::PqSearchEngine;
pub use generation::{BuildReport, GraphGeneration, RebuildTrigger};
pub use maintenance::BuildHandle;
pub use metadata::{GraphSettings, IndexMetadata, RebuildMode, Storage};
pub use scheduler::{MutationCounter, RebuildScheduler};

use crate::cache::{CacheStats, GraphBuildCache, LocationCache};
use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::search::{sort_by_distance, GraphSearch};
use crate::hnsw::{GraphIndex, SearchBudget};
use crate::quantization::{PreparedQuery, QuantizationKind, VectorEncoder};
use crate::record::{ApproximateResults, RecordId, SearchHit};
use crate::storage::persistence::{self, GraphSnapshotRef, VectorSnapshot};
use crate::storage::{
    AppliedOp, DurableLog, MemoryLog, SyncWriteAheadLog, VectorEntry, VectorStore, WalBatch, WalOp,
};
use arc_swap::ArcSwap;
use crossbeam::channel::{Receiver, Sender};
use generation::FlagGuard;
use maintenance::{MaintenanceTask, MaintenanceWorker};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle state of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// No live vectors.
    Empty,
    /// First graph build in progress; the published graph is still empty.
    Building,
    Ready,
    /// A commit is being applied.
    Mutating,
    /// A rebuild is in progress over a published graph.
    Rebuilding,
}

/// Point-in-time statistics.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub live_count: usize,
    pub graph_nodes: usize,
    pub tombstones: usize,
    pub generation: u64,
    /// Applied LSN at the moment the current generation was published.
    pub graph_built_from_lsn: u64,
    pub max_layer: usize,
    pub applied_lsn: u64,
    pub mutations_since_build: u64,
    pub should_rebuild: bool,
    pub codebook_version: Option<u64>,
    /// All PQ codes were encoded with the installed codebook.
    pub codebook_fresh: bool,
    pub pq_codes: usize,
    /// Vector copies held by the graph (`store_vectors_in_graph`).
    pub vector_copies: usize,
    pub location_cache: CacheStats,
    pub graph_build_cache: CacheStats,
    pub last_rebuild_error: Option<String>,
    pub memory_bytes: usize,
}

/// State shared between the index handle and the maintenance worker.
pub(crate) struct IndexShared {
    pub(crate) metadata: RwLock<IndexMetadata>,
    pub(crate) store: VectorStore,
    pub(crate) log: Box<dyn DurableLog>,
    pub(crate) dir: Option<PathBuf>,
    pub(crate) generation: ArcSwap<GraphGeneration>,
    pub(crate) pq: PqSearchEngine,
    pub(crate) scheduler: RebuildScheduler,
    pub(crate) location_cache: LocationCache,
    pub(crate) build_cache: GraphBuildCache,
    /// Serializes mutations. Holds the last assigned LSN.
    pub(crate) write_lock: Mutex<u64>,
    /// Held for the whole of a rebuild.
    pub(crate) rebuild_lock: Mutex<()>,
    pub(crate) rebuilding: AtomicBool,
    pub(crate) committing: AtomicBool,
    pub(crate) last_rebuild_error: Mutex<Option<String>>,
    pub(crate) tasks: Sender<MaintenanceTask>,
    #[cfg(test)]
    pub(crate) rebuild_pause: Mutex<Option<generation::RebuildPause>>,
}

/// Outcome of WAL replay on open.
struct Recovery {
    last_lsn: u64,
    replayed: usize,
    torn_tail: bool,
}

impl IndexShared {
    fn new(
        metadata: IndexMetadata,
        log: Box<dyn DurableLog>,
        dir: Option<PathBuf>,
        tasks: Sender<MaintenanceTask>,
    ) -> Self {
        let encoder = VectorEncoder::new(metadata.dimension, metadata.quantization);
        let graph = GraphIndex::new(metadata.graph_config());
        Self {
            store: VectorStore::new(encoder),
            log,
            dir,
            generation: ArcSwap::from_pointee(GraphGeneration::new(0, graph, 0)),
            pq: PqSearchEngine::new(
                metadata.pq,
                metadata.dimension,
                metadata.distance,
                metadata.seed,
            ),
            scheduler: RebuildScheduler::new(metadata.mutations_before_rebuild, metadata.rebuild_mode),
            location_cache: LocationCache::new(metadata.location_cache_size),
            build_cache: GraphBuildCache::new(metadata.graph_build_cache_size),
            write_lock: Mutex::new(0),
            rebuild_lock: Mutex::new(()),
            rebuilding: AtomicBool::new(false),
            committing: AtomicBool::new(false),
            last_rebuild_error: Mutex::new(None),
            tasks,
            #[cfg(test)]
            rebuild_pause: Mutex::new(None),
            metadata: RwLock::new(metadata),
        }
    }

    /// Full-precision vectors for graph construction, read through the build cache.
    pub(crate) fn store_source(&self) -> impl Fn(RecordId, u64) -> Option<Arc<[f32]>> + '_ {
        move |id, version| {
            self.build_cache
                .get_or_load((id, version), || self.store.vector_at(id, version))
        }
    }

    fn kind(&self) -> QuantizationKind {
        self.store.encoder().kind()
    }

    /// Validate a put before it enters a transaction.
    fn check_vector(&self, id: RecordId, vector: &[f32]) -> Result<()> {
        self.store.encoder().check_dimension(vector.len())?;
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::InvalidArgument(format!(
                "vector for {} contains non-finite values",
                id
            )));
        }
        Ok(())
    }

    /// Append `ops` to the log as one batch, then apply it. Returns the batch LSN.
    fn commit(&self, ops: Vec<WalOp>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(self.store.applied_lsn());
        }
        if self.scheduler.mode() == RebuildMode::Synchronous && self.scheduler.should_rebuild() {
            if let Some(Err(e)) = self.try_rebuild(RebuildTrigger::Automatic) {
                // The commit itself does not depend on the rebuild
                self.record_rebuild_error(&e);
            }
        }

        let lsn = {
            let mut last_lsn = self.write_lock.lock();
            let _mutating = FlagGuard::raise(&self.committing);
            let batch = WalBatch {
                lsn: *last_lsn + 1,
                ops,
            };
            self.store.validate_batch(&batch)?;
            self.log.append(&batch)?;
            *last_lsn = batch.lsn;

            let applied = self.store.apply_batch(&batch)?;
            let mutations = self.apply_to_graph(&applied)?;
            self.scheduler.record_mutations(mutations);
            batch.lsn
        };

        if self.scheduler.mode() == RebuildMode::Background
            && self.scheduler.claim_background()
            && self.tasks.send(MaintenanceTask::AutoRebuild).is_err()
        {
            self.scheduler.release_background();
        }
        Ok(lsn)
    }

    /// Bring PQ codes, caches and the published graph in line with applied
    /// operations. Returns the number of real mutations.
    fn apply_to_graph(&self, applied: &[AppliedOp]) -> Result<u64> {
        let generation = self.generation.load_full();
        let source = self.store_source();
        let product = self.kind() == QuantizationKind::Product;
        let mut mutations = 0;

        for op in applied {
            match op {
                AppliedOp::Inserted(entry) | AppliedOp::Updated { entry, .. } => {
                    if product {
                        self.pq.upsert(entry.id, entry.version, &entry.vector)?;
                    }
                    // Plan under an upgradable read so searches continue meanwhile
                    let graph = generation.graph.upgradable_read();
                    let plan =
                        graph.plan_insert(entry.id, entry.version, Arc::clone(&entry.vector), &source);
                    let mut graph = RwLockUpgradableReadGuard::upgrade(graph);
                    graph.apply_insert(plan, &source);
                }
                AppliedOp::Deleted(entry) => {
                    if product {
                        self.pq.remove(entry.id);
                    }
                    generation.graph.write().mark_deleted(entry.id);
                    self.location_cache.remove(&(entry.id, entry.version));
                }
                AppliedOp::Unchanged(_) | AppliedOp::Missing(_) => continue,
            }
            if let AppliedOp::Updated {
                previous_version,
                entry,
            } = op
            {
                self.location_cache.remove(&(entry.id, *previous_version));
            }
            mutations += 1;
        }
        Ok(mutations)
    }

    fn record_rebuild_error(&self, error: &IndexError) {
        tracing::error!(error = %error, "automatic rebuild failed; previous generation stays published");
        *self.last_rebuild_error.lock() = Some(error.to_string());
    }

    pub(crate) fn clear_rebuild_error(&self) {
        self.last_rebuild_error.lock().take();
    }

    /// Body of a background rebuild request.
    pub(crate) fn run_background_rebuild(&self) {
        let outcome = if self.scheduler.should_rebuild() {
            self.rebuild(RebuildTrigger::Automatic).map(Some)
        } else {
            Ok(None)
        };
        self.scheduler.release_background();
        match outcome {
            Ok(Some(_)) => self.clear_rebuild_error(),
            Ok(None) => {}
            // Retried once the next mutation finds the threshold still crossed
            Err(e) => self.record_rebuild_error(&e),
        }
    }

    fn check_query(&self, query: &[f32], k: usize, overquery_factor: usize) -> Result<()> {
        if k == 0 || k > config::MAX_K {
            return Err(IndexError::InvalidArgument(format!(
                "k must be in 1..={}, got {}",
                config::MAX_K,
                k
            )));
        }
        if overquery_factor == 0 || overquery_factor > config::MAX_OVERQUERY_FACTOR {
            return Err(IndexError::InvalidArgument(format!(
                "overquery factor must be in 1..={}, got {}",
                config::MAX_OVERQUERY_FACTOR,
                overquery_factor
            )));
        }
        self.store.encoder().check_dimension(query.len())?;
        if query.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::InvalidArgument(
                "query contains non-finite values".to_string(),
            ));
        }
        if self.store.count() == 0 {
            return Err(IndexError::EmptyIndex);
        }
        Ok(())
    }

    /// Traverse `graph` scoring nodes in the stored representation.
    ///
    /// Full-precision kinds use the graph's vector copy when present; otherwise the
    /// traversal-ready vector comes from the location cache, keyed by
    /// `(record, version)` so a node whose record changed is never scored.
    fn traverse(
        &self,
        graph: &GraphIndex,
        query: &PreparedQuery,
        ef: usize,
        budget: SearchBudget,
    ) -> GraphSearch {
        let use_copies = matches!(self.kind(), QuantizationKind::None | QuantizationKind::Product);
        let mut score = |node: u32| -> Option<f32> {
            if graph.is_deleted(node) {
                return None;
            }
            if use_copies {
                if let Some(v) = graph.vector_copy(node) {
                    return Some(query.exact(v));
                }
            }
            let (id, version) = (graph.record_id(node), graph.version(node));
            let target = self.location_cache.get_or_load((id, version), || {
                self.store.get_version(id, version)?.payload.scoring_vector()
            })?;
            Some(query.score(&target))
        };
        graph.search(ef, &mut score, budget)
    }

    /// Rank traversal hits. Quantized kinds are reranked with exact distances.
    fn finish(
        &self,
        graph: &GraphIndex,
        query: &PreparedQuery,
        hits: Vec<(f32, u32)>,
        k: usize,
    ) -> Vec<SearchHit> {
        let mut ranked: Vec<(f32, u32)> = if self.kind().needs_rerank() {
            hits.into_iter()
                .filter_map(|(_, node)| {
                    let vector = self
                        .store
                        .vector_at(graph.record_id(node), graph.version(node))?;
                    Some((query.exact(&vector), node))
                })
                .collect()
        } else {
            hits
        };
        sort_by_distance(&mut ranked);
        ranked.truncate(k);
        ranked
            .into_iter()
            .map(|(distance, node)| SearchHit {
                id: graph.record_id(node),
                distance,
            })
            .collect()
    }

    fn search_graph(
        &self,
        query: &[f32],
        k: usize,
        overquery_factor: usize,
        budget: SearchBudget,
    ) -> Result<ApproximateResults> {
        self.check_query(query, k, overquery_factor)?;
        let generation = self.generation.load_full();
        let graph = generation.graph.read();
        let distance = self.metadata.read().distance;
        let prepared = PreparedQuery::new(query, distance, self.kind());
        let ef = graph
            .config
            .beam_width
            .max(k.saturating_mul(overquery_factor));
        let outcome = self.traverse(&graph, &prepared, ef, budget);
        Ok(ApproximateResults {
            hits: self.finish(&graph, &prepared, outcome.hits, k),
            budget_exhausted: outcome.budget_exhausted,
        })
    }

    fn search_approximate(
        &self,
        query: &[f32],
        k: usize,
        overquery_factor: usize,
        budget: SearchBudget,
    ) -> Result<ApproximateResults> {
        if self.kind() != QuantizationKind::Product {
            return self.search_graph(query, k, overquery_factor, budget);
        }
        self.check_query(query, k, overquery_factor)?;
        if self.pq.codebook().is_none() {
            // Collections smaller than pq_clusters are never trained
            if self.store.count() < self.pq.params().clusters {
                return self.search_graph(query, k, overquery_factor, budget);
            }
            return Err(IndexError::CodebookNotTrained);
        }
        let generation = self.generation.load_full();
        let graph = generation.graph.read();
        self.pq
            .search_approximate(&graph, &self.store, query, k, overquery_factor, budget)
    }

    /// Write both snapshots and truncate the log. Blocks mutations meanwhile.
    pub(crate) fn checkpoint(&self) -> Result<()> {
        let _writer = self.write_lock.lock();
        let _frozen = self.log.freeze();
        if let Some(dir) = &self.dir {
            let (records, applied_lsn) = self.store.to_records();
            let record_count = records.len();
            persistence::save_vector_snapshot(
                dir,
                &VectorSnapshot {
                    metadata: self.metadata.read().clone(),
                    applied_lsn,
                    records,
                },
            )?;
            let generation = self.generation.load_full();
            let graph = generation.graph.read();
            let codebook = self.pq.codebook();
            persistence::save_graph_snapshot(
                dir,
                &GraphSnapshotRef {
                    generation: generation.number,
                    lsn: applied_lsn,
                    graph: &graph,
                    codebook: codebook.as_deref(),
                },
            )?;
            tracing::info!(
                records = record_count,
                lsn = applied_lsn,
                generation = generation.number,
                "checkpoint written"
            );
        }
        self.log.truncate()
    }

    /// Re-apply logged batches above `snapshot_lsn`.
    fn replay_log(&self, snapshot_lsn: u64) -> Result<Recovery> {
        let (batches, stats) = self.log.replay()?;
        if stats.crc_errors > 0 || stats.skipped > 0 {
            return Err(IndexError::WalReplayInconsistency(format!(
                "{} CRC mismatches and {} undecodable frames in the log",
                stats.crc_errors, stats.skipped
            )));
        }
        if stats.truncated {
            tracing::warn!("WAL ends with a torn frame; it will be discarded");
        }

        let mut recovery = Recovery {
            last_lsn: snapshot_lsn,
            replayed: 0,
            torn_tail: stats.truncated,
        };
        for batch in batches {
            if batch.lsn <= snapshot_lsn {
                continue;
            }
            if batch.lsn != recovery.last_lsn + 1 {
                return Err(IndexError::WalReplayInconsistency(format!(
                    "expected LSN {}, found {}",
                    recovery.last_lsn + 1,
                    batch.lsn
                )));
            }
            self.store.validate_batch(&batch).map_err(|e| {
                IndexError::WalReplayInconsistency(format!("batch {}: {}", batch.lsn, e))
            })?;
            self.store.apply_batch(&batch)?;
            recovery.last_lsn = batch.lsn;
            recovery.replayed += 1;
        }
        tracing::info!(
            replayed = recovery.replayed,
            frames = stats.success,
            lsn = recovery.last_lsn,
            "WAL replay complete"
        );
        Ok(recovery)
    }

    /// Install the graph snapshot if it matches the recovered store, otherwise
    /// rebuild from the store.
    fn restore_graph(&self, applied_lsn: u64) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let snapshot = match persistence::load_graph_snapshot(dir) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "graph snapshot unusable; rebuilding from stored vectors");
                None
            }
        };
        let expected = self.metadata.read().graph_config();

        match snapshot {
            Some(s) if s.lsn == applied_lsn && s.graph.config == expected && self.graph_matches_store(&s.graph) => {
                let mut graph = s.graph;
                let refilled = graph.refill_vectors(&self.store_source());
                if let (QuantizationKind::Product, Some(codebook)) = (self.kind(), s.codebook) {
                    self.pq.install(codebook, &self.store.live_snapshot().0)?;
                }
                tracing::info!(
                    generation = s.generation,
                    nodes = graph.len(),
                    vector_copies = refilled,
                    "restored graph snapshot"
                );
                self.generation
                    .store(Arc::new(GraphGeneration::new(s.generation, graph, s.lsn)));
            }
            Some(s) => {
                tracing::warn!(
                    snapshot_lsn = s.lsn,
                    applied_lsn,
                    "graph snapshot does not match the store; rebuilding"
                );
                self.rebuild(RebuildTrigger::Recovery)?;
            }
            None if self.store.count() > 0 => {
                tracing::warn!("no graph snapshot; rebuilding from stored vectors");
                self.rebuild(RebuildTrigger::Recovery)?;
            }
            None => {}
        }
        Ok(())
    }

    fn graph_matches_store(&self, graph: &GraphIndex) -> bool {
        graph.len() == self.store.count()
            && graph
                .live_records()
                .all(|(id, version)| self.store.get(id).is_some_and(|e| e.version == version))
    }

    fn state(&self) -> IndexState {
        if self.rebuilding.load(Ordering::Acquire) {
            if self.generation.load().graph.read().is_empty() {
                IndexState::Building
            } else {
                IndexState::Rebuilding
            }
        } else if self.committing.load(Ordering::Acquire) {
            IndexState::Mutating
        } else if self.store.count() == 0 {
            IndexState::Empty
        } else {
            IndexState::Ready
        }
    }

    fn stats(&self) -> IndexStats {
        let generation = self.generation.load_full();
        let graph = generation.graph.read();
        let dimension = self.store.dimension();
        let location_cache = self.location_cache.stats();
        let graph_build_cache = self.build_cache.stats();
        let memory_bytes = self.store.memory_bytes()
            + graph.memory_bytes()
            + self.pq.memory_bytes()
            + (location_cache.len + graph_build_cache.len) * dimension * 4;
        IndexStats {
            live_count: self.store.count(),
            graph_nodes: graph.node_count(),
            tombstones: graph.tombstone_count(),
            generation: generation.number,
            graph_built_from_lsn: generation.built_from_lsn,
            max_layer: graph.max_layer(),
            applied_lsn: self.store.applied_lsn(),
            mutations_since_build: self.scheduler.mutations_since_build(),
            should_rebuild: self.scheduler.should_rebuild(),
            codebook_version: self.pq.codebook().map(|cb| cb.version),
            codebook_fresh: self.pq.is_fresh(),
            pq_codes: self.pq.code_count(),
            vector_copies: graph.vector_copy_count(),
            location_cache,
            graph_build_cache,
            last_rebuild_error: self.last_rebuild_error.lock().clone(),
            memory_bytes,
        }
    }
}

/// A buffered set of puts and deletes, committed as one WAL batch.
///
/// Operations are validated as they are added. Nothing is durable or visible
/// until [`commit`](IndexTransaction::commit) returns; dropping an uncommitted
/// transaction discards it.
pub struct IndexTransaction<'a> {
    shared: &'a IndexShared,
    ops: Vec<WalOp>,
}

impl IndexTransaction<'_> {
    /// Insert or replace the vector of `id`.
    pub fn put(&mut self, id: impl Into<RecordId>, vector: &[f32]) -> Result<()> {
        let id = id.into();
        self.shared.check_vector(id, vector)?;
        self.ops.push(WalOp::Put {
            id,
            vector: vector.to_vec(),
        });
        Ok(())
    }

    pub fn delete(&mut self, id: impl Into<RecordId>) {
        self.ops.push(WalOp::Delete { id: id.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Make the transaction durable, then apply it. Returns its LSN.
    pub fn commit(self) -> Result<u64> {
        self.shared.commit(self.ops)
    }
}

/// Persistent approximate nearest-neighbor index.
///
/// All methods take `&self`; share the index across threads with `Arc` or scoped
/// threads. Dropping the index stops its maintenance worker.
pub struct VectorIndex {
    worker: MaintenanceWorker,
    shared: Arc<IndexShared>,
}

impl VectorIndex {
    /// Create a new index.
    ///
    /// For [`Storage::Directory`] the directory must not already hold an index;
    /// an initial checkpoint persists the metadata.
    pub fn create(metadata: IndexMetadata, storage: Storage) -> Result<Self> {
        metadata.validate()?;
        let (log, dir): (Box<dyn DurableLog>, Option<PathBuf>) = match storage {
            Storage::InMemory => (Box::new(MemoryLog::new()), None),
            Storage::Directory(dir) => {
                if persistence::vector_snapshot_path(&dir).exists() {
                    return Err(IndexError::InvalidArgument(format!(
                        "an index already exists at {:?}",
                        dir
                    )));
                }
                (Box::new(SyncWriteAheadLog::open(&dir)?), Some(dir))
            }
        };
        let (tx, rx) = crossbeam::channel::unbounded();
        let shared = IndexShared::new(metadata, log, dir, tx.clone());
        shared.checkpoint()?;
        Self::start(shared, tx, rx)
    }

    /// Reopen an index created under `path`.
    ///
    /// Dimension, distance function and quantization must match the persisted
    /// metadata; graph settings and cache sizes are taken from `metadata`.
    /// Recovery loads the vector snapshot, replays the WAL, then restores the graph
    /// snapshot or rebuilds the graph when the snapshot does not match.
    pub fn open(path: impl AsRef<Path>, metadata: IndexMetadata) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        metadata.validate()?;
        let snapshot = persistence::load_vector_snapshot(&dir)?.ok_or_else(|| {
            IndexError::Storage(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no index found at {:?}", dir),
            ))
        })?;
        metadata.check_compatible(&snapshot.metadata)?;

        let log = SyncWriteAheadLog::open(&dir)?;
        let (tx, rx) = crossbeam::channel::unbounded();
        let shared = IndexShared::new(metadata, Box::new(log), Some(dir), tx.clone());
        shared
            .store
            .load_records(snapshot.records, snapshot.applied_lsn)?;
        let recovery = shared.replay_log(snapshot.applied_lsn)?;
        *shared.write_lock.lock() = recovery.last_lsn;
        shared.restore_graph(recovery.last_lsn)?;
        if recovery.replayed > 0 || recovery.torn_tail {
            shared.checkpoint()?;
        }
        Self::start(shared, tx, rx)
    }

    fn start(
        shared: IndexShared,
        tx: Sender<MaintenanceTask>,
        rx: Receiver<MaintenanceTask>,
    ) -> Result<Self> {
        let shared = Arc::new(shared);
        let worker = MaintenanceWorker::spawn(Arc::downgrade(&shared), tx, rx)?;
        Ok(Self { worker, shared })
    }

    pub fn metadata(&self) -> IndexMetadata {
        self.shared.metadata.read().clone()
    }

    pub fn dimension(&self) -> usize {
        self.shared.store.dimension()
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.dir.as_deref()
    }

    /// Start a transaction.
    pub fn begin(&self) -> IndexTransaction<'_> {
        IndexTransaction {
            shared: &self.shared,
            ops: Vec::new(),
        }
    }

    /// Insert or replace one vector in its own transaction. Returns the LSN.
    pub fn put(&self, id: impl Into<RecordId>, vector: &[f32]) -> Result<u64> {
        let mut tx = self.begin();
        tx.put(id, vector)?;
        tx.commit()
    }

    /// Delete one record in its own transaction. Deleting a missing record is
    /// not an error and does not count as a mutation.
    pub fn delete(&self, id: impl Into<RecordId>) -> Result<u64> {
        let mut tx = self.begin();
        tx.delete(id);
        tx.commit()
    }

    pub fn get(&self, id: impl Into<RecordId>) -> Option<VectorEntry> {
        self.shared.store.get(id.into())
    }

    pub fn contains(&self, id: impl Into<RecordId>) -> bool {
        self.shared.store.contains(id.into())
    }

    pub fn count(&self) -> usize {
        self.shared.store.count()
    }

    /// Exact search: the `k` nearest records by graph traversal.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.search_with_overquery(query, k, 1)
    }

    /// Exact search with a layer-0 beam of `max(beam_width, k * overquery_factor)`.
    pub fn search_with_overquery(
        &self,
        query: &[f32],
        k: usize,
        overquery_factor: usize,
    ) -> Result<Vec<SearchHit>> {
        self.shared
            .search_graph(query, k, overquery_factor, SearchBudget::unlimited())
            .map(|r| r.hits)
    }

    /// Approximate search: PQ-scored traversal keeping `k * overquery_factor`
    /// candidates, reranked with exact distances.
    pub fn search_approximate(
        &self,
        query: &[f32],
        k: usize,
        overquery_factor: usize,
    ) -> Result<Vec<SearchHit>> {
        self.search_approximate_with_budget(query, k, overquery_factor, SearchBudget::unlimited())
            .map(|r| r.hits)
    }

    /// Approximate search bounded by `budget`. An exhausted budget returns the best
    /// candidates found so far with `budget_exhausted` set.
    pub fn search_approximate_with_budget(
        &self,
        query: &[f32],
        k: usize,
        overquery_factor: usize,
        budget: SearchBudget,
    ) -> Result<ApproximateResults> {
        self.shared
            .search_approximate(query, k, overquery_factor, budget)
    }

    /// Rebuild the graph now and wait for it to be published. Never searches.
    pub fn build_now(&self) -> Result<BuildReport> {
        let report = self.shared.rebuild(RebuildTrigger::Explicit)?;
        self.shared.clear_rebuild_error();
        Ok(report)
    }

    /// Queue a rebuild on the maintenance worker.
    pub fn build_async(&self) -> Result<BuildHandle> {
        self.worker.submit_build()
    }

    /// Train a new PQ codebook on the live vectors and re-encode all of them.
    /// Returns the new codebook version.
    pub fn train_pq(&self) -> Result<u64> {
        let shared = &self.shared;
        if shared.kind() != QuantizationKind::Product {
            return Err(IndexError::InvalidQuantizationConfig(format!(
                "train_pq requires PRODUCT quantization, index uses {}",
                shared.kind()
            )));
        }
        let _writer = shared.write_lock.lock();
        let (live, _) = shared.store.live_snapshot();
        let samples: Vec<&[f32]> = live.iter().map(|(_, _, v)| &v[..]).collect();
        let codebook = shared.pq.train(&samples)?;
        let version = codebook.version;
        shared.pq.install(codebook, &live)?;
        tracing::info!(version, vectors = live.len(), "trained PQ codebook");
        Ok(version)
    }

    /// Persist snapshots and truncate the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoint()
    }

    /// Change graph settings and rebuild with them.
    pub fn reconfigure(&self, settings: GraphSettings) -> Result<BuildReport> {
        settings.validate()?;
        self.shared.metadata.write().graph = settings;
        let report = self.shared.rebuild(RebuildTrigger::Reconfigure)?;
        self.shared.clear_rebuild_error();
        Ok(report)
    }

    pub fn state(&self) -> IndexState {
        self.shared.state()
    }

    pub fn stats(&self) -> IndexStats {
        self.shared.stats()
    }

    /// Number of the published graph generation.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load().number
    }

    pub fn should_rebuild(&self) -> bool {
        self.shared.scheduler.should_rebuild()
    }

    pub fn mutations_since_build(&self) -> u64 {
        self.shared.scheduler.mutations_since_build()
    }

    /// Error of the last failed automatic rebuild, cleared by the next success.
    pub fn last_rebuild_error(&self) -> Option<String> {
        self.shared.last_rebuild_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::DistanceFunction;
    use crate::quantization::pq::PqParams;

    fn make_embedding(dim: usize, seed: u64) -> Vec<f32> {
        (0..dim)
            .map(|j| {
                (((seed + 1).wrapping_mul(2654435761) + j as u64 * 40503) & 0xFFFF) as f32 / 65535.0
            })
            .collect()
    }

    fn memory_index(metadata: IndexMetadata) -> VectorIndex {
        VectorIndex::create(metadata, Storage::InMemory).unwrap()
    }

    fn small(dim: usize) -> IndexMetadata {
        IndexMetadata::new(dim)
            .with_distance(DistanceFunction::Euclidean)
            .with_mutations_before_rebuild(0)
    }

    #[test]
    fn test_put_get_delete() {
        let index = memory_index(small(4));
        assert_eq!(index.state(), IndexState::Empty);
        index.put(1u64, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(index.count(), 1);
        assert_eq!(&index.get(1u64).unwrap().vector[..], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(index.state(), IndexState::Ready);

        index.delete(1u64).unwrap();
        assert_eq!(index.count(), 0);
        assert!(index.get(1u64).is_none());
        assert_eq!(index.stats().tombstones, 1);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let index = memory_index(small(4));
        assert!(matches!(
            index.put(1u64, &[1.0, 2.0]),
            Err(IndexError::DimensionMismatch { expected: 4, actual: 2 })
        ));
        index.put(1u64, &[0.0; 4]).unwrap();
        assert!(matches!(
            index.search(&[0.0; 3], 1),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_search_on_empty_index() {
        let index = memory_index(small(4));
        assert!(matches!(index.search(&[0.0; 4], 3), Err(IndexError::EmptyIndex)));
    }

    #[test]
    fn test_invalid_k_and_factor() {
        let index = memory_index(small(2));
        index.put(1u64, &[0.0, 1.0]).unwrap();
        assert!(matches!(index.search(&[0.0, 1.0], 0), Err(IndexError::InvalidArgument(_))));
        assert!(matches!(
            index.search_approximate(&[0.0, 1.0], 1, 0),
            Err(IndexError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fewer_live_vectors_than_k() {
        let index = memory_index(small(3));
        for i in 0..4u64 {
            index.put(i, &make_embedding(3, i)).unwrap();
        }
        index.delete(2u64).unwrap();
        let hits = index.search(&make_embedding(3, 0), 10).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].id, RecordId(0));
        assert!(hits.iter().all(|h| h.id != RecordId(2)));
    }

    #[test]
    fn test_update_replaces_vector_in_results() {
        let index = memory_index(small(2));
        index.put(1u64, &[0.0, 0.0]).unwrap();
        index.put(2u64, &[5.0, 5.0]).unwrap();
        index.put(1u64, &[10.0, 10.0]).unwrap();
        let hits = index.search(&[9.0, 9.0], 2).unwrap();
        assert_eq!(hits[0].id, RecordId(1));
        assert_eq!(hits[0].distance, 2.0);
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn test_transaction_is_atomic_and_validated() {
        let index = memory_index(small(2));
        let mut tx = index.begin();
        tx.put(1u64, &[1.0, 0.0]).unwrap();
        tx.put(2u64, &[0.0, 1.0]).unwrap();
        assert!(tx.put(3u64, &[f32::NAN, 0.0]).is_err());
        assert_eq!(index.count(), 0);
        let lsn = tx.commit().unwrap();
        assert_eq!(lsn, 1);
        assert_eq!(index.count(), 2);

        let mut dropped = index.begin();
        dropped.put(9u64, &[1.0, 1.0]).unwrap();
        drop(dropped);
        assert!(!index.contains(9u64));
    }

    #[test]
    fn test_identical_put_is_not_a_mutation() {
        let index = memory_index(small(2).with_mutations_before_rebuild(100));
        index.put(1u64, &[1.0, 2.0]).unwrap();
        index.put(1u64, &[1.0, 2.0]).unwrap();
        index.delete(42u64).unwrap();
        assert_eq!(index.mutations_since_build(), 1);
    }

    #[test]
    fn test_build_now_reclaims_tombstones() {
        let index = memory_index(small(4));
        for i in 0..40u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        for i in 0..10u64 {
            index.delete(i).unwrap();
        }
        assert_eq!(index.stats().tombstones, 10);
        let report = index.build_now().unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.nodes, 30);
        assert_eq!(report.reclaimed_tombstones, 10);
        let stats = index.stats();
        assert_eq!(stats.tombstones, 0);
        assert_eq!(stats.mutations_since_build, 0);
        assert_eq!(index.generation(), 1);
    }

    #[test]
    fn test_synchronous_rebuild_runs_before_next_mutation() {
        let index = memory_index(small(4).with_mutations_before_rebuild(5));
        for i in 0..5u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        assert!(index.should_rebuild());
        assert_eq!(index.generation(), 0);
        index.put(5u64, &make_embedding(4, 5)).unwrap();
        assert_eq!(index.generation(), 1);
        assert_eq!(index.mutations_since_build(), 1);
        assert!(!index.should_rebuild());
    }

    #[test]
    fn test_background_rebuild_publishes_generation() {
        let index = memory_index(
            small(4)
                .with_mutations_before_rebuild(5)
                .with_rebuild_mode(RebuildMode::Background),
        );
        for i in 0..5u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        // A queued explicit build runs after the automatic one
        index.build_async().unwrap().wait().unwrap();
        assert!(index.generation() >= 1);
        assert!(index.last_rebuild_error().is_none());
    }

    #[test]
    fn test_build_handle_cancel_before_start() {
        let index = memory_index(small(4));
        index.put(1u64, &make_embedding(4, 1)).unwrap();
        // Hold the rebuild lock so the first build stays running
        let guard = index.shared.rebuild_lock.lock();
        let first = index.build_async().unwrap();
        let second = index.build_async().unwrap();
        assert!(second.cancel());
        assert!(second.is_finished());
        drop(guard);
        assert!(first.wait().is_ok());
        assert!(matches!(second.wait(), Err(IndexError::BuildCancelled)));
    }

    #[test]
    fn test_int8_search_reranks_exactly() {
        let index = memory_index(small(8).with_quantization(QuantizationKind::Int8));
        for i in 0..200u64 {
            index.put(i, &make_embedding(8, i)).unwrap();
        }
        let query = make_embedding(8, 17);
        let hits = index.search(&query, 5).unwrap();
        assert_eq!(hits[0].id, RecordId(17));
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_binary_search_finds_self() {
        let index = memory_index(
            small(16)
                .with_distance(DistanceFunction::Cosine)
                .with_quantization(QuantizationKind::Binary),
        );
        for i in 0..100u64 {
            let v: Vec<f32> = make_embedding(16, i).iter().map(|x| x - 0.5).collect();
            index.put(i, &v).unwrap();
        }
        let query: Vec<f32> = make_embedding(16, 33).iter().map(|x| x - 0.5).collect();
        let hits = index.search_with_overquery(&query, 3, 10).unwrap();
        assert_eq!(hits[0].id, RecordId(33));
    }

    #[test]
    fn test_pq_small_collection_degrades_to_graph_search() {
        let pq = PqParams {
            subspaces: 2,
            clusters: 64,
            ..PqParams::default()
        };
        let index = memory_index(small(4).with_quantization(QuantizationKind::Product).with_pq(pq));
        for i in 0..10u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        index.build_now().unwrap();
        assert!(index.stats().codebook_version.is_none());
        let hits = index.search_approximate(&make_embedding(4, 3), 1, 2).unwrap();
        assert_eq!(hits[0].id, RecordId(3));
        assert!(matches!(
            index.train_pq(),
            Err(IndexError::InsufficientTrainingData { .. })
        ));
    }

    #[test]
    fn test_pq_untrained_large_collection_fails() {
        let pq = PqParams {
            subspaces: 2,
            clusters: 8,
            ..PqParams::default()
        };
        let index = memory_index(small(4).with_quantization(QuantizationKind::Product).with_pq(pq));
        for i in 0..20u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        assert!(matches!(
            index.search_approximate(&make_embedding(4, 3), 1, 2),
            Err(IndexError::CodebookNotTrained)
        ));
        let version = index.train_pq().unwrap();
        let stats = index.stats();
        assert_eq!(stats.codebook_version, Some(version));
        assert!(stats.codebook_fresh);
        assert_eq!(stats.pq_codes, 20);
        assert!(!index.search_approximate(&make_embedding(4, 3), 3, 4).unwrap().is_empty());
    }

    #[test]
    fn test_train_pq_requires_product() {
        let index = memory_index(small(4));
        assert!(matches!(
            index.train_pq(),
            Err(IndexError::InvalidQuantizationConfig(_))
        ));
    }

    #[test]
    fn test_reconfigure_rebuilds_with_new_settings() {
        let index = memory_index(small(4));
        for i in 0..30u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        let settings = GraphSettings {
            max_connections: 4,
            beam_width: 20,
            add_hierarchy: false,
            store_vectors_in_graph: true,
        };
        let report = index.reconfigure(settings).unwrap();
        assert_eq!(report.nodes, 30);
        let stats = index.stats();
        assert_eq!(stats.max_layer, 0);
        assert_eq!(stats.vector_copies, 30);
        assert_eq!(index.metadata().graph, settings);
        assert!(index
            .reconfigure(GraphSettings {
                max_connections: 1,
                ..settings
            })
            .is_err());
    }

    #[test]
    fn test_reconfigure_reports_its_trigger() {
        let index = memory_index(small(4));
        for i in 0..10u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        assert_eq!(index.build_now().unwrap().trigger, RebuildTrigger::Explicit);
        let settings = index.metadata().graph;
        let report = index.reconfigure(settings).unwrap();
        assert_eq!(report.trigger, RebuildTrigger::Reconfigure);
        assert_eq!(report.generation, 2);
        assert_eq!(index.stats().graph_built_from_lsn, 10);
    }

    #[test]
    fn test_memory_index_log_keeps_no_batches() {
        let index = memory_index(small(4));
        for i in 0..500u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        for i in 0..500u64 {
            index.delete(i).unwrap();
        }
        assert_eq!(index.count(), 0);
        let (batches, stats) = index.shared.log.replay().unwrap();
        assert!(batches.is_empty());
        assert_eq!(stats.success, 0);
        index.checkpoint().unwrap();
    }

    #[test]
    fn test_rebuild_catches_up_with_concurrent_commits() {
        let index = memory_index(small(4));
        for i in 0..50u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        let (reached_tx, reached_rx) = crossbeam::channel::bounded(1);
        let (resume_tx, resume_rx) = crossbeam::channel::bounded(1);
        *index.shared.rebuild_pause.lock() = Some(generation::RebuildPause {
            reached: reached_tx,
            resume: resume_rx,
        });
        let handle = index.build_async().unwrap();
        reached_rx.recv().unwrap();

        // Lands between the snapshot and the publish
        let mut tx = index.begin();
        tx.put(100u64, &make_embedding(4, 100)).unwrap();
        tx.put(7u64, &make_embedding(4, 700)).unwrap();
        tx.delete(3u64);
        tx.commit().unwrap();
        resume_tx.send(()).unwrap();
        let report = handle.wait().unwrap();

        assert_eq!(report.generation, 1);
        assert_eq!(report.caught_up, 3);
        let stats = index.stats();
        assert_eq!(stats.live_count, 50);
        assert_eq!(stats.graph_nodes - stats.tombstones, stats.live_count);
        assert_eq!(stats.graph_built_from_lsn, stats.applied_lsn);

        for id in (0..50u64).chain([100]).filter(|&id| id != 3) {
            let vector = index.get(id).unwrap().vector;
            let hits = index.search(&vector, 50).unwrap();
            assert_eq!(hits[0].id, RecordId(id));
            assert_eq!(hits[0].distance, 0.0);
            assert!(hits.iter().all(|h| h.id != RecordId(3)));
        }
        assert!(!index.contains(3u64));
    }

    #[test]
    fn test_search_reaches_live_records_behind_tombstones() {
        let index = memory_index(small(4));
        for i in 0..400u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        let mut tx = index.begin();
        for i in (0..400u64).filter(|i| i % 10 != 0) {
            tx.delete(i);
        }
        tx.commit().unwrap();
        let stats = index.stats();
        assert_eq!(stats.tombstones, 360);
        assert_eq!(stats.generation, 0);

        for id in (0..400u64).step_by(10) {
            let hits = index.search(&make_embedding(4, id), 1).unwrap();
            assert_eq!(hits[0].id, RecordId(id));
        }
    }

    #[test]
    fn test_budgeted_search_reports_exhaustion() {
        let index = memory_index(small(4));
        for i in 0..300u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        let results = index
            .search_approximate_with_budget(
                &make_embedding(4, 1),
                10,
                4,
                SearchBudget::with_max_visits(3),
            )
            .unwrap();
        assert!(results.budget_exhausted);
        assert!(results.hits.len() <= 3);
    }

    #[test]
    fn test_stats_report_caches_and_memory() {
        let index = memory_index(small(4));
        for i in 0..20u64 {
            index.put(i, &make_embedding(4, i)).unwrap();
        }
        index.search(&make_embedding(4, 2), 3).unwrap();
        let stats = index.stats();
        assert_eq!(stats.live_count, 20);
        assert!(stats.location_cache.misses > 0);
        assert!(stats.memory_bytes > 0);
        assert_eq!(stats.vector_copies, 0);
    }
}
