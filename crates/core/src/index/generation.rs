//! Graph generations and the full rebuild pipeline.
//!
//! The published graph lives behind an `ArcSwap<GraphGeneration>`. Searches load
//! the current `Arc` once and keep it until they finish, so a rebuild that
//! publishes a new generation never changes the graph under a running search; the
//! old generation is freed when its last reader drops it.

use crate::error::{IndexError, Result};
use crate::hnsw::GraphIndex;
use crate::index::IndexShared;
use crate::quantization::pq::PqCodebook;
use crate::quantization::QuantizationKind;
use crate::record::RecordId;
use parking_lot::{MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One published version of the graph.
#[derive(Debug)]
pub struct GraphGeneration {
    pub number: u64,
    /// Store LSN the graph reflected when it was published.
    pub built_from_lsn: u64,
    /// Incremental inserts and deletes take the write lock; searches the read lock.
    pub graph: RwLock<GraphIndex>,
}

impl GraphGeneration {
    pub fn new(number: u64, graph: GraphIndex, built_from_lsn: u64) -> Self {
        Self {
            number,
            built_from_lsn,
            graph: RwLock::new(graph),
        }
    }
}

/// Why a rebuild ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildTrigger {
    /// `build_now()` or `build_async()`.
    Explicit,
    /// Mutation threshold crossed.
    Automatic,
    /// Graph settings changed.
    Reconfigure,
    /// No usable graph snapshot on open.
    Recovery,
}

/// Summary of a published rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub generation: u64,
    pub trigger: RebuildTrigger,
    pub nodes: usize,
    /// Tombstones held by the replaced generation.
    pub reclaimed_tombstones: usize,
    /// Records written or deleted while the graph was being built.
    pub caught_up: usize,
    pub codebook_version: Option<u64>,
    pub duration: Duration,
}

/// Sets a flag for the lifetime of the guard.
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    pub(crate) fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type LiveEntries = Vec<(RecordId, u64, Arc<[f32]>)>;

/// Holds a rebuild between phases B and C until the test releases it.
#[cfg(test)]
pub(crate) struct RebuildPause {
    pub(crate) reached: crossbeam::channel::Sender<()>,
    pub(crate) resume: crossbeam::channel::Receiver<()>,
}

/// A freshly built graph must be structurally sound before it replaces the
/// published one.
fn check_publishable(graph: &GraphIndex) -> Result<()> {
    graph.validate().map_err(IndexError::RebuildFailed)
}

impl IndexShared {
    /// Run a full rebuild, waiting for any rebuild already in progress.
    pub(crate) fn rebuild(&self, trigger: RebuildTrigger) -> Result<BuildReport> {
        let exclusive = self.rebuild_lock.lock();
        self.rebuild_locked(trigger, exclusive)
    }

    /// Run a full rebuild unless one is already in progress.
    pub(crate) fn try_rebuild(&self, trigger: RebuildTrigger) -> Option<Result<BuildReport>> {
        let exclusive = self.rebuild_lock.try_lock()?;
        Some(self.rebuild_locked(trigger, exclusive))
    }

    /// Rebuild pipeline:
    ///
    /// - **Phase A**: snapshot live entries (store read lock only).
    /// - **Phase B**: build a fresh graph by re-inserting every live entry in id
    ///   order, and train the PQ codebook, without blocking mutations or searches.
    /// - **Phase C**: under the mutation lock, catch up with entries written or
    ///   deleted since the snapshot, install the codebook, publish the new
    ///   generation and reset the mutation counter.
    ///
    /// A failure before phase C leaves the previous generation published.
    fn rebuild_locked(&self, trigger: RebuildTrigger, _exclusive: MutexGuard<'_, ()>) -> Result<BuildReport> {
        let _running = FlagGuard::raise(&self.rebuilding);
        let started = Instant::now();

        // Phase A
        let (live, snapshot_lsn) = self.store.live_snapshot();
        let config = self.metadata.read().graph_config();
        tracing::debug!(?trigger, records = live.len(), snapshot_lsn, "rebuild started");

        // Phase B
        let by_id: HashMap<RecordId, (u64, &Arc<[f32]>)> =
            live.iter().map(|(id, version, v)| (*id, (*version, v))).collect();
        let snapshot_source = |id: RecordId, version: u64| {
            self.build_cache.get_or_load((id, version), || {
                by_id
                    .get(&id)
                    .filter(|(v, _)| *v == version)
                    .map(|(_, vector)| Arc::clone(vector))
            })
        };
        let mut graph = GraphIndex::new(config);
        for (id, version, vector) in &live {
            graph.insert(*id, *version, Arc::clone(vector), &snapshot_source);
        }
        let codebook = match self.store.encoder().kind() {
            QuantizationKind::Product => self.train_codebook(&live)?,
            _ => None,
        };

        self.pause_before_catch_up();

        // Phase C
        let _writer = self.write_lock.lock();
        let store_source = self.store_source();
        let mut caught_up = 0;
        for (id, _, _) in &live {
            if !self.store.contains(*id) && graph.mark_deleted(*id).is_some() {
                caught_up += 1;
            }
        }
        for (id, version, vector) in self.store.written_after(snapshot_lsn) {
            graph.insert(id, version, vector, &store_source);
            caught_up += 1;
        }
        check_publishable(&graph)?;
        let codebook_version = match codebook {
            Some(cb) => {
                let version = cb.version;
                self.pq.install(cb, &self.store.live_snapshot().0)?;
                Some(version)
            }
            None => self.pq.codebook().map(|cb| cb.version),
        };

        let previous = self.generation.load_full();
        let reclaimed_tombstones = previous.graph.read().tombstone_count();
        let report = BuildReport {
            generation: previous.number + 1,
            trigger,
            nodes: graph.len(),
            reclaimed_tombstones,
            caught_up,
            codebook_version,
            duration: started.elapsed(),
        };
        self.generation.store(Arc::new(GraphGeneration::new(
            report.generation,
            graph,
            self.store.applied_lsn(),
        )));
        self.scheduler.reset();

        tracing::info!(
            generation = report.generation,
            nodes = report.nodes,
            reclaimed_tombstones,
            caught_up,
            ?trigger,
            elapsed_ms = report.duration.as_millis() as u64,
            "published graph generation"
        );
        let build_cache = self.build_cache.stats();
        let location_cache = self.location_cache.stats();
        tracing::debug!(
            build_cache_len = build_cache.len,
            build_cache_hit_rate = build_cache.hit_rate(),
            location_cache_len = location_cache.len,
            location_cache_hit_rate = location_cache.hit_rate(),
            "cache statistics after rebuild"
        );
        Ok(report)
    }

    #[cfg(test)]
    fn pause_before_catch_up(&self) {
        let pause = self.rebuild_pause.lock().take();
        if let Some(pause) = pause {
            let _ = pause.reached.send(());
            let _ = pause.resume.recv();
        }
    }

    #[cfg(not(test))]
    fn pause_before_catch_up(&self) {}

    /// Train a codebook on the snapshot. `None` when the collection is still
    /// smaller than `pq_clusters`; the previous codebook, if any, stays installed.
    fn train_codebook(&self, live: &LiveEntries) -> Result<Option<PqCodebook>> {
        let required = self.pq.params().clusters;
        if live.len() < required {
            tracing::warn!(
                available = live.len(),
                required,
                "skipping PQ training: not enough live vectors"
            );
            return Ok(None);
        }
        let samples: Vec<&[f32]> = live.iter().map(|(_, _, v)| &v[..]).collect();
        self.pq.train(&samples).map(Some)
    }
}
