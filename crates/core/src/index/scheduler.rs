//! Count-based rebuild policy.
//!
//! A rebuild is due once the number of mutations since the last completed build
//! reaches `mutations_before_rebuild`. The decision depends on the mutation
//! history only, never on wall-clock time.

use crate::index::metadata::RebuildMode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Inserts, updates and deletes since the last completed graph build.
#[derive(Debug, Default)]
pub struct MutationCounter(AtomicU64);

impl MutationCounter {
    pub fn record(&self, mutations: u64) {
        self.0.fetch_add(mutations, Ordering::AcqRel);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct RebuildScheduler {
    counter: MutationCounter,
    threshold: u64,
    mode: RebuildMode,
    /// A background rebuild request is queued or running.
    pending: AtomicBool,
}

impl RebuildScheduler {
    pub fn new(mutations_before_rebuild: usize, mode: RebuildMode) -> Self {
        Self {
            counter: MutationCounter::default(),
            threshold: mutations_before_rebuild as u64,
            mode,
            pending: AtomicBool::new(false),
        }
    }

    pub fn record_mutation(&self) {
        self.record_mutations(1);
    }

    pub fn record_mutations(&self, mutations: u64) {
        if mutations > 0 {
            self.counter.record(mutations);
        }
    }

    pub fn should_rebuild(&self) -> bool {
        self.threshold > 0 && self.counter.get() >= self.threshold
    }

    pub fn mutations_since_build(&self) -> u64 {
        self.counter.get()
    }

    pub fn mode(&self) -> RebuildMode {
        self.mode
    }

    /// Called when a build is published.
    pub fn reset(&self) {
        self.counter.reset();
    }

    /// Claim the right to queue a background rebuild. Returns `false` when no
    /// rebuild is due or one is already queued.
    pub(crate) fn claim_background(&self) -> bool {
        self.should_rebuild() && !self.pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_background(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_count_based() {
        let s = RebuildScheduler::new(3, RebuildMode::Synchronous);
        s.record_mutation();
        s.record_mutation();
        assert!(!s.should_rebuild());
        s.record_mutation();
        assert!(s.should_rebuild());
        assert_eq!(s.mutations_since_build(), 3);
        s.reset();
        assert!(!s.should_rebuild());
        assert_eq!(s.mutations_since_build(), 0);
    }

    #[test]
    fn test_zero_threshold_disables_rebuilds() {
        let s = RebuildScheduler::new(0, RebuildMode::Synchronous);
        s.record_mutations(1_000_000);
        assert!(!s.should_rebuild());
    }

    #[test]
    fn test_background_claim_is_deduplicated() {
        let s = RebuildScheduler::new(1, RebuildMode::Background);
        assert!(!s.claim_background());
        s.record_mutation();
        assert!(s.claim_background());
        assert!(!s.claim_background());
        s.release_background();
        assert!(s.claim_background());
    }
}
