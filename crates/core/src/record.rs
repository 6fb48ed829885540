//! Record identity and search result types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque record key assigned by the caller.
///
/// Ordering is significant: full rebuilds re-insert live records in ascending
/// `RecordId` order so that two rebuilds of the same data produce the same graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        RecordId(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A ranked search result. Lower `distance` is closer for every distance function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: RecordId,
    pub distance: f32,
}

/// Results of an approximate search that may have been cut short by a budget.
#[derive(Debug, Clone, Default)]
pub struct ApproximateResults {
    pub hits: Vec<SearchHit>,
    /// `true` when the deadline or visit budget stopped the traversal early;
    /// `hits` then holds the best candidates found so far.
    pub budget_exhausted: bool,
}
