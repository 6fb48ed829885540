//! Storage layer: vector store, write-ahead log, and snapshot persistence.
//!
//! Live records are held in memory by the [`VectorStore`]. Durability is provided
//! by a [`DurableLog`] (CRC32 + fsync for [`SyncWriteAheadLog`]) and bincode
//! snapshots written at checkpoints (atomic temp-file + rename).

/// Snapshot save/load with atomic writes and CRC32 footers.
pub mod persistence;
/// Record map keyed by [`RecordId`](crate::record::RecordId).
pub mod store;
/// Write-Ahead Log with CRC32 checksums.
pub mod wal;

pub use persistence::{GraphSnapshot, GraphSnapshotRef, VectorSnapshot};
pub use store::{AppliedOp, StoredRecord, VectorEntry, VectorStore};
pub use wal::{DurableLog, MemoryLog, ReplayStats, SyncWriteAheadLog, WalBatch, WalOp};
