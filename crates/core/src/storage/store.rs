//! Vector store: the single source of truth for which records exist.
//!
//! Maps [`RecordId`] to its full-precision vector and stored payload. The store
//! never writes to the log itself; the index appends a [`WalBatch`] first and
//! then applies it here, so replaying the same batches rebuilds the same state.

use crate::error::{IndexError, Result};
use crate::quantization::{VectorEncoder, VectorPayload};
use crate::record::RecordId;
use crate::storage::wal::{WalBatch, WalOp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A stored vector. `version` is the LSN of the batch that last wrote it.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub id: RecordId,
    pub version: u64,
    pub vector: Arc<[f32]>,
    pub payload: VectorPayload,
}

impl VectorEntry {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Effect of applying one operation.
#[derive(Debug, Clone)]
pub enum AppliedOp {
    Inserted(VectorEntry),
    Updated {
        previous_version: u64,
        entry: VectorEntry,
    },
    /// Re-put of an identical vector. No state changed.
    Unchanged(RecordId),
    Deleted(VectorEntry),
    /// Delete of a record that does not exist. No state changed.
    Missing(RecordId),
}

impl AppliedOp {
    /// Whether the operation changed the store (and counts as a mutation).
    pub fn is_mutation(&self) -> bool {
        !matches!(self, AppliedOp::Unchanged(_) | AppliedOp::Missing(_))
    }
}

/// Serialized form of one live record inside a vector snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    pub version: u64,
    pub vector: Vec<f32>,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<RecordId, VectorEntry>,
    applied_lsn: u64,
}

/// In-memory record map guarded by a `parking_lot::RwLock`.
#[derive(Debug)]
pub struct VectorStore {
    encoder: VectorEncoder,
    inner: RwLock<StoreInner>,
}

impl VectorStore {
    pub fn new(encoder: VectorEncoder) -> Self {
        Self {
            encoder,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn encoder(&self) -> &VectorEncoder {
        &self.encoder
    }

    pub fn dimension(&self) -> usize {
        self.encoder.dimension()
    }

    /// Check every operation of a batch before anything is applied.
    pub fn validate_batch(&self, batch: &WalBatch) -> Result<()> {
        for op in &batch.ops {
            if let WalOp::Put { vector, .. } = op {
                self.encoder.check_dimension(vector.len())?;
                if vector.iter().any(|x| !x.is_finite()) {
                    return Err(IndexError::InvalidArgument(format!(
                        "vector for {} contains non-finite values",
                        op.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply a committed batch. Entries written by it get `version = batch.lsn`.
    ///
    /// Batches at or below the applied LSN are ignored, which makes replay idempotent.
    pub fn apply_batch(&self, batch: &WalBatch) -> Result<Vec<AppliedOp>> {
        self.validate_batch(batch)?;
        let mut inner = self.inner.write();
        if batch.lsn <= inner.applied_lsn {
            return Ok(Vec::new());
        }
        let mut applied = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            let outcome = match op {
                WalOp::Put { id, vector } => {
                    let unchanged = inner
                        .entries
                        .get(id)
                        .is_some_and(|e| e.vector[..] == vector[..]);
                    if unchanged {
                        AppliedOp::Unchanged(*id)
                    } else {
                        let raw: Arc<[f32]> = vector.as_slice().into();
                        let entry = VectorEntry {
                            id: *id,
                            version: batch.lsn,
                            payload: self.encoder.encode_stored(&raw)?,
                            vector: raw,
                        };
                        match inner.entries.insert(*id, entry.clone()) {
                            Some(previous) => AppliedOp::Updated {
                                previous_version: previous.version,
                                entry,
                            },
                            None => AppliedOp::Inserted(entry),
                        }
                    }
                }
                WalOp::Delete { id } => match inner.entries.remove(id) {
                    Some(previous) => AppliedOp::Deleted(previous),
                    None => AppliedOp::Missing(*id),
                },
            };
            applied.push(outcome);
        }
        inner.applied_lsn = batch.lsn;
        Ok(applied)
    }

    pub fn get(&self, id: RecordId) -> Option<VectorEntry> {
        self.inner.read().entries.get(&id).cloned()
    }

    /// The entry for `id`, only if it is still at `version`.
    pub fn get_version(&self, id: RecordId, version: u64) -> Option<VectorEntry> {
        self.inner
            .read()
            .entries
            .get(&id)
            .filter(|e| e.version == version)
            .cloned()
    }

    /// The full-precision vector for `id`, only if it is still at `version`.
    pub fn vector_at(&self, id: RecordId, version: u64) -> Option<Arc<[f32]>> {
        self.inner
            .read()
            .entries
            .get(&id)
            .filter(|e| e.version == version)
            .map(|e| Arc::clone(&e.vector))
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.inner.read().entries.contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn applied_lsn(&self) -> u64 {
        self.inner.read().applied_lsn
    }

    /// All live `(id, version, vector)` triples in ascending id order, and the
    /// LSN they reflect.
    pub fn live_snapshot(&self) -> (Vec<(RecordId, u64, Arc<[f32]>)>, u64) {
        let inner = self.inner.read();
        let mut live: Vec<_> = inner
            .entries
            .values()
            .map(|e| (e.id, e.version, Arc::clone(&e.vector)))
            .collect();
        live.sort_unstable_by_key(|(id, _, _)| *id);
        (live, inner.applied_lsn)
    }

    /// Live entries written by batches after `lsn`, in ascending id order.
    pub fn written_after(&self, lsn: u64) -> Vec<(RecordId, u64, Arc<[f32]>)> {
        let inner = self.inner.read();
        let mut out: Vec<_> = inner
            .entries
            .values()
            .filter(|e| e.version > lsn)
            .map(|e| (e.id, e.version, Arc::clone(&e.vector)))
            .collect();
        out.sort_unstable_by_key(|(id, _, _)| *id);
        out
    }

    /// Records for a vector snapshot, in ascending id order.
    pub fn to_records(&self) -> (Vec<StoredRecord>, u64) {
        let inner = self.inner.read();
        let mut records: Vec<StoredRecord> = inner
            .entries
            .values()
            .map(|e| StoredRecord {
                id: e.id,
                version: e.version,
                vector: e.vector.to_vec(),
            })
            .collect();
        records.sort_unstable_by_key(|r| r.id);
        (records, inner.applied_lsn)
    }

    /// Replace the contents with snapshot records. Payloads are re-encoded.
    pub fn load_records(&self, records: Vec<StoredRecord>, applied_lsn: u64) -> Result<()> {
        let mut entries = HashMap::with_capacity(records.len());
        for r in records {
            self.encoder.check_dimension(r.vector.len())?;
            if r.version > applied_lsn {
                return Err(IndexError::CorruptSnapshot(format!(
                    "record {} has version {} beyond snapshot LSN {}",
                    r.id, r.version, applied_lsn
                )));
            }
            let raw: Arc<[f32]> = r.vector.into();
            let entry = VectorEntry {
                id: r.id,
                version: r.version,
                payload: self.encoder.encode_stored(&raw)?,
                vector: raw,
            };
            entries.insert(r.id, entry);
        }
        let mut inner = self.inner.write();
        inner.entries = entries;
        inner.applied_lsn = applied_lsn;
        Ok(())
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        let inner = self.inner.read();
        inner
            .entries
            .values()
            .map(|e| e.vector.len() * 4 + e.payload.memory_bytes() + 64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::QuantizationKind;

    fn store(kind: QuantizationKind) -> VectorStore {
        VectorStore::new(VectorEncoder::new(3, kind))
    }

    fn put(lsn: u64, id: u64, vector: Vec<f32>) -> WalBatch {
        WalBatch {
            lsn,
            ops: vec![WalOp::Put {
                id: RecordId(id),
                vector,
            }],
        }
    }

    fn delete(lsn: u64, id: u64) -> WalBatch {
        WalBatch {
            lsn,
            ops: vec![WalOp::Delete { id: RecordId(id) }],
        }
    }

    #[test]
    fn test_put_get_delete() {
        let s = store(QuantizationKind::None);
        let applied = s.apply_batch(&put(1, 7, vec![1.0, 2.0, 3.0])).unwrap();
        assert!(matches!(applied[0], AppliedOp::Inserted(_)));
        let e = s.get(RecordId(7)).unwrap();
        assert_eq!(e.version, 1);
        assert_eq!(&e.vector[..], &[1.0, 2.0, 3.0]);
        assert_eq!(s.count(), 1);

        let applied = s.apply_batch(&delete(2, 7)).unwrap();
        assert!(matches!(applied[0], AppliedOp::Deleted(_)));
        assert!(s.get(RecordId(7)).is_none());
        assert_eq!(s.count(), 0);
        assert_eq!(s.applied_lsn(), 2);
    }

    #[test]
    fn test_update_bumps_version() {
        let s = store(QuantizationKind::Int8);
        s.apply_batch(&put(1, 1, vec![1.0, 2.0, 3.0])).unwrap();
        let applied = s.apply_batch(&put(2, 1, vec![3.0, 2.0, 1.0])).unwrap();
        match &applied[0] {
            AppliedOp::Updated {
                previous_version,
                entry,
            } => {
                assert_eq!(*previous_version, 1);
                assert_eq!(entry.version, 2);
                assert!(matches!(entry.payload, VectorPayload::Int8(_)));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_put_is_unchanged() {
        let s = store(QuantizationKind::None);
        s.apply_batch(&put(1, 1, vec![1.0, 2.0, 3.0])).unwrap();
        let applied = s.apply_batch(&put(2, 1, vec![1.0, 2.0, 3.0])).unwrap();
        assert!(matches!(applied[0], AppliedOp::Unchanged(_)));
        assert!(!applied[0].is_mutation());
        assert_eq!(s.get(RecordId(1)).unwrap().version, 1);
    }

    #[test]
    fn test_replayed_batch_is_ignored() {
        let s = store(QuantizationKind::None);
        let batch = put(1, 1, vec![1.0, 2.0, 3.0]);
        s.apply_batch(&batch).unwrap();
        assert!(s.apply_batch(&batch).unwrap().is_empty());
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn test_dimension_validated_before_apply() {
        let s = store(QuantizationKind::None);
        let batch = WalBatch {
            lsn: 1,
            ops: vec![
                WalOp::Put {
                    id: RecordId(1),
                    vector: vec![1.0, 2.0, 3.0],
                },
                WalOp::Put {
                    id: RecordId(2),
                    vector: vec![1.0],
                },
            ],
        };
        assert!(matches!(
            s.apply_batch(&batch),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert_eq!(s.count(), 0);
        assert_eq!(s.applied_lsn(), 0);
    }

    #[test]
    fn test_records_roundtrip() {
        let s = store(QuantizationKind::Binary);
        s.apply_batch(&put(1, 2, vec![1.0, -2.0, 3.0])).unwrap();
        s.apply_batch(&put(2, 1, vec![-1.0, 2.0, 3.0])).unwrap();
        let (records, lsn) = s.to_records();
        assert_eq!(records[0].id, RecordId(1));

        let restored = store(QuantizationKind::Binary);
        restored.load_records(records, lsn).unwrap();
        assert_eq!(restored.count(), 2);
        assert_eq!(restored.applied_lsn(), 2);
        assert_eq!(restored.get(RecordId(2)).unwrap().payload, s.get(RecordId(2)).unwrap().payload);
    }

    #[test]
    fn test_version_filtering() {
        let s = store(QuantizationKind::None);
        s.apply_batch(&put(5, 1, vec![1.0, 1.0, 1.0])).unwrap();
        assert!(s.vector_at(RecordId(1), 5).is_some());
        assert!(s.vector_at(RecordId(1), 4).is_none());
        assert_eq!(s.written_after(4).len(), 1);
        assert!(s.written_after(5).is_empty());
    }
}
