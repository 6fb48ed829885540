//! Write-ahead log: the durability boundary of the index.
//!
//! Every committed transaction is appended to the log as one [`WalBatch`] before
//! it is applied in memory. [`DurableLog`] is the seam to the host's log;
//! [`SyncWriteAheadLog`] is the file-backed implementation, [`MemoryLog`] backs
//! volatile indexes and retains no batches.
//!
//! On disk each batch is framed as `[u32 length BE][u32 CRC32 BE][bincode payload]`
//! and durably flushed with `fsync` before `append` returns.

use crate::config;
use crate::error::Result;
use crate::record::RecordId;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// A single mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    Put { id: RecordId, vector: Vec<f32> },
    Delete { id: RecordId },
}

impl WalOp {
    pub fn id(&self) -> RecordId {
        match self {
            WalOp::Put { id, .. } | WalOp::Delete { id } => *id,
        }
    }
}

/// All operations of one committed transaction, tagged with its log sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalBatch {
    pub lsn: u64,
    pub ops: Vec<WalOp>,
}

/// Diagnostic statistics from a WAL replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Number of batches successfully deserialized.
    pub success: usize,
    /// Number of frames whose CRC was valid but whose payload did not decode.
    pub skipped: usize,
    /// Number of CRC mismatches encountered (replay stopped).
    pub crc_errors: usize,
    /// Whether replay was terminated by a truncated final frame.
    pub truncated: bool,
}

/// Boundary to the host write-ahead log.
///
/// `append` must not return before the batch is durable. `freeze` blocks appends
/// while a checkpoint writes snapshots and truncates the log.
pub trait DurableLog: Send + Sync {
    fn append(&self, batch: &WalBatch) -> Result<()>;
    fn replay(&self) -> Result<(Vec<WalBatch>, ReplayStats)>;
    fn truncate(&self) -> Result<()>;
    fn freeze(&self) -> RwLockWriteGuard<'_, ()>;
}

/// Synchronous append-only write-ahead log with CRC32 integrity checks.
///
/// Thread-safe via `parking_lot::Mutex`. Each [`append`](DurableLog::append)
/// call serializes, writes, flushes, and fsyncs the batch before returning.
pub struct SyncWriteAheadLog {
    writer: Mutex<BufWriter<File>>,
    /// Write gate: freeze() takes exclusive, append() takes shared.
    write_gate: RwLock<()>,
    path: PathBuf,
}

impl SyncWriteAheadLog {
    /// Open or create the WAL file in append mode inside `data_dir`.
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(config::WAL_FILE_NAME);
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(&path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            write_gate: RwLock::new(()),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableLog for SyncWriteAheadLog {
    fn append(&self, batch: &WalBatch) -> Result<()> {
        let framed = serialize_and_frame(batch)?;

        let _gate = self.write_gate.read();
        let mut w = self.writer.lock();
        w.write_all(&framed)?;
        w.flush()?;
        w.get_mut().sync_all()?;
        Ok(())
    }

    /// Read all batches sequentially, verifying CRC32 checksums.
    ///
    /// A truncated final frame ends replay and sets `stats.truncated`; a CRC
    /// mismatch ends replay and is counted in `stats.crc_errors`. Callers decide
    /// which of these are fatal.
    fn replay(&self) -> Result<(Vec<WalBatch>, ReplayStats)> {
        // Make sure buffered bytes are visible to the reader
        self.writer.lock().flush()?;

        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut batches = Vec::new();
        let mut stats = ReplayStats::default();
        let mut header_buf = [0u8; 8];

        loop {
            match read_full(&mut reader, &mut header_buf)? {
                ReadOutcome::Complete => {}
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    tracing::warn!(path = ?self.path, "WAL truncated mid-header, stopping replay");
                    stats.truncated = true;
                    break;
                }
            }
            let len =
                u32::from_be_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]])
                    as usize;
            let stored_crc =
                u32::from_be_bytes([header_buf[4], header_buf[5], header_buf[6], header_buf[7]]);
            let mut data = vec![0u8; len];
            match read_full(&mut reader, &mut data)? {
                ReadOutcome::Complete => {}
                ReadOutcome::Eof | ReadOutcome::Partial => {
                    tracing::warn!(path = ?self.path, "WAL truncated mid-entry, stopping replay");
                    stats.truncated = true;
                    break;
                }
            }
            let computed_crc = crc32fast::hash(&data);
            if computed_crc != stored_crc {
                tracing::warn!(
                    stored = format_args!("{:#010x}", stored_crc),
                    computed = format_args!("{:#010x}", computed_crc),
                    "WAL entry CRC mismatch, stopping replay"
                );
                stats.crc_errors += 1;
                break;
            }
            match bincode::deserialize::<WalBatch>(&data) {
                Ok(batch) => {
                    batches.push(batch);
                    stats.success += 1;
                }
                Err(e) => {
                    tracing::warn!("WAL entry deserialization failed, skipping: {}", e);
                    stats.skipped += 1;
                }
            }
        }

        Ok((batches, stats))
    }

    /// Truncate the WAL file, fsync, and reopen in append mode.
    fn truncate(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        let truncated = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        truncated.sync_all()?;
        *writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        );
        Ok(())
    }

    fn freeze(&self) -> RwLockWriteGuard<'_, ()> {
        self.write_gate.write()
    }
}

/// Log for in-memory indexes. Nothing survives the process, so there is nothing
/// to replay: only the last appended LSN is kept.
#[derive(Default)]
pub struct MemoryLog {
    last_lsn: AtomicU64,
    write_gate: RwLock<()>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// LSN of the most recent append, 0 if none.
    pub fn last_lsn(&self) -> u64 {
        self.last_lsn.load(Ordering::Acquire)
    }
}

impl DurableLog for MemoryLog {
    fn append(&self, batch: &WalBatch) -> Result<()> {
        let _gate = self.write_gate.read();
        self.last_lsn.fetch_max(batch.lsn, Ordering::AcqRel);
        Ok(())
    }

    fn replay(&self) -> Result<(Vec<WalBatch>, ReplayStats)> {
        Ok((Vec::new(), ReplayStats::default()))
    }

    fn truncate(&self) -> Result<()> {
        Ok(())
    }

    fn freeze(&self) -> RwLockWriteGuard<'_, ()> {
        self.write_gate.write()
    }
}

enum ReadOutcome {
    Complete,
    /// No bytes at all were available.
    Eof,
    /// Some, but not all, bytes were available.
    Partial,
}

/// `read_exact` that distinguishes a clean end of file from a torn frame.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(if filled == buf.len() {
        ReadOutcome::Complete
    } else if filled == 0 {
        ReadOutcome::Eof
    } else {
        ReadOutcome::Partial
    })
}

/// Serialize a batch into its on-disk frame format:
/// `[u32 len BE][u32 crc32 BE][bincode payload]`.
fn serialize_and_frame(batch: &WalBatch) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(batch)?;
    let len = bytes.len() as u32;
    let crc = crc32fast::hash(&bytes);

    let mut framed = Vec::with_capacity(8 + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(lsn: u64, id: u64, vector: Vec<f32>) -> WalBatch {
        WalBatch {
            lsn,
            ops: vec![WalOp::Put {
                id: RecordId(id),
                vector,
            }],
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let wal = SyncWriteAheadLog::open(dir.path()).unwrap();
        wal.append(&put(1, 10, vec![1.0, 2.0])).unwrap();
        wal.append(&WalBatch {
            lsn: 2,
            ops: vec![WalOp::Delete { id: RecordId(10) }],
        })
        .unwrap();

        let (batches, stats) = wal.replay().unwrap();
        assert_eq!(stats.success, 2);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.crc_errors, 0);
        assert!(!stats.truncated);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], put(1, 10, vec![1.0, 2.0]));
        assert_eq!(batches[1].ops[0].id(), RecordId(10));
    }

    #[test]
    fn test_truncate_clears_wal() {
        let dir = tempfile::tempdir().unwrap();
        let wal = SyncWriteAheadLog::open(dir.path()).unwrap();
        wal.append(&put(1, 1, vec![0.5])).unwrap();
        wal.truncate().unwrap();
        let (batches, _) = wal.replay().unwrap();
        assert!(batches.is_empty(), "WAL should be empty after truncate");
        wal.append(&put(2, 2, vec![0.5])).unwrap();
        assert_eq!(wal.replay().unwrap().0.len(), 1);
    }

    #[test]
    fn test_crc_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = SyncWriteAheadLog::open(dir.path()).unwrap();
            wal.append(&put(1, 1, vec![1.0, 2.0, 3.0])).unwrap();
        }
        let wal_path = dir.path().join(config::WAL_FILE_NAME);
        let mut data = std::fs::read(&wal_path).unwrap();
        data[10] ^= 0xFF;
        std::fs::write(&wal_path, &data).unwrap();

        let wal = SyncWriteAheadLog::open(dir.path()).unwrap();
        let (batches, stats) = wal.replay().unwrap();
        assert!(batches.is_empty());
        assert_eq!(stats.crc_errors, 1);
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = SyncWriteAheadLog::open(dir.path()).unwrap();
            wal.append(&put(1, 1, vec![1.0])).unwrap();
            wal.append(&put(2, 2, vec![2.0])).unwrap();
        }
        let wal_path = dir.path().join(config::WAL_FILE_NAME);
        let data = std::fs::read(&wal_path).unwrap();
        std::fs::write(&wal_path, &data[..data.len() - 3]).unwrap();

        let wal = SyncWriteAheadLog::open(dir.path()).unwrap();
        let (batches, stats) = wal.replay().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lsn, 1);
        assert!(stats.truncated);
        assert_eq!(stats.crc_errors, 0);
    }

    #[test]
    fn test_freeze_blocks_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let wal = SyncWriteAheadLog::open(dir.path()).unwrap();
        wal.append(&put(1, 1, vec![1.0])).unwrap();
        {
            let _gate = wal.freeze();
            wal.truncate().unwrap();
        }
        wal.append(&put(2, 2, vec![1.0])).unwrap();
        let (batches, _) = wal.replay().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lsn, 2);
    }

    #[test]
    fn test_memory_log_retains_no_batches() {
        let log = MemoryLog::new();
        for lsn in 1..=1_000 {
            log.append(&put(lsn, lsn, vec![lsn as f32; 64])).unwrap();
        }
        assert_eq!(log.last_lsn(), 1_000);
        let (batches, stats) = log.replay().unwrap();
        assert!(batches.is_empty());
        assert_eq!(stats.success, 0);
        log.truncate().unwrap();
        assert_eq!(log.last_lsn(), 1_000);
    }

    #[test]
    fn test_serialize_and_frame_format() {
        let framed = serialize_and_frame(&put(7, 3, vec![1.0])).unwrap();
        // First 4 bytes = length (BE), next 4 = CRC32 (BE)
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        let stored_crc = u32::from_be_bytes([framed[4], framed[5], framed[6], framed[7]]);
        let payload = &framed[8..];
        assert_eq!(payload.len(), len);
        assert_eq!(crc32fast::hash(payload), stored_crc);
    }
}
