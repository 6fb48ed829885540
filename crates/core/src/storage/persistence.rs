//! Snapshot files for checkpoint and recovery.
//!
//! Two snapshots live next to the WAL: `vectors.snap` holds the index metadata and
//! every live record as of an LSN, `graph.snap` holds the published graph
//! generation and the PQ codebook. Both are bincode payloads followed by a footer
//! `[magic "VCR1"][u32 CRC32 BE]`, written to a temp file and atomically renamed.

use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::GraphIndex;
use crate::index::IndexMetadata;
use crate::quantization::pq::PqCodebook;
use crate::storage::store::StoredRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Magic bytes appended before the CRC32 footer to distinguish checksummed snapshots.
const SNAPSHOT_CRC_MAGIC: &[u8; 4] = b"VCR1";

/// Live records and the metadata they were written under.
#[derive(Debug, Serialize, Deserialize)]
pub struct VectorSnapshot {
    pub metadata: IndexMetadata,
    pub applied_lsn: u64,
    pub records: Vec<StoredRecord>,
}

/// A published graph generation.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub generation: u64,
    /// Store LSN the graph reflects.
    pub lsn: u64,
    pub graph: GraphIndex,
    pub codebook: Option<PqCodebook>,
}

/// Borrowed form of [`GraphSnapshot`] used when writing, so a checkpoint never
/// clones the graph. Serializes to the same bytes.
#[derive(Debug, Serialize)]
pub struct GraphSnapshotRef<'a> {
    pub generation: u64,
    pub lsn: u64,
    pub graph: &'a GraphIndex,
    pub codebook: Option<&'a PqCodebook>,
}

pub fn vector_snapshot_path(dir: &Path) -> PathBuf {
    dir.join(config::VECTOR_SNAPSHOT_FILE_NAME)
}

pub fn graph_snapshot_path(dir: &Path) -> PathBuf {
    dir.join(config::GRAPH_SNAPSHOT_FILE_NAME)
}

/// Serialize `value` to `path` with a CRC32 footer, atomically. Returns the CRC.
fn write_snapshot<T: Serialize>(value: &T, path: &Path) -> Result<u32> {
    let bytes = bincode::serialize(value)?;
    let crc = crc32fast::hash(&bytes);

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }
    }
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    // Write: [bincode payload][magic 4 bytes][CRC32 4 bytes BE]
    let mut output = Vec::with_capacity(bytes.len() + 8);
    output.extend_from_slice(&bytes);
    output.extend_from_slice(SNAPSHOT_CRC_MAGIC);
    output.extend_from_slice(&crc.to_be_bytes());

    fs::write(&tmp_path, &output)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::File::open(&tmp_path)?.sync_all()?;
    fs::rename(&tmp_path, path)?;

    tracing::info!(
        "Saved snapshot {:?} ({} bytes, CRC32={:#010x})",
        path,
        bytes.len(),
        crc
    );
    Ok(crc)
}

/// Read a snapshot, verifying its footer. `Ok(None)` when the file does not exist.
fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if raw.len() < 8 || &raw[raw.len() - 8..raw.len() - 4] != SNAPSHOT_CRC_MAGIC {
        return Err(IndexError::CorruptSnapshot(format!(
            "{:?} has no CRC32 footer",
            path
        )));
    }
    let payload = &raw[..raw.len() - 8];
    let stored_crc = u32::from_be_bytes([
        raw[raw.len() - 4],
        raw[raw.len() - 3],
        raw[raw.len() - 2],
        raw[raw.len() - 1],
    ]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(IndexError::CorruptSnapshot(format!(
            "CRC32 mismatch in {:?}: expected {:#010x}, got {:#010x}",
            path, stored_crc, computed_crc
        )));
    }
    tracing::debug!("Snapshot CRC32 verified: {:#010x}", stored_crc);

    bincode::deserialize(payload)
        .map(Some)
        .map_err(|e| IndexError::CorruptSnapshot(format!("{:?}: {}", path, e)))
}

pub fn save_vector_snapshot(dir: &Path, snapshot: &VectorSnapshot) -> Result<()> {
    write_snapshot(snapshot, &vector_snapshot_path(dir))?;
    Ok(())
}

pub fn load_vector_snapshot(dir: &Path) -> Result<Option<VectorSnapshot>> {
    let snapshot: Option<VectorSnapshot> = read_snapshot(&vector_snapshot_path(dir))?;
    if let Some(s) = &snapshot {
        if let Some(r) = s.records.iter().find(|r| r.version > s.applied_lsn) {
            return Err(IndexError::CorruptSnapshot(format!(
                "record {} has version {} beyond snapshot LSN {}",
                r.id, r.version, s.applied_lsn
            )));
        }
        tracing::info!(
            "Loaded vector snapshot ({} records, LSN {})",
            s.records.len(),
            s.applied_lsn
        );
    }
    Ok(snapshot)
}

pub fn save_graph_snapshot(dir: &Path, snapshot: &GraphSnapshotRef<'_>) -> Result<()> {
    write_snapshot(snapshot, &graph_snapshot_path(dir))?;
    Ok(())
}

/// Load and structurally validate the graph snapshot.
pub fn load_graph_snapshot(dir: &Path) -> Result<Option<GraphSnapshot>> {
    let snapshot: Option<GraphSnapshot> = read_snapshot(&graph_snapshot_path(dir))?;
    if let Some(s) = &snapshot {
        s.graph.validate().map_err(|e| {
            IndexError::CorruptSnapshot(format!("graph snapshot validation failed: {}", e))
        })?;
    }
    Ok(snapshot)
}
