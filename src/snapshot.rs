//! Snapshot artifact loader
//!
//! A snapshot is a versioned JSON document of precomputed embedding
//! records:
//!
//! ```json
//! {
//!   "version": "2024-06-01",
//!   "dim": 384,
//!   "records": [
//!     {"id": "chunk-0001", "vector": [0.1, ...], "metadata": {"video_id": "abc"}}
//!   ]
//! }
//! ```
//!
//! Loading is deterministic and side-effect free: the same artifact
//! always yields the same `Snapshot`, and the loader never touches the
//! index. Every structural problem is a `Malformed` error so ingestion
//! can refuse the artifact outright instead of committing part of it.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::catalog::Metadata;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("io error reading snapshot: {0}")]
    Io(#[from] io::Error),
}

/// One precomputed embedding with its identifier and metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    version: String,
    dim: usize,
    records: Vec<EmbeddingRecord>,
}

/// A validated, in-memory snapshot ready for ingestion.
#[derive(Debug)]
pub struct Snapshot {
    /// Explicit artifact version, as declared by the producer.
    pub version: String,
    /// SHA-256 of the artifact bytes, hex-encoded.
    pub checksum: String,
    pub dim: usize,
    pub records: Vec<EmbeddingRecord>,
}

/// Read and validate a snapshot artifact.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Snapshot, SnapshotError> {
    let bytes = std::fs::read(&path)?;
    let checksum = sha256_hex(&bytes);

    let file: SnapshotFile = serde_json::from_slice(&bytes)
        .map_err(|e| SnapshotError::Malformed(format!("invalid JSON: {e}")))?;

    if file.version.trim().is_empty() {
        return Err(SnapshotError::Malformed("empty version string".into()));
    }
    if file.dim == 0 {
        return Err(SnapshotError::Malformed("declared dim is zero".into()));
    }

    let mut seen = HashSet::with_capacity(file.records.len());
    for (idx, record) in file.records.iter().enumerate() {
        if record.id.is_empty() {
            return Err(SnapshotError::Malformed(format!("record {idx} has an empty id")));
        }
        if !seen.insert(record.id.as_str()) {
            return Err(SnapshotError::Malformed(format!(
                "duplicate record id '{}'",
                record.id
            )));
        }
        if record.vector.len() != file.dim {
            return Err(SnapshotError::Malformed(format!(
                "record '{}' has dimension {}, snapshot declares {}",
                record.id,
                record.vector.len(),
                file.dim
            )));
        }
        if record.vector.iter().any(|v| !v.is_finite()) {
            return Err(SnapshotError::Malformed(format!(
                "record '{}' contains a non-finite component",
                record.id
            )));
        }
    }

    Ok(Snapshot {
        version: file.version,
        checksum,
        dim: file.dim,
        records: file.records,
    })
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
