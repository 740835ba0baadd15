//! Index state marker
//!
//! `current.json` at the index root records which snapshot version has
//! been fully ingested and which generation directory holds it. The
//! marker is the single commit point of ingestion: it is written only
//! after the generation is durable, via temp-file + rename + fsync of
//! both the file and the directory, so a crash mid-ingestion leaves it
//! absent or pointing at the prior generation, never corrupt.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MARKER_FILE: &str = "current.json";

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid marker file: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// The persisted record of a completed ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexState {
    /// Snapshot version string the generation was built from.
    pub version: String,
    /// SHA-256 of the snapshot artifact.
    pub checksum: String,
    /// Generation directory name under the index root.
    pub generation: String,
    pub count: usize,
    pub dim: usize,
    pub created_at: i64,
}

impl IndexState {
    /// True if this marker describes the given snapshot identity.
    ///
    /// Both version and checksum must match: a republished artifact
    /// under an old version string is treated as new data.
    pub fn matches(&self, version: &str, checksum: &str) -> bool {
        self.version == version && self.checksum == checksum
    }

    /// Read the marker at `root`, if one exists.
    pub fn read(root: &Path) -> Result<Option<Self>, MarkerError> {
        let path = root.join(MARKER_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Atomically publish this marker at `root`.
    pub fn write(&self, root: &Path) -> Result<(), MarkerError> {
        let tmp = root.join(format!("{MARKER_FILE}.tmp"));
        let dst = root.join(MARKER_FILE);

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json.as_bytes())?;
        sync_file(&tmp)?;
        std::fs::rename(&tmp, &dst)?;
        sync_dir(root)?;
        Ok(())
    }

    pub fn generation_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.generation)
    }
}

pub(crate) fn sync_file(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    Ok(())
}

pub(crate) fn now_unix_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
