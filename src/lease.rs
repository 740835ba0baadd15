//! Cross-process ingestion lease
//!
//! Workers are separate OS processes sharing one index directory, so
//! mutual exclusion has to live on the filesystem. The lease is a
//! single `ingest.lock` file created with `create_new` (O_EXCL):
//! exactly one contender wins creation. The file carries the owner's
//! token and an expiry timestamp; a lease whose expiry has passed
//! belongs to a crashed holder and may be taken over.
//!
//! Takeover is done by renaming the stale file to a unique side name
//! before retrying creation. Rename is atomic, so when several waiters
//! notice the same stale lease, exactly one wins the rename; the rest
//! go back to polling. Plain unlink-then-create would let a slow
//! waiter delete the fresh lease of whoever re-created it first.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::marker::now_unix_ts;

const LOCK_FILE: &str = "ingest.lock";

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("io error on lease file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    pid: u32,
    acquired_at: i64,
    expires_at: i64,
}

/// An exclusive claim on the index directory's ingestion right.
///
/// Released explicitly by [`IngestLease::release`] or best-effort on
/// drop; either way a crashed holder is covered by the TTL.
#[derive(Debug)]
pub struct IngestLease {
    path: PathBuf,
    owner: String,
    released: bool,
}

/// Attempt to take the lease once. Returns `None` when another live
/// holder has it.
pub fn try_acquire(root: &Path, ttl: Duration) -> Result<Option<IngestLease>, LeaseError> {
    let path = root.join(LOCK_FILE);
    let owner = mint_owner_token();

    loop {
        let now = now_unix_ts();
        let record = LeaseRecord {
            owner: owner.clone(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl.as_secs() as i64,
        };

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                serde_json::to_writer(&file, &record).map_err(io::Error::from)?;
                file.sync_all()?;
                tracing::debug!(owner = %owner, "acquired ingestion lease");
                return Ok(Some(IngestLease {
                    path,
                    owner,
                    released: false,
                }));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !holder_expired(&path, now) {
                    return Ok(None);
                }
                // Stale holder: claim the corpse via atomic rename, then
                // retry creation. Losing the rename race just means
                // someone else is doing the cleanup.
                let side = root.join(format!("{LOCK_FILE}.stale-{owner}"));
                match std::fs::rename(&path, &side) {
                    Ok(()) => {
                        let _ = std::fs::remove_file(&side);
                        tracing::warn!("took over an expired ingestion lease");
                        continue;
                    }
                    Err(_) => return Ok(None),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// True when the lease file exists but its expiry has passed. An
/// unreadable or unparsable lease is treated as expired: the holder
/// cannot have written it properly, and the rename race still ensures
/// a single winner.
fn holder_expired(path: &Path, now: i64) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<LeaseRecord>(&bytes) {
            Ok(record) => record.expires_at <= now,
            Err(_) => true,
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(_) => true,
    }
}

impl IngestLease {
    /// Release the lease. Removes the lock file only while it still
    /// carries this owner's token, so a TTL takeover that already
    /// happened is not clobbered.
    pub fn release(mut self) -> Result<(), LeaseError> {
        self.release_inner()?;
        self.released = true;
        Ok(())
    }

    fn release_inner(&self) -> Result<(), LeaseError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                if let Ok(record) = serde_json::from_slice::<LeaseRecord>(&bytes) {
                    if record.owner != self.owner {
                        return Ok(());
                    }
                }
                std::fs::remove_file(&self.path)?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for IngestLease {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release_inner() {
                tracing::warn!("failed to release ingestion lease on drop: {e}");
            }
            self.released = true;
        }
    }
}

fn mint_owner_token() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut suffix = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        suffix.push_str(&format!("{:02x}", b));
    }
    format!("{}-{}", std::process::id(), suffix)
}
