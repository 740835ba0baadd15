//! Ingestion coordinator
//!
//! Drives a worker process from boot to a queryable index:
//! `EMPTY → INGESTING → READY`, with `FAILED` reachable from
//! `INGESTING`. At most one process ingests a given snapshot version;
//! everyone else waits on the marker and proceeds read-only.
//!
//! The decision procedure on boot:
//!
//! 1. Load and validate the snapshot (its version + checksum identify
//!    the data).
//! 2. If the marker already names that identity, the index is READY;
//!    re-running ingestion is a no-op.
//! 3. Otherwise contend for the ingestion lease with bounded
//!    poll/backoff. Losers re-check the marker every round so they
//!    finish as soon as the holder commits; past the acquire deadline
//!    they fail with `IngestionTimeout` instead of hanging behind a
//!    dead holder.
//! 4. The winner re-checks the marker under the lease (another process
//!    may have committed while it waited), then upserts in bounded
//!    batches, persists, atomically publishes the marker, sweeps
//!    orphaned generations, and releases the lease.
//!
//! Any failure between lease acquisition and marker publication leaves
//! the marker untouched and releases the lease, so the next worker
//! retries from scratch against an uncorrupted index.

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::index::{IndexError, VectorIndex};
use crate::lease;
use crate::marker::IndexState;
use crate::snapshot::{Snapshot, SnapshotError};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("{0}")]
    Snapshot(#[from] SnapshotError),

    #[error("{0}")]
    Index(#[from] IndexError),

    #[error("{0}")]
    Lease(#[from] lease::LeaseError),

    #[error("timed out after {waited:?} waiting for ingestion of snapshot '{version}'")]
    IngestionTimeout { version: String, waited: Duration },
}

/// Tuning for ingestion and lease contention.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Records per upsert batch; bounds memory and flush granularity.
    pub batch_size: usize,
    /// Lease lifetime; a holder dead longer than this is usurped.
    pub lease_ttl: Duration,
    /// Maximum total wait for another process's ingestion.
    pub acquire_timeout: Duration,
    /// Poll interval while waiting on the lease/marker.
    pub poll_interval: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            lease_ttl: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// How this worker reached READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The marker already named the snapshot; nothing to do.
    AlreadyCurrent,
    /// This process performed the ingestion.
    Ingested,
    /// Another process ingested while this one waited.
    WaitedForPeer,
}

/// Bring the shared index at `root` up to date with the snapshot at
/// `snapshot_path`, and return a READY handle on it.
pub fn ensure_ready(
    root: &Path,
    snapshot_path: &Path,
    cfg: &IngestionConfig,
) -> Result<(VectorIndex, IngestOutcome), CoordinatorError> {
    let snapshot = crate::snapshot::load(snapshot_path)?;
    let mut index = VectorIndex::open(root)?;

    if is_current(&index, &snapshot) {
        tracing::info!(
            version = %snapshot.version,
            records = snapshot.records.len(),
            "index already current, skipping ingestion"
        );
        return Ok((index, IngestOutcome::AlreadyCurrent));
    }

    let started = Instant::now();
    loop {
        if let Some(lease) = lease::try_acquire(root, cfg.lease_ttl)? {
            // A peer may have committed while we were polling.
            index.reload()?;
            if is_current(&index, &snapshot) {
                lease.release()?;
                return Ok((index, IngestOutcome::WaitedForPeer));
            }

            return match ingest(&mut index, &snapshot, cfg) {
                Ok(()) => {
                    lease.release()?;
                    Ok((index, IngestOutcome::Ingested))
                }
                Err(e) => {
                    // FAILED: marker untouched, lease released on drop,
                    // index left in its prior state for a clean retry.
                    drop(lease);
                    tracing::error!(version = %snapshot.version, "ingestion failed: {e}");
                    Err(e)
                }
            };
        }

        index.reload()?;
        if is_current(&index, &snapshot) {
            return Ok((index, IngestOutcome::WaitedForPeer));
        }

        let waited = started.elapsed();
        if waited >= cfg.acquire_timeout {
            return Err(CoordinatorError::IngestionTimeout {
                version: snapshot.version.clone(),
                waited,
            });
        }
        std::thread::sleep(cfg.poll_interval);
    }
}

fn is_current(index: &VectorIndex, snapshot: &Snapshot) -> bool {
    match IndexState::read(index.root()) {
        Ok(Some(state)) => {
            state.matches(&snapshot.version, &snapshot.checksum) && index.current().is_some()
        }
        _ => false,
    }
}

/// The INGESTING leg: batch upserts, persist, publish the marker.
/// The marker write is the only step that makes the work visible.
fn ingest(
    index: &mut VectorIndex,
    snapshot: &Snapshot,
    cfg: &IngestionConfig,
) -> Result<(), CoordinatorError> {
    tracing::info!(
        version = %snapshot.version,
        records = snapshot.records.len(),
        dim = snapshot.dim,
        "ingesting snapshot"
    );

    index.ensure_dim(snapshot.dim)?;
    for batch in snapshot.records.chunks(cfg.batch_size.max(1)) {
        index.upsert(batch)?;
    }

    let state = index.persist(&snapshot.version, &snapshot.checksum)?;
    state.write(index.root()).map_err(IndexError::from)?;

    if let Err(e) = index.sweep_orphan_generations(&state) {
        tracing::warn!("orphan generation sweep failed: {e}");
    }

    tracing::info!(
        version = %state.version,
        generation = %state.generation,
        count = state.count,
        "ingestion committed"
    );
    Ok(())
}
