//! Generation-based persistent vector index
//!
//! Every ingested snapshot becomes an immutable generation directory
//! under the index root:
//!
//! ```text
//! <index_root>/
//!   current.json            index state marker (commit point)
//!   ingest.lock             ingestion lease (transient)
//!   gen-<checksum16>/
//!     vectors.rvx           packed f32 rows
//!     catalog.json          ids + metadata per row slot
//! ```
//!
//! Readers serve from the generation named by the marker and keep it
//! mapped for their lifetime; a newer ingestion writes a different
//! directory and swaps the marker, so an in-flight upgrade is never
//! visible to them. Queries are exact: a flat cosine scan over all
//! rows, ranked by descending score with ascending-id tie breaks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{Catalog, CatalogError, Metadata};
use crate::filter::QueryFilter;
use crate::marker::{self, IndexState, MarkerError};
use crate::similarity;
use crate::snapshot::EmbeddingRecord;
use crate::store::{RvxWriter, StoreError, VectorStore};

const VECTORS_FILE: &str = "vectors.rvx";
const CATALOG_FILE: &str = "catalog.json";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index not ready: no ingested generation")]
    NotReady,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("nothing staged to persist")]
    NothingStaged,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("marker error: {0}")]
    Marker(#[from] MarkerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One ranked query hit.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: String,
    pub score: f32,
    pub metadata: Metadata,
}

/// An immutable, opened generation: mapped vectors plus their catalog.
pub struct Generation {
    pub name: String,
    store: VectorStore,
    catalog: Catalog,
}

impl Generation {
    /// Open the generation directory `name` under `root`.
    pub fn open(root: &Path, name: &str) -> Result<Self, IndexError> {
        let dir = root.join(name);
        let store = VectorStore::open(dir.join(VECTORS_FILE))?;
        let catalog = Catalog::load(dir.join(CATALOG_FILE))?;
        if catalog.len() != store.count() {
            return Err(CatalogError::RowCountMismatch {
                entries: catalog.len(),
                rows: store.count(),
            }
            .into());
        }
        Ok(Self {
            name: name.to_string(),
            store,
            catalog,
        })
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    pub fn dim(&self) -> usize {
        self.store.dim()
    }

    /// Exact top-k cosine scan. Ordering is deterministic: descending
    /// score, then ascending id.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.store.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: self.store.dim(),
                actual: query.len(),
            });
        }

        let query_norm = similarity::norm(query);
        let mut hits: Vec<(f32, usize)> = Vec::new();
        for slot in 0..self.store.count() {
            if let Some(f) = filter {
                if !f.is_empty() && !f.matches(self.catalog.metadata(slot)) {
                    continue;
                }
            }
            let row = self.store.row(slot)?;
            let score = similarity::cosine_with_norm(query, query_norm, row, self.store.norm(slot));
            hits.push((score, slot));
        }

        hits.sort_unstable_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| self.catalog.id(a.1).cmp(self.catalog.id(b.1)))
        });
        hits.truncate(top_k);

        Ok(hits
            .into_iter()
            .map(|(score, slot)| Neighbor {
                id: self.catalog.id(slot).to_string(),
                score,
                metadata: self.catalog.metadata(slot).clone(),
            })
            .collect())
    }
}

/// Staged upserts awaiting `persist`. Replacement by id keeps the
/// first-seen slot so ingestion order stays deterministic.
#[derive(Default)]
struct Staging {
    dim: Option<usize>,
    records: Vec<EmbeddingRecord>,
    slot_by_id: HashMap<String, usize>,
}

impl Staging {
    fn upsert(&mut self, record: &EmbeddingRecord) -> Result<(), IndexError> {
        let dim = *self.dim.get_or_insert(record.vector.len());
        if record.vector.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: record.vector.len(),
            });
        }
        match self.slot_by_id.get(&record.id) {
            Some(&slot) => self.records[slot] = record.clone(),
            None => {
                self.slot_by_id.insert(record.id.clone(), self.records.len());
                self.records.push(record.clone());
            }
        }
        Ok(())
    }
}

/// Handle on the on-disk index: the current generation (if any) plus
/// staged mutations. All mutation of the on-disk representation goes
/// through this type; cross-process exclusion is the coordinator's
/// job.
pub struct VectorIndex {
    root: PathBuf,
    staged: Staging,
    current: Option<Arc<Generation>>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("root", &self.root)
            .field(
                "current",
                &self.current.as_ref().map(|gen| gen.name.as_str()),
            )
            .finish()
    }
}

impl VectorIndex {
    /// Attach to `root`, creating the directory if needed, and open
    /// the generation the marker names (if any).
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, IndexError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut index = Self {
            root,
            staged: Staging::default(),
            current: None,
        };
        index.reload()?;
        Ok(index)
    }

    /// Re-read the marker and open the generation it names. Used by
    /// workers that waited out another process's ingestion.
    pub fn reload(&mut self) -> Result<Option<IndexState>, IndexError> {
        let state = IndexState::read(&self.root)?;
        if let Some(ref state) = state {
            let stale = self
                .current
                .as_ref()
                .map(|gen| gen.name != state.generation)
                .unwrap_or(true);
            if stale {
                self.current = Some(Arc::new(Generation::open(&self.root, &state.generation)?));
            }
        }
        Ok(state)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The generation currently being served, if ingestion completed.
    pub fn current(&self) -> Option<Arc<Generation>> {
        self.current.clone()
    }

    /// Establish the staged dimension up front. Lets an empty snapshot
    /// persist a zero-row generation with a well-defined dimension.
    pub fn ensure_dim(&mut self, dim: usize) -> Result<(), IndexError> {
        let established = *self.staged.dim.get_or_insert(dim);
        if established != dim {
            return Err(IndexError::DimensionMismatch {
                expected: established,
                actual: dim,
            });
        }
        Ok(())
    }

    /// Stage insert-or-replace of a batch of records. The first staged
    /// record establishes the dimension; later mismatches fail.
    pub fn upsert(&mut self, records: &[EmbeddingRecord]) -> Result<(), IndexError> {
        for record in records {
            self.staged.upsert(record)?;
        }
        Ok(())
    }

    /// Durably flush staged records as a new generation and make it
    /// this handle's current one. Returns the [`IndexState`] describing
    /// it; publishing that marker is the caller's (coordinator's)
    /// responsibility. Until the marker is written, other processes
    /// still see the previous generation.
    pub fn persist(&mut self, version: &str, checksum: &str) -> Result<IndexState, IndexError> {
        let dim = match self.staged.dim {
            Some(dim) => dim,
            None => return Err(IndexError::NothingStaged),
        };

        let generation = format!("gen-{}", &checksum[..checksum.len().min(16)]);
        let dir = self.root.join(&generation);
        std::fs::create_dir_all(&dir)?;

        let mut writer = RvxWriter::create(dir.join(VECTORS_FILE), dim)?;
        let mut catalog = Catalog::new();
        for record in &self.staged.records {
            writer.write_row(&record.vector)?;
            catalog.push(record.id.clone(), record.metadata.clone());
        }
        let count = writer.finish()? as usize;
        catalog.save(dir.join(CATALOG_FILE))?;
        marker::sync_file(&dir.join(CATALOG_FILE))?;
        marker::sync_dir(&dir)?;
        marker::sync_dir(&self.root)?;

        let state = IndexState {
            version: version.to_string(),
            checksum: checksum.to_string(),
            generation: generation.clone(),
            count,
            dim,
            created_at: marker::now_unix_ts(),
        };

        self.current = Some(Arc::new(Generation::open(&self.root, &generation)?));
        self.staged = Staging::default();
        Ok(state)
    }

    /// Query the current generation.
    pub fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<Neighbor>, IndexError> {
        match &self.current {
            Some(gen) => gen.search(vector, top_k, filter),
            None => Err(IndexError::NotReady),
        }
    }

    /// Remove generation directories no longer referenced by the
    /// marker: debris of crashed ingestions or superseded upgrades.
    /// Best effort: a failure to delete is logged, not fatal.
    pub fn sweep_orphan_generations(&self, keep: &IndexState) -> Result<usize, IndexError> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("gen-") || name == keep.generation {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!(generation = %name, "removed orphan generation");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(generation = %name, "failed to remove orphan generation: {e}");
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldValue;
    use tempfile::tempdir;

    fn record(id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: id.into(),
            vector,
            metadata: Metadata::new(),
        }
    }

    fn record_with_meta(id: &str, vector: Vec<f32>, video: &str) -> EmbeddingRecord {
        let mut metadata = Metadata::new();
        metadata.insert("video_id".into(), FieldValue::Str(video.into()));
        EmbeddingRecord {
            id: id.into(),
            vector,
            metadata,
        }
    }

    #[test]
    fn query_before_persist_is_not_ready() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path()).unwrap();
        assert!(matches!(
            index.query(&[1.0, 0.0], 3, None),
            Err(IndexError::NotReady)
        ));
    }

    #[test]
    fn persist_then_query() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index
            .upsert(&[
                record("a", vec![1.0, 0.0]),
                record("b", vec![0.0, 1.0]),
                record("c", vec![0.9, 0.1]),
            ])
            .unwrap();
        let state = index.persist("v1", "deadbeefdeadbeefdeadbeef").unwrap();
        assert_eq!(state.count, 3);
        assert_eq!(state.dim, 2);

        // Example scenario: [1,0] with top_k=2 ranks A then C.
        let hits = index.query(&[1.0, 0.0], 2, None).unwrap();
        let ids: Vec<_> = hits.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index.upsert(&[record("a", vec![1.0, 0.0])]).unwrap();
        index.upsert(&[record("a", vec![0.0, 1.0])]).unwrap();
        let state = index.persist("v1", "cafebabecafebabe").unwrap();
        assert_eq!(state.count, 1);

        let hits = index.query(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn upsert_rejects_dimension_drift() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index.upsert(&[record("a", vec![1.0, 0.0])]).unwrap();
        let err = index.upsert(&[record("b", vec![1.0])]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch { expected: 2, actual: 1 }
        ));
    }

    #[test]
    fn query_rejects_wrong_dimension() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index.upsert(&[record("a", vec![1.0, 0.0])]).unwrap();
        index.persist("v1", "0123456789abcdef").unwrap();
        assert!(matches!(
            index.query(&[1.0, 0.0, 0.0], 1, None),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        // Same direction, different magnitude: identical cosine score.
        index
            .upsert(&[
                record("z", vec![2.0, 0.0]),
                record("a", vec![1.0, 0.0]),
                record("m", vec![4.0, 0.0]),
            ])
            .unwrap();
        index.persist("v1", "feedfacefeedface").unwrap();

        let hits = index.query(&[1.0, 0.0], 3, None).unwrap();
        let ids: Vec<_> = hits.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "m", "z"]);
    }

    #[test]
    fn repeated_queries_are_identical() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index
            .upsert(&[
                record("a", vec![0.3, 0.7]),
                record("b", vec![0.7, 0.3]),
                record("c", vec![0.5, 0.5]),
            ])
            .unwrap();
        index.persist("v1", "abcdefabcdefabcd").unwrap();

        let first = index.query(&[0.6, 0.4], 3, None).unwrap();
        for _ in 0..5 {
            let again = index.query(&[0.6, 0.4], 3, None).unwrap();
            let a: Vec<_> = first.iter().map(|n| (&n.id, n.score)).collect();
            let b: Vec<_> = again.iter().map(|n| (&n.id, n.score)).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn filter_restricts_scan() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index
            .upsert(&[
                record_with_meta("a", vec![1.0, 0.0], "vid-1"),
                record_with_meta("b", vec![0.99, 0.01], "vid-2"),
            ])
            .unwrap();
        index.persist("v1", "0011223344556677").unwrap();

        let mut filter = QueryFilter::default();
        filter
            .equals
            .insert("video_id".into(), FieldValue::Str("vid-2".into()));
        let hits = index.query(&[1.0, 0.0], 5, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn top_k_larger_than_index_returns_all() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index.upsert(&[record("a", vec![1.0, 0.0])]).unwrap();
        index.persist("v1", "8899aabbccddeeff").unwrap();
        assert_eq!(index.query(&[1.0, 0.0], 10, None).unwrap().len(), 1);
    }

    #[test]
    fn persisted_generation_survives_reopen_after_marker() {
        let dir = tempdir().unwrap();
        let state = {
            let mut index = VectorIndex::open(dir.path()).unwrap();
            index.upsert(&[record("a", vec![1.0, 0.0])]).unwrap();
            index.persist("v1", "1122334455667788").unwrap()
        };

        // Without the marker a fresh open sees nothing (commit point
        // not reached).
        let index = VectorIndex::open(dir.path()).unwrap();
        assert!(index.current().is_none());

        state.write(dir.path()).unwrap();
        let index = VectorIndex::open(dir.path()).unwrap();
        let gen = index.current().unwrap();
        assert_eq!(gen.count(), 1);
    }

    #[test]
    fn sweep_removes_unreferenced_generations() {
        let dir = tempdir().unwrap();
        let mut index = VectorIndex::open(dir.path()).unwrap();
        index.upsert(&[record("a", vec![1.0, 0.0])]).unwrap();
        let old = index.persist("v1", "aaaa111122223333").unwrap();

        index.upsert(&[record("a", vec![0.0, 1.0])]).unwrap();
        let new = index.persist("v2", "bbbb444455556666").unwrap();
        new.write(dir.path()).unwrap();

        let removed = index.sweep_orphan_generations(&new).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join(&old.generation).exists());
        assert!(dir.path().join(&new.generation).exists());
    }
}
