//! Record ids and metadata for a generation
//!
//! The `.rvx` file stores bare vector rows; the catalog sidecar
//! (`catalog.json`) carries the record id and metadata for each row
//! slot, in slot order. The id → slot map is rebuilt on open rather
//! than persisted.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single scalar metadata value.
///
/// Untagged so the JSON form is a plain scalar, matching the snapshot
/// artifact and the query API. `Int` is tried before `Float` so whole
/// numbers round-trip as integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Numeric view, for range filters. Strings and bools have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Per-record metadata: a flat map of scalar fields.
pub type Metadata = BTreeMap<String, FieldValue>;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid catalog: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("catalog has {entries} entries but store has {rows} rows")]
    RowCountMismatch { entries: usize, rows: usize },
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogEntry {
    id: String,
    metadata: Metadata,
}

/// Slot-ordered record ids and metadata for one generation.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    slot_by_id: HashMap<String, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; the slot is the insertion index.
    pub fn push(&mut self, id: String, metadata: Metadata) {
        self.slot_by_id.insert(id.clone(), self.entries.len());
        self.entries.push(CatalogEntry { id, metadata });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn id(&self, slot: usize) -> &str {
        &self.entries[slot].id
    }

    pub fn metadata(&self, slot: usize) -> &Metadata {
        &self.entries[slot].metadata
    }

    pub fn slot_of(&self, id: &str) -> Option<usize> {
        self.slot_by_id.get(id).copied()
    }

    /// Write the sidecar. Durability (fsync + rename) is the caller's
    /// concern; the generation directory is synced as a whole.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CatalogError> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, &self.entries)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let entries: Vec<CatalogEntry> = serde_json::from_reader(reader)?;
        let slot_by_id = entries
            .iter()
            .enumerate()
            .map(|(slot, e)| (e.id.clone(), slot))
            .collect();
        Ok(Self {
            entries,
            slot_by_id,
        })
    }
}
