//! Metadata filter predicate
//!
//! Declarative restriction applied per row during the scan: exact
//! equality on any field plus numeric lower/upper bounds. A field
//! named in the filter but absent from (or non-numeric in) the record
//! fails the predicate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{FieldValue, Metadata};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Fields that must equal the given scalar exactly.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub equals: BTreeMap<String, FieldValue>,

    /// Numeric fields that must be >= the given bound.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gte: BTreeMap<String, f64>,

    /// Numeric fields that must be <= the given bound.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lte: BTreeMap<String, f64>,
}

impl QueryFilter {
    pub fn is_empty(&self) -> bool {
        self.equals.is_empty() && self.gte.is_empty() && self.lte.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        for (field, expected) in &self.equals {
            match metadata.get(field) {
                Some(actual) if values_equal(actual, expected) => {}
                _ => return false,
            }
        }
        for (field, bound) in &self.gte {
            match metadata.get(field).and_then(FieldValue::as_f64) {
                Some(v) if v >= *bound => {}
                _ => return false,
            }
        }
        for (field, bound) in &self.lte {
            match metadata.get(field).and_then(FieldValue::as_f64) {
                Some(v) if v <= *bound => {}
                _ => return false,
            }
        }
        true
    }
}

/// Equality with numeric widening, so `{"start_time": 30}` matches a
/// record that stored `30.0`.
fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
