//! reeldb: a persistent vector search service for transcript embeddings
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │               POST /api/query, GET /api/health              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ reads
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            VectorIndex (immutable generations)              │
//! │        flat cosine scan over mmap'd .rvx + catalog          │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲ writes (one process at a time)
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Ingestion Coordinator (lease + marker)             │
//! │        Snapshot artifact → batched upsert → commit          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! N worker processes share one index directory. Each asks the
//! coordinator for a READY index on boot; exactly one ingests the
//! snapshot while the rest wait on the marker, then all serve
//! read-only from the committed generation.

pub mod catalog;
pub mod coordinator;
pub mod filter;
pub mod index;
pub mod lease;
pub mod marker;
pub mod server;
pub mod similarity;
pub mod snapshot;
pub mod store;

pub use coordinator::{ensure_ready, IngestOutcome, IngestionConfig};
pub use index::{Neighbor, VectorIndex};
pub use marker::IndexState;
pub use snapshot::{EmbeddingRecord, Snapshot};
pub use store::VectorStore;
