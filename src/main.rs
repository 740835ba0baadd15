//! reeldb CLI
//!
//! A persistent, disk-backed vector search service for precomputed
//! transcript embeddings.
//!
//! # Usage
//!
//! ```bash
//! # Serve queries, ingesting the snapshot on first boot
//! reeldb serve --index-dir ./data/index --snapshot ./embeddings.json --port 8080
//!
//! # Build the index offline without serving
//! reeldb ingest --index-dir ./data/index --snapshot ./embeddings.json
//!
//! # Inspect an index directory
//! reeldb stats --index-dir ./data/index
//!
//! # Ad-hoc query against a running server
//! reeldb query --server http://localhost:8080 --vector 0.1,0.9 -k 5
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use reeldb::server::{serve, AppState, EmbedClient, QueryResponse};
use reeldb::{ensure_ready, IngestOutcome, IngestionConfig, IndexState, VectorIndex};

#[derive(Parser)]
#[command(name = "reeldb")]
#[command(about = "A persistent vector search service for transcript embeddings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct IngestionArgs {
    /// Shared index directory (may be on a mounted volume)
    #[arg(long, env = "REELDB_INDEX_DIR")]
    index_dir: PathBuf,

    /// Path to the snapshot artifact to ingest
    #[arg(long, env = "REELDB_SNAPSHOT")]
    snapshot: PathBuf,

    /// Records per upsert batch
    #[arg(long, env = "REELDB_BATCH_SIZE", default_value = "500")]
    batch_size: usize,

    /// Ingestion lease lifetime in seconds
    #[arg(long, env = "REELDB_LEASE_TTL_SECS", default_value = "120")]
    lease_ttl_secs: u64,

    /// Maximum seconds to wait for a sibling worker's ingestion
    #[arg(long, env = "REELDB_ACQUIRE_TIMEOUT_SECS", default_value = "60")]
    acquire_timeout_secs: u64,
}

impl IngestionArgs {
    fn config(&self) -> IngestionConfig {
        IngestionConfig {
            batch_size: self.batch_size,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            ..IngestionConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start an HTTP worker: coordinate ingestion, then serve queries
    Serve {
        #[command(flatten)]
        ingestion: IngestionArgs,

        /// Host to bind to
        #[arg(long, env = "REELDB_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(short, long, env = "REELDB_PORT", default_value = "8080")]
        port: u16,

        /// External embedder endpoint for text queries (optional)
        #[arg(long, env = "REELDB_EMBEDDER_URL")]
        embedder_url: Option<String>,
    },

    /// Ingest a snapshot into the index without serving
    Ingest {
        #[command(flatten)]
        ingestion: IngestionArgs,
    },

    /// Display statistics for an index directory
    Stats {
        #[arg(long, env = "REELDB_INDEX_DIR")]
        index_dir: PathBuf,
    },

    /// Query a running server
    Query {
        /// Server URL
        #[arg(long, default_value = "http://localhost:8080")]
        server: String,

        /// Query vector (comma separated floats)
        #[arg(long, conflicts_with = "text")]
        vector: Option<String>,

        /// Query text (requires the server to have an embedder)
        #[arg(long)]
        text: Option<String>,

        /// Number of results
        #[arg(short = 'k', long, default_value = "10")]
        k: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            ingestion,
            host,
            port,
            embedder_url,
        } => {
            let state = Arc::new(AppState::starting(embedder_url.map(EmbedClient::new)));

            // Coordinate in the background so the listener is up (and
            // answering 503) while ingestion or waiting is in flight.
            let coordinator_state = state.clone();
            let cfg = ingestion.config();
            let root = ingestion.index_dir.clone();
            let snapshot = ingestion.snapshot.clone();
            tokio::task::spawn_blocking(move || {
                match ensure_ready(&root, &snapshot, &cfg) {
                    Ok((index, outcome)) => {
                        let marker = IndexState::read(index.root()).ok().flatten();
                        match (index.current(), marker) {
                            (Some(generation), Some(marker)) => {
                                tracing::info!(
                                    version = %marker.version,
                                    vectors = generation.count(),
                                    ?outcome,
                                    "worker ready"
                                );
                                coordinator_state.set_ready(generation, marker, "ready");
                            }
                            _ => {
                                coordinator_state
                                    .set_report("startup finished without a generation");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("startup ingestion failed: {e}");
                        coordinator_state.set_report(format!("startup failed: {e}"));
                    }
                }
            });

            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .context("parsing listen address")?;
            serve(state, addr).await?;
        }

        Commands::Ingest { ingestion } => {
            let cfg = ingestion.config();
            let (index, outcome) = ensure_ready(&ingestion.index_dir, &ingestion.snapshot, &cfg)?;
            let generation = index
                .current()
                .context("ingestion finished without a generation")?;
            match outcome {
                IngestOutcome::Ingested => {
                    println!("ingested {} vectors (dim {})", generation.count(), generation.dim());
                }
                IngestOutcome::AlreadyCurrent | IngestOutcome::WaitedForPeer => {
                    println!(
                        "index already current: {} vectors (dim {})",
                        generation.count(),
                        generation.dim()
                    );
                }
            }
        }

        Commands::Stats { index_dir } => {
            let marker = IndexState::read(&index_dir)?;
            match marker {
                Some(state) => {
                    println!("Index: {:?}", index_dir);
                    println!("  Version: {}", state.version);
                    println!("  Checksum: {}", state.checksum);
                    println!("  Generation: {}", state.generation);
                    println!("  Vectors: {}", state.count);
                    println!("  Dimensions: {}", state.dim);
                    println!("  Ingested at: {}", state.created_at);

                    let index = VectorIndex::open(&index_dir)?;
                    if let Some(generation) = index.current() {
                        println!("  Generation opens cleanly: {} rows", generation.count());
                    }
                }
                None => {
                    println!("Index: {:?}", index_dir);
                    println!("  No completed ingestion (marker absent)");
                }
            }
        }

        Commands::Query {
            server,
            vector,
            text,
            k,
        } => {
            let client = reqwest::Client::new();
            let url = format!("{}/api/query", server.trim_end_matches('/'));

            let mut body = serde_json::json!({ "top_k": k });
            if let Some(vector) = vector {
                let vector = parse_vector(&vector).map_err(|e| anyhow::anyhow!(e))?;
                body["vector"] = serde_json::json!(vector);
            } else if let Some(text) = text {
                body["text"] = serde_json::json!(text);
            } else {
                anyhow::bail!("either --vector or --text is required");
            }

            let response = client.post(&url).json(&body).send().await?;
            if !response.status().is_success() {
                let error: serde_json::Value = response.json().await?;
                eprintln!("Error: {}", error);
                std::process::exit(1);
            }

            let result: QueryResponse = response.json().await?;
            println!("Query time: {:.2}ms", result.query_time_ms);
            println!("Results:");
            for hit in result.results {
                match hit.timestamp {
                    Some(ts) => println!("  {} (score {:.4}) [{}]", hit.id, hit.score, ts),
                    None => println!("  {} (score {:.4})", hit.id, hit.score),
                }
            }
        }
    }

    Ok(())
}

fn parse_vector(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect()
}
