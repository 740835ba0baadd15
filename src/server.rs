//! HTTP server
//!
//! Exposes the query service over HTTP using axum.
//!
//! # Endpoints
//!
//! - `POST /api/query` - Nearest-neighbor query by vector or text
//! - `GET /api/health` - Readiness and index statistics
//!
//! Workers come up listening immediately and answer 503 until the
//! ingestion coordinator publishes a READY generation; the supervisor
//! (and load balancer) treat that as "retry later". Queries are pure
//! reads against the generation swapped in at readiness and never
//! contend with a sibling process's ingestion lease.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::catalog::{FieldValue, Metadata};
use crate::filter::QueryFilter;
use crate::index::{Generation, IndexError};
use crate::marker::IndexState;

/// Shared application state.
///
/// The ready generation is swapped in once by the coordinator task and
/// read lock-free by every request; the report string tracks startup
/// progress for `/api/health`.
pub struct AppState {
    pub current: ArcSwapOption<Generation>,
    pub state: ArcSwapOption<IndexState>,
    pub report: RwLock<String>,
    pub embedder: Option<EmbedClient>,
}

impl AppState {
    pub fn starting(embedder: Option<EmbedClient>) -> Self {
        Self {
            current: ArcSwapOption::from(None),
            state: ArcSwapOption::from(None),
            report: RwLock::new("starting".to_string()),
            embedder,
        }
    }

    /// Publish a READY generation to the request path.
    pub fn set_ready(
        &self,
        generation: Arc<Generation>,
        state: IndexState,
        report: impl Into<String>,
    ) {
        self.state.store(Some(Arc::new(state)));
        self.current.store(Some(generation));
        *self.report.write() = report.into();
    }

    pub fn set_report(&self, report: impl Into<String>) {
        *self.report.write() = report.into();
    }
}

/// Client for the external embedding service: turns query text into a
/// vector. POSTs `{"text": ...}`, expects `{"vector": [...]}`.
pub struct EmbedClient {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

impl EmbedClient {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, reqwest::Error> {
        let resp = self
            .client
            .post(&self.url)
            .json(&EmbedRequest { text })
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<EmbedResponse>().await?.vector)
    }
}

/// Query request body. `n_results` is accepted as an alias of `top_k`
/// for compatibility with older clients.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub vector: Option<Vec<f32>>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default = "default_top_k", alias = "n_results")]
    pub top_k: usize,

    #[serde(default)]
    pub filter: Option<QueryFilter>,
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: String,
    pub score: f32,
    pub metadata: Metadata,
    /// Rendered `HH:MM:SS - HH:MM:SS` range when the metadata carries
    /// `start_time`/`end_time` seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<QueryHit>,
    pub query_time_ms: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub ready: bool,
    pub vectors: usize,
    pub dim: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub report: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// POST /api/query
async fn query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Response {
    let request_id = request_id(&headers);
    let started = Instant::now();

    let Some(generation) = state.current.load_full() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &request_id,
            "index_not_ready",
            format!("index not ready: {}", state.report.read()),
        );
    };

    if request.top_k == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            &request_id,
            "bad_request",
            "top_k must be > 0".to_string(),
        );
    }

    let vector = match (request.vector, request.text) {
        (Some(vector), _) => vector,
        (None, Some(text)) => match &state.embedder {
            Some(embedder) => match embedder.embed(&text).await {
                Ok(vector) => vector,
                Err(e) => {
                    tracing::warn!("embedder call failed: {e}");
                    return error_response(
                        StatusCode::BAD_GATEWAY,
                        &request_id,
                        "embedder_unavailable",
                        "external embedder request failed".to_string(),
                    );
                }
            },
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &request_id,
                    "bad_request",
                    "text queries require a configured embedder".to_string(),
                )
            }
        },
        (None, None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &request_id,
                "bad_request",
                "either 'vector' or 'text' is required".to_string(),
            )
        }
    };

    let top_k = request.top_k;
    let filter = request.filter;
    let gen = generation.clone();
    let result = tokio::task::spawn_blocking(move || gen.search(&vector, top_k, filter.as_ref()))
        .await
        .unwrap_or_else(|e| {
            Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("query join error: {e}"),
            )))
        });

    match result {
        Ok(neighbors) => {
            let response = QueryResponse {
                results: neighbors
                    .into_iter()
                    .map(|n| {
                        let timestamp = render_timestamp(&n.metadata);
                        QueryHit {
                            id: n.id,
                            score: n.score,
                            metadata: n.metadata,
                            timestamp,
                        }
                    })
                    .collect(),
                query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            };
            json_response(StatusCode::OK, &request_id, &response)
        }
        Err(e) => {
            let (status, code) = classify_query_error(&e);
            error_response(status, &request_id, code, e.to_string())
        }
    }
}

/// GET /api/health
async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let generation = state.current.load_full();
    let marker = state.state.load_full();
    let ready = generation.is_some();

    let response = HealthResponse {
        status: if ready { "ok" } else { "starting" }.to_string(),
        ready,
        vectors: generation.as_ref().map(|g| g.count()).unwrap_or(0),
        dim: generation.as_ref().map(|g| g.dim()).unwrap_or(0),
        version: marker.map(|m| m.version.clone()),
        report: state.report.read().clone(),
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &request_id, &response)
}

fn classify_query_error(err: &IndexError) -> (StatusCode, &'static str) {
    match err {
        IndexError::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "index_not_ready"),
        IndexError::DimensionMismatch { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
    }
}

/// `HH:MM:SS - HH:MM:SS` from `start_time`/`end_time` seconds, when
/// both are present and numeric.
fn render_timestamp(metadata: &Metadata) -> Option<String> {
    let start = metadata.get("start_time").and_then(FieldValue::as_f64)?;
    let end = metadata.get("end_time").and_then(FieldValue::as_f64)?;
    Some(format!("{} - {}", format_seconds(start), format_seconds(end)))
}

fn format_seconds(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(new_request_id)
}

fn new_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut suffix = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        suffix.push_str(&format!("{:02x}", b));
    }
    format!("req_{}_{}", crate::marker::now_unix_ts(), suffix)
}

fn json_response<T: Serialize>(status: StatusCode, request_id: &str, payload: &T) -> Response {
    let mut resp = (status, Json(payload)).into_response();
    if let Ok(hv) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert("x-request-id", hv);
    }
    resp
}

fn error_response(
    status: StatusCode,
    request_id: &str,
    code: &'static str,
    message: String,
) -> Response {
    json_response(status, request_id, &ErrorBody { code, message })
}

/// Create the axum router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/query", post(query))
        .route("/api/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> std::io::Result<()> {
    let router = create_router(state);

    tracing::info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
