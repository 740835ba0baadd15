//! End-to-end query path: snapshot artifact → coordinator → router.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use reeldb::server::{create_router, AppState};
use reeldb::{ensure_ready, IngestionConfig, IndexState};
use tower::ServiceExt;

fn write_transcript_snapshot(dir: &Path) -> std::path::PathBuf {
    let snapshot = serde_json::json!({
        "version": "2024-06-01",
        "dim": 2,
        "records": [
            {
                "id": "a",
                "vector": [1.0, 0.0],
                "metadata": {
                    "video_title": "Attention Is All You Need, Explained",
                    "video_url": "https://youtu.be/abc",
                    "video_id": "abc",
                    "start_time": 0,
                    "end_time": 45
                }
            },
            {
                "id": "b",
                "vector": [0.0, 1.0],
                "metadata": {"video_id": "def", "start_time": 90, "end_time": 120}
            },
            {
                "id": "c",
                "vector": [0.9, 0.1],
                "metadata": {"video_id": "abc", "start_time": 45, "end_time": 90}
            }
        ]
    });
    let path = dir.join("snapshot.json");
    std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
    path
}

/// Boot a worker the way `serve` does, minus the TCP listener.
fn ready_app(dir: &Path) -> Arc<AppState> {
    let snapshot = write_transcript_snapshot(dir);
    let root = dir.join("index");

    let (index, _) = ensure_ready(&root, &snapshot, &IngestionConfig::default()).unwrap();
    let marker = IndexState::read(index.root()).unwrap().unwrap();

    let state = Arc::new(AppState::starting(None));
    state.set_ready(index.current().unwrap(), marker, "ready");
    state
}

async fn post_json(
    router: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn full_stack_example_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(ready_app(dir.path()));

    let (status, body) = post_json(
        router,
        "/api/query",
        serde_json::json!({"vector": [1.0, 0.0], "top_k": 2}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["id"], "a");
    assert_eq!(results[1]["id"], "c");
    assert!(results[0]["score"].as_f64().unwrap() > results[1]["score"].as_f64().unwrap());

    // Metadata flows through from the snapshot artifact, plus the
    // rendered timestamp range.
    assert_eq!(
        results[0]["metadata"]["video_title"],
        "Attention Is All You Need, Explained"
    );
    assert_eq!(results[0]["timestamp"], "00:00:00 - 00:00:45");
    assert_eq!(results[1]["timestamp"], "00:00:45 - 00:01:30");
}

#[tokio::test]
async fn filter_by_video_id() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(ready_app(dir.path()));

    let (status, body) = post_json(
        router,
        "/api/query",
        serde_json::json!({
            "vector": [1.0, 0.0],
            "top_k": 10,
            "filter": {"equals": {"video_id": "def"}}
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["b"]);
}

#[tokio::test]
async fn repeated_queries_return_identical_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let state = ready_app(dir.path());

    let mut first: Option<serde_json::Value> = None;
    for _ in 0..5 {
        let router = create_router(state.clone());
        let (_, body) = post_json(
            router,
            "/api/query",
            serde_json::json!({"vector": [0.5, 0.5], "top_k": 3}),
        )
        .await;
        match &first {
            Some(expected) => assert_eq!(&body["results"], &expected["results"]),
            None => first = Some(body),
        }
    }
}

#[tokio::test]
async fn malformed_body_is_client_error() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(ready_app(dir.path()));

    let request = Request::builder()
        .method("POST")
        .uri("/api/query")
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn health_reports_ingested_version() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(ready_app(dir.path()));

    let request = Request::builder()
        .method("GET")
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["ready"], true);
    assert_eq!(body["vectors"], 3);
    assert_eq!(body["dim"], 2);
    assert_eq!(body["version"], "2024-06-01");
}
