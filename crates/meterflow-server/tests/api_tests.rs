//! Refresh API behavior: authentication, response shape and the daily quota

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use meterflow_ingest::resolve::{GraphClient, MappingRefresher, MappingTable};
use meterflow_ingest::storage::MemoryObjectStore;
use meterflow_server::middleware::auth::ApiToken;
use meterflow_server::{router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const TOKEN: &str = "s3cret";
const MAPPINGS_KEY: &str = "nem12_mappings.json";

struct FixedGraph;

#[async_trait]
impl GraphClient for FixedGraph {
    async fn meter_vertices(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(vec![
            ("NMI1-E1".to_string(), "sensor-1".to_string()),
            ("NMI1-B1".to_string(), "sensor-2".to_string()),
        ])
    }
}

struct BrokenGraph;

#[async_trait]
impl GraphClient for BrokenGraph {
    async fn meter_vertices(&self) -> anyhow::Result<Vec<(String, String)>> {
        anyhow::bail!("graph endpoint unreachable")
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::new("warn,meterflow_server=debug"))
        .with_test_writer()
        .try_init();
}

fn app(graph: Arc<dyn GraphClient>, store: &MemoryObjectStore, quota: u32) -> Router {
    init_tracing();
    let refresher = MappingRefresher::new(graph, Arc::new(store.clone()), MAPPINGS_KEY);
    let state = AppState {
        refresher: Arc::new(refresher),
        token: ApiToken::new(TOKEN),
    };
    router(state, quota).unwrap()
}

fn refresh_request(authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/mappings/refresh");
    if let Some(value) = authorization {
        builder = builder.header(header::AUTHORIZATION, value);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let store = MemoryObjectStore::new("ingest");
    let response = app(Arc::new(FixedGraph), &store, 500)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let store = MemoryObjectStore::new("ingest");
    let app = app(Arc::new(FixedGraph), &store, 500);

    let response = app.clone().oneshot(refresh_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["status"], 401);

    let response = app
        .oneshot(refresh_request(Some("Basic dXNlcjpwYXNz")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!store.contains(MAPPINGS_KEY));
}

#[tokio::test]
async fn test_wrong_token_is_forbidden() {
    let store = MemoryObjectStore::new("ingest");
    let response = app(Arc::new(FixedGraph), &store, 500)
        .oneshot(refresh_request(Some("Bearer nope")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"]["status"], 403);
    assert!(!store.contains(MAPPINGS_KEY));
}

#[tokio::test]
async fn test_refresh_writes_table() {
    let store = MemoryObjectStore::new("ingest");
    let response = app(Arc::new(FixedGraph), &store, 500)
        .oneshot(refresh_request(Some(&format!("Bearer {}", TOKEN))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["data"]["mappings"], 2);

    let table = MappingTable::load(&store, MAPPINGS_KEY).await.unwrap();
    assert_eq!(table.get("NMI1", "B1"), Some("sensor-2"));
}

#[tokio::test]
async fn test_graph_failure_is_bad_gateway() {
    let store = MemoryObjectStore::new("ingest");
    let response = app(Arc::new(BrokenGraph), &store, 500)
        .oneshot(refresh_request(Some(&format!("Bearer {}", TOKEN))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await["error"]["message"], "Mapping refresh failed");
}

#[tokio::test]
async fn test_quota_exhaustion_is_429() {
    let store = MemoryObjectStore::new("ingest");
    let app = app(Arc::new(FixedGraph), &store, 2);
    let authorized = format!("Bearer {}", TOKEN);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(refresh_request(Some(&authorized)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(refresh_request(Some(&authorized)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Health checks are outside the quota
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
