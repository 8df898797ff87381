//! Meterflow Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! On-demand refresh of the meter mapping table.
//!
//! # Routes
//!
//! - `GET /health`
//! - `POST /api/v1/mappings/refresh`: bearer-token protected, limited to a
//!   global daily quota. Rebuilds the mapping table from the identifier graph
//!   and answers `{"data":{"mappings":N}}`.

pub mod config;
pub mod error;
pub mod middleware;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use meterflow_ingest::resolve::MappingRefresher;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub use config::ServerConfig;
pub use error::ApiError;
use middleware::auth::{require_bearer, ApiToken};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub refresher: Arc<MappingRefresher>,
    pub token: ApiToken,
}

/// Build the application router with all routes and middleware
pub fn router(state: AppState, daily_quota: u32) -> anyhow::Result<Router> {
    let protected = Router::new()
        .route("/mappings/refresh", post(refresh_mappings))
        .route_layer(axum::middleware::from_fn_with_state(
            state.token.clone(),
            require_bearer,
        ));
    // The quota sits outside authentication so rejected calls count too
    let protected = middleware::rate_limit::with_daily_quota(protected, daily_quota)?;

    Ok(Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", protected)
        .with_state(state)
        .layer(middleware::tracing_layer()))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn refresh_mappings(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mappings = state.refresher.refresh().await?;
    info!(mappings, "Mapping table refreshed on request");
    Ok(Json(json!({ "data": { "mappings": mappings } })))
}
