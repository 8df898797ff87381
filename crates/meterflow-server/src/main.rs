//! Meterflow Server - Main entry point

use anyhow::Result;
use meterflow_common::logging::{init_logging, LogConfig};
use meterflow_ingest::resolve::{HttpGraphClient, MappingRefresher};
use meterflow_ingest::storage::{S3ObjectStore, StorageConfig};
use meterflow_ingest::IngestConfig;
use meterflow_server::middleware::auth::ApiToken;
use meterflow_server::{router, AppState, ServerConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("meterflow-server")
        .filter_directives("meterflow_server=debug,meterflow_ingest=info,tower_http=debug")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    let _guard = init_logging(&log_config)?;

    info!("Starting Meterflow Server");

    let config = ServerConfig::load()?;
    let ingest = IngestConfig::from_env()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.host, config.port
    );

    let storage = StorageConfig::from_env();
    let store = S3ObjectStore::new(&storage, ingest.bucket.clone()).await;
    let graph = HttpGraphClient::new(config.graph_endpoint.clone())?;
    let refresher = MappingRefresher::new(Arc::new(graph), Arc::new(store), ingest.mappings_key);

    let state = AppState {
        refresher: Arc::new(refresher),
        token: ApiToken::new(config.api_token.clone()),
    };
    let app = router(state, config.daily_refresh_quota)?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // In-flight refreshes get a short grace period
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
