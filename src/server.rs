//! # Metrics Server
//!
//! Optional HTTP surface for the long-running roles: `/metrics` renders the
//! status snapshot as Prometheus text and `/healthz` checks the store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::db;
use crate::status::{StatusService, evaluate_health, render_prometheus};

/// Shared state for the metrics routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub status: StatusService,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: Arc<DatabaseConnection>) -> Self {
        Self {
            status: StatusService::new(config.clone(), db.clone()),
            config,
            db,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.status.snapshot(None).await {
        Ok(snapshot) => {
            let health = evaluate_health(&snapshot, &state.config);
            (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                render_prometheus(&snapshot, Some(&health)),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, "Failed to build metrics snapshot");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

async fn healthz(State(state): State<AppState>) -> Response {
    match db::health_check(&state.db).await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

/// Serves the metrics routes on `addr` until `shutdown` fires.
pub async fn serve_metrics(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Metrics endpoint listening");
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
