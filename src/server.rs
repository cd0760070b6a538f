// Admin HTTP server
//
// Serves Prometheus metrics and throttle status/administration over HTTP
// (default: 0.0.0.0:9090). All routes read or mutate one ThrottleRegistry.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::metrics;
use crate::throttle::ThrottleRegistry;

/// Query string of the reset route
#[derive(Debug, Default, Deserialize)]
pub struct ResetParams {
    #[serde(default)]
    pub clear_queue: bool,
}

/// Build the admin router over a registry
pub fn build_router(registry: ThrottleRegistry) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/throttles", get(overview_handler))
        .route(
            "/throttles/{agent_id}",
            get(status_handler).delete(remove_handler),
        )
        .route("/throttles/{agent_id}/reset", post(reset_handler))
        .route("/throttles/{agent_id}/metrics/reset", post(clear_metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Start the admin HTTP server
///
/// # Arguments
/// * `registry` - Registry exposed by the routes
/// * `port` - Port to listen on (default 9090)
pub async fn start_admin_server(registry: ThrottleRegistry, port: u16) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let app = build_router(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Starting admin server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind admin server")?;

    axum::serve(listener, app)
        .await
        .context("Admin server error")?;

    Ok(())
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn overview_handler(State(registry): State<ThrottleRegistry>) -> Response {
    Json(registry.overview().await).into_response()
}

async fn status_handler(
    State(registry): State<ThrottleRegistry>,
    Path(agent_id): Path<String>,
) -> Response {
    match registry.status(&agent_id).await {
        Some(status) => Json(status).into_response(),
        None => not_found(&agent_id),
    }
}

async fn reset_handler(
    State(registry): State<ThrottleRegistry>,
    Path(agent_id): Path<String>,
    Query(params): Query<ResetParams>,
) -> Response {
    match registry.lookup(&agent_id).await {
        Some(throttle) => {
            let cancelled = throttle.reset(params.clear_queue);
            Json(json!({
                "agent_id": agent_id,
                "reset": true,
                "cancelled": cancelled,
            }))
            .into_response()
        }
        None => not_found(&agent_id),
    }
}

async fn clear_metrics_handler(
    State(registry): State<ThrottleRegistry>,
    Path(agent_id): Path<String>,
) -> Response {
    if registry.clear_metrics(&agent_id).await {
        Json(json!({ "agent_id": agent_id, "metrics_reset": true })).into_response()
    } else {
        not_found(&agent_id)
    }
}

async fn remove_handler(
    State(registry): State<ThrottleRegistry>,
    Path(agent_id): Path<String>,
) -> Response {
    if registry.remove(&agent_id).await {
        Json(json!({ "agent_id": agent_id, "removed": true })).into_response()
    } else {
        not_found(&agent_id)
    }
}

fn not_found(agent_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no throttle for agent {}", agent_id) })),
    )
        .into_response()
}
