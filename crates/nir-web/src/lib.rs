//! Axum JSON surface over [`NodeGateway`].

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use nir_sync::{BatchSummary, NodeGateway, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "nir-web";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<NodeGateway>,
}

impl AppState {
    pub fn new(gateway: Arc<NodeGateway>) -> Self {
        Self { gateway }
    }
}

#[derive(Debug, Default, Deserialize)]
struct NodeQuery {
    node: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodesQuery {
    comparison: Option<String>,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    success: bool,
    #[serde(flatten)]
    summary: &'a BatchSummary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/gateway/health", get(health_handler))
        .route("/api/gateway/process", get(process_handler))
        .route("/api/gateway/process-all", get(process_all_handler))
        .route("/api/gateway/status", get(status_handler))
        .route("/api/gateway/nodes", get(nodes_handler))
        .route("/api/gateway/stats", get(stats_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

pub async fn serve(gateway: Arc<NodeGateway>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving gateway API");
    axum::serve(listener, app(AppState::new(gateway))).await?;
    Ok(())
}

async fn index_handler() -> Response {
    Json(json!({
        "success": true,
        "message": "Node Incident Reconciler gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "process_all": "GET /api/gateway/process-all",
            "process": "GET /api/gateway/process?node=N1",
            "status": "GET /api/gateway/status?node=N1",
            "nodes": "GET /api/gateway/nodes[?comparison=true]",
            "stats": "GET /api/gateway/stats",
            "health": "GET /api/gateway/health"
        }
    }))
    .into_response()
}

async fn health_handler() -> Response {
    Json(json!({
        "success": true,
        "status": "online",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn process_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
) -> Response {
    let Some(node) = query.node else {
        return error_response(StatusCode::BAD_REQUEST, "parameter `node` is required");
    };
    match state.gateway.process_node(&node).await {
        Ok(outcome) => {
            let status = if outcome.success {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(outcome)).into_response()
        }
        Err(err) => sync_error(err),
    }
}

async fn process_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.gateway.process_all().await {
        Ok(summary) if summary.total_nodes == 0 => {
            error_response(StatusCode::NOT_FOUND, "no nodes found in any source table")
        }
        Ok(summary) => {
            let status = if summary.is_partial() {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            let body = BatchBody {
                success: true,
                summary: &summary,
            };
            (status, Json(body)).into_response()
        }
        Err(err) => sync_error(err),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
) -> Response {
    let Some(node) = query.node else {
        return error_response(StatusCode::BAD_REQUEST, "parameter `node` is required");
    };
    match state.gateway.get_node_status(&node).await {
        Ok(report) => {
            let status = if report.success {
                StatusCode::OK
            } else {
                StatusCode::NOT_FOUND
            };
            (status, Json(report)).into_response()
        }
        Err(err) => sync_error(err),
    }
}

async fn nodes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodesQuery>,
) -> Response {
    let comparison = query
        .comparison
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if comparison {
        return match state.gateway.compare_nodes().await {
            Ok(report) => Json(json!({ "success": true, "comparison": report })).into_response(),
            Err(err) => sync_error(err),
        };
    }
    match state.gateway.list_nodes().await {
        Ok(nodes) => Json(json!({
            "success": true,
            "total": nodes.len(),
            "nodes": nodes,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "success": true,
        "stats": state.gateway.get_optimization_stats(),
    }))
    .into_response()
}

async fn not_found_handler(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "endpoint not found",
            "path": uri.path(),
        })),
    )
        .into_response()
}

fn sync_error(err: SyncError) -> Response {
    match err {
        SyncError::Validation(_) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        other => {
            error!(error = %other, "request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": message,
        })),
    )
        .into_response()
}
