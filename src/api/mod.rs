//! Node HTTP surface: the snapshot-barrier hooks the coordinator drives,
//! plus health/metrics. The CRUD and attack-simulation routes that would
//! also live on this surface are out of scope for the core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Serialize;
use tracing::info;
use walkdir::WalkDir;

use crate::metrics::MetricsServer;
use crate::node_state::NodeState;
use crate::snapshot::types::SnapshotCommand;

#[derive(Clone)]
pub struct ApiState {
    pub node_state: Arc<NodeState>,
    pub monitor_dir: PathBuf,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    node_id: String,
    locked_down: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/snapshot/prepare", post(snapshot_prepare))
        .route("/snapshot/commit", post(snapshot_commit))
        .route("/snapshot/data", get(snapshot_data))
        .with_state(state)
}

pub async fn serve(state: ApiState, bind: &str) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("api: listening on {bind}");
    axum::serve(listener, app).await
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.node_state.client_id.clone(),
        locked_down: state.node_state.is_locked_down(),
    })
}

async fn prometheus_metrics() -> String {
    MetricsServer::new().encode_metrics().unwrap_or_default()
}

/// Closes the write gate and acknowledges. Idempotent: re-closing an
/// already-closed gate is a no-op.
async fn snapshot_prepare(State(state): State<ApiState>, Json(command): Json<SnapshotCommand>) -> Json<StatusResponse> {
    state.node_state.write_gate.close();
    state.node_state.begin_pending_snapshot(&command.command_id);
    Json(StatusResponse { status: "ready".to_string() })
}

/// Opens the write gate and acknowledges. Idempotent: re-opening an
/// already-open gate is a no-op.
async fn snapshot_commit(State(state): State<ApiState>, Json(command): Json<SnapshotCommand>) -> Json<StatusResponse> {
    state.node_state.take_pending_snapshot(&command.command_id);
    state.node_state.write_gate.open();
    Json(StatusResponse { status: "resumed".to_string() })
}

/// Read-only dump of every file under the monitored directory, base64
/// encoded by relative path. Used by the recovery side-channel, not by the
/// barrier protocol itself.
async fn snapshot_data(State(state): State<ApiState>) -> Json<HashMap<String, String>> {
    let mut out = HashMap::new();
    for entry in WalkDir::new(&state.monitor_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&state.monitor_dir) else {
            continue;
        };
        if let Ok(bytes) = std::fs::read(entry.path()) {
            out.insert(rel.to_string_lossy().into_owned(), base64::engine::general_purpose::STANDARD.encode(bytes));
        }
    }
    Json(out)
}
