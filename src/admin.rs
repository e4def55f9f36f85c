//! Admin HTTP surface.
//!
//! Config CRUD and the REST surface proper are an external collaborator this
//! crate's core doesn't implement; this module is the thin read-only status
//! view the core exposes for that collaborator to sit behind, backed by
//! [`crate::task_manager::TaskManager::list_status`].

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::pipeline::PipelineStatus;
use crate::task_manager::TaskManager;

#[derive(Clone)]
pub struct AppState {
    pub task_manager: Arc<TaskManager>,
}

pub async fn run_server(bind_ip: String, admin_port: u16, task_manager: Arc<TaskManager>) -> anyhow::Result<()> {
    let state = AppState { task_manager };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/cameras", get(list_status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{bind_ip}:{admin_port}");
    info!(%addr, "starting admin server");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct StatusListResponse {
    cameras: Vec<PipelineStatusView>,
}

#[derive(Serialize)]
struct PipelineStatusView {
    camera_id: String,
    state: Option<String>,
    decode_drop_count: u64,
    fanout_drop_count: u64,
    active_track_count: usize,
    is_recording: bool,
    preview_client_count: Option<usize>,
}

impl From<PipelineStatus> for PipelineStatusView {
    fn from(s: PipelineStatus) -> Self {
        PipelineStatusView {
            camera_id: s.camera_id,
            state: s.state.map(|st| format!("{st:?}")),
            decode_drop_count: s.decode_drop_count,
            fanout_drop_count: s.fanout_drop_count,
            active_track_count: s.active_track_count,
            is_recording: s.is_recording,
            preview_client_count: s.preview_client_count,
        }
    }
}

async fn list_status_handler(State(state): State<AppState>) -> Json<StatusListResponse> {
    Json(StatusListResponse {
        cameras: state.task_manager.list_status().into_iter().map(Into::into).collect(),
    })
}
