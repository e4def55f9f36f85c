//! MJPEG preview mode (spec §4.9 "MJPEG mode", §6 "MJPEG endpoint").
//!
//! JPEG encoding is a wire codec and out of scope per spec §1; this module
//! treats it as an opaque [`JpegEncoder`] and owns only the HTTP surface:
//! `multipart/x-mixed-replace` streaming, `MAX_CLIENTS` admission, CORS,
//! and 404 for anything else.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::streaming::frame_distributor::FrameDistributor;
use crate::types::{CameraId, Frame};

pub trait JpegEncoder: Send + Sync + 'static {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, String>;
}

const BOUNDARY: &str = "--mjpegboundary";

#[derive(Clone)]
struct MjpegState {
    distributor: Arc<FrameDistributor>,
    encoder: Arc<dyn JpegEncoder>,
    active_clients: Arc<AtomicUsize>,
    max_clients: usize,
    fps: u32,
}

pub struct MjpegServer {
    camera_id: CameraId,
    active_clients: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl MjpegServer {
    pub async fn start(
        camera_id: CameraId,
        port: u16,
        fps: u32,
        max_clients: usize,
        distributor: Arc<FrameDistributor>,
        encoder: Arc<dyn JpegEncoder>,
    ) -> std::io::Result<Self> {
        let active_clients = Arc::new(AtomicUsize::new(0));
        let state = MjpegState {
            distributor,
            encoder,
            active_clients: active_clients.clone(),
            max_clients,
            fps,
        };

        let app = Router::new()
            .route("/stream.mjpg", get(stream_handler))
            .fallback(not_found)
            .layer(CorsLayer::permissive())
            .with_state(state);

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(camera_id = %camera_id, port, "MJPEG preview server listening");

        let camera_for_task = camera_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(camera_id = %camera_for_task, error = %e, "MJPEG server exited");
            }
        });

        Ok(MjpegServer {
            camera_id,
            active_clients,
            handle: Some(handle),
        })
    }

    pub fn active_client_count(&self) -> usize {
        self.active_clients.load(Ordering::SeqCst)
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!(camera_id = %self.camera_id, "MJPEG server stopped");
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Decrements the active-client count when the response stream is
/// dropped, which is how axum surfaces a client disconnect (the MJPEG
/// spec frames this as "detected by write failure"; for a streamed body
/// the write failure and the drop happen together).
struct ClientGuard(Arc<AtomicUsize>);

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn stream_handler(State(state): State<MjpegState>) -> Response {
    let current = state.active_clients.fetch_add(1, Ordering::SeqCst);
    if current >= state.max_clients {
        state.active_clients.fetch_sub(1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let rx = state.distributor.subscribe();
    let encoder = state.encoder.clone();
    let guard = Arc::new(ClientGuard(state.active_clients.clone()));
    let frame_interval = Duration::from_millis(1000 / state.fps.max(1) as u64);

    let body_stream = stream::unfold(
        (rx, encoder, frame_interval, guard),
        move |(mut rx, encoder, frame_interval, guard)| async move {
            tokio::time::sleep(frame_interval).await;
            match rx.recv().await {
                Ok(frame) => match encoder.encode(&frame) {
                    Ok(jpeg) => {
                        let part = build_part(&jpeg);
                        Some((Ok::<Bytes, Infallible>(Bytes::from(part)), (rx, encoder, frame_interval, guard)))
                    }
                    Err(e) => {
                        warn!(error = %e, "jpeg encode failed, dropping frame for this client");
                        Some((Ok(Bytes::new()), (rx, encoder, frame_interval, guard)))
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    Some((Ok(Bytes::new()), (rx, encoder, frame_interval, guard)))
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => None,
            }
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(
            "Content-Type",
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )
        .body(Body::from_stream(body_stream))
        .unwrap()
}

fn build_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut out = Vec::with_capacity(header.len() + jpeg.len() + 2);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(jpeg);
    out.extend_from_slice(b"\r\n");
    out
}
