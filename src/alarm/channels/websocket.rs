//! Embedded WebSocket alarm channel (spec §4.12 "WebSocket", §6 "WebSocket
//! alarm channel").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alarm::payload::to_wire_json;
use crate::types::{AlarmMethod, AlarmPayload, DeliveryResult};

#[derive(Clone)]
struct WsState {
    tx: broadcast::Sender<String>,
    client_count: Arc<AtomicUsize>,
}

/// Embedded server every configured WebSocket alarm channel broadcasts
/// through. One instance per configured port (default 8081).
pub struct WebSocketAlarmServer {
    tx: broadcast::Sender<String>,
    client_count: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl WebSocketAlarmServer {
    pub async fn start(port: u16) -> std::io::Result<Self> {
        let (tx, _rx) = broadcast::channel(256);
        let client_count = Arc::new(AtomicUsize::new(0));
        let state = WsState {
            tx: tx.clone(),
            client_count: client_count.clone(),
        };

        let app = Router::new().route("/", get(ws_handler)).with_state(state);
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "alarm websocket server listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "alarm websocket server exited");
            }
        });

        Ok(WebSocketAlarmServer {
            tx,
            client_count,
            handle: Some(handle),
        })
    }

    pub fn connected_clients(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Broadcast `json` to all connected clients. Returns the number of
    /// clients the payload reached.
    pub fn broadcast(&self, json: String) -> usize {
        self.tx.send(json).unwrap_or(0)
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsState) {
    state.client_count.fetch_add(1, Ordering::SeqCst);
    let welcome = serde_json::json!({
        "type": "welcome",
        "message": "connected to alarm channel",
        "timestamp": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
    });
    if socket.send(Message::Text(welcome.to_string())).await.is_err() {
        state.client_count.fetch_sub(1, Ordering::SeqCst);
        return;
    }

    let mut rx = state.tx.subscribe();
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
    state.client_count.fetch_sub(1, Ordering::SeqCst);
}

/// Deliver one alarm to every connected client. Per spec: zero connected
/// clients still counts as delivered unless a config requires a minimum,
/// which this crate does not currently expose as a knob.
pub fn deliver(config_id: &str, server: &WebSocketAlarmServer, payload: &AlarmPayload) -> DeliveryResult {
    let started = Instant::now();
    let json = match to_wire_json(payload) {
        Ok(j) => j,
        Err(e) => {
            return DeliveryResult {
                config_id: config_id.to_string(),
                method: AlarmMethod::WebSocket,
                success: false,
                elapsed: started.elapsed(),
                error: Some(format!("failed to serialize payload: {e}")),
            }
        }
    };
    server.broadcast(json);
    DeliveryResult {
        config_id: config_id.to_string(),
        method: AlarmMethod::WebSocket,
        success: true,
        elapsed: started.elapsed(),
        error: None,
    }
}
