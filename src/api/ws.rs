//! WebSocket endpoints: frame ingest and live event watch.
//!
//! Ingest: one connection per session; the client streams frames (JSON with
//! a base64 payload, or raw binary). Disconnect closes the lane queue,
//! which is the session's cancellation path.
//!
//! Watch: any number of subscribers per session receive serialized events
//! in publish order; a lagging subscriber skips events on its own receiver
//! without affecting the lane.

use crate::api::state::AppState;
use crate::pipeline::Frame;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

pub async fn ingest(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ingest(socket, session_id, state))
}

#[derive(Deserialize)]
struct IngestMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    frame: String,
}

async fn handle_ingest(mut socket: WebSocket, session_id: String, state: AppState) {
    let handle = match state.manager.open(&session_id) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "Ingest connection refused");
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({ "error": e.to_string() }).to_string().into(),
                ))
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let mut sequence: u64 = 0;
    while let Some(message) = socket.recv().await {
        let pixels = match message {
            Ok(Message::Text(text)) => match parse_frame_message(text.as_str()) {
                Some(pixels) => pixels,
                None => continue,
            },
            Ok(Message::Binary(bytes)) => bytes.to_vec(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue, // ping/pong handled by axum
        };

        let frame = Frame::new(&session_id, sequence, pixels);
        sequence += 1;

        // Queue backpressure: waiting here slows this client's reads down
        // to the lane's pace without touching other sessions.
        if handle.frames.send(frame).await.is_err() {
            tracing::warn!(session = %session_id, "Session lane gone, closing ingest connection");
            break;
        }
    }

    // Dropping the handle closes the lane queue; the lane drains and
    // deregisters the session on its own.
    drop(handle);
    tracing::info!(session = %session_id, frames = sequence, "Ingest connection closed");
}

/// Extract frame bytes from a client JSON message. Tolerates a
/// `data:image/jpeg;base64,` prefix. Returns None for chatter we ignore
/// and for undecodable payloads (the frame is simply dropped).
fn parse_frame_message(raw: &str) -> Option<Vec<u8>> {
    let message: IngestMessage = serde_json::from_str(raw).ok()?;
    if message.kind != "frame" {
        return None;
    }
    let payload = match message.frame.rsplit_once(',') {
        Some((_, data)) => data,
        None => message.frame.as_str(),
    };
    base64::engine::general_purpose::STANDARD.decode(payload).ok()
}

pub async fn watch(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_watch(socket, session_id, state))
}

async fn handle_watch(socket: WebSocket, session_id: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.registry.subscribe(&session_id);
    tracing::info!(session = %session_id, "Watch connection opened");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(session = %session_id, skipped, "Watch subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }

    tracing::info!(session = %session_id, "Watch connection closed");
}
