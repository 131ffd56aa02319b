//! WebSocket endpoint binding one observer to one session.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::browser::BrowserRegistry;
use crate::config::Settings;
use crate::planner::Planner;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::TaskSession;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub planner: Arc<Planner>,
    pub registry: Arc<BrowserRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (events_tx, mut events_rx) = mpsc::channel::<ServerMessage>(256);
    let session = Arc::new(TaskSession::new(
        state.settings,
        state.planner,
        state.registry,
        events_tx.clone(),
    ));
    tracing::info!(session = %session.id(), "observer connected");

    let (mut sink, mut stream) = socket.split();

    // One writer drains the session's events so emission order survives.
    let writer = tokio::spawn(async move {
        while let Some(message) = events_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = events_tx.send(ServerMessage::info("Connected")).await;

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(message) => session.handle(message).await,
                Err(_) => {
                    // Malformed frames are dropped; the session is untouched.
                    let kind = unknown_kind(text.as_str());
                    tracing::warn!(session = %session.id(), kind, "discarding inbound message");
                    let _ = events_tx
                        .send(ServerMessage::warn(format!("Unknown message: {kind}")))
                        .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    session.shutdown();
    writer.abort();
    tracing::info!(session = %session.id(), "observer disconnected");
}

fn unknown_kind(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .unwrap_or_else(|| "malformed".to_string())
}
