//! WebSocket viewers.
//!
//! A viewer sends `{"type":"start","url":...}` and gets back either
//! `{"type":"ready","streamId":...,"streamUrl":...}` or an error followed by
//! a close frame. Every session acquired over the socket is released exactly
//! once when the socket goes away.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::manager::SessionManager;
use crate::server::AppState;
use crate::session::{SessionId, StreamTicket};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Messages accepted from the viewer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Start { url: String },
}

/// Messages sent to the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ready {
        #[serde(rename = "streamId")]
        stream_id: SessionId,
        #[serde(rename = "streamUrl")]
        stream_url: String,
    },
    Error {
        message: String,
    },
}

impl From<StreamTicket> for ServerMessage {
    fn from(ticket: StreamTicket) -> Self {
        ServerMessage::Ready {
            stream_id: ticket.id,
            stream_url: ticket.public_url,
        }
    }
}

/// What to do after handling one text frame.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Reply and keep the socket open
    Continue(ServerMessage),
    /// Reply, record the acquired session and keep going
    Acquired(SessionId, ServerMessage),
    /// Reply, then close
    Close(ServerMessage),
}

/// Handles WebSocket upgrade requests to `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, state))
}

async fn handle_text(manager: &SessionManager, text: &str) -> Step {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            return Step::Continue(ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            })
        }
    };

    match message {
        ClientMessage::Start { url } => match manager.connect(&url).await {
            Ok(ticket) => Step::Acquired(ticket.id, ticket.into()),
            Err(e) => {
                warn!(source = %url, error = %e, "viewer start failed");
                Step::Close(ServerMessage::Error {
                    message: e.to_string(),
                })
            }
        },
    }
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

/// Manages a single viewer connection.
async fn serve_viewer(mut socket: WebSocket, state: AppState) {
    let manager = state.manager;
    let mut acquired: Vec<SessionId> = Vec::new();
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                match handle_text(&manager, text.as_str()).await {
                    Step::Continue(reply) => {
                        if !send_json(&mut socket, &reply).await {
                            break;
                        }
                    }
                    Step::Acquired(id, reply) => {
                        acquired.push(id);
                        if !send_json(&mut socket, &reply).await {
                            break;
                        }
                    }
                    Step::Close(reply) => {
                        let _ = send_json(&mut socket, &reply).await;
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    debug!(sessions = acquired.len(), "viewer disconnected");
    for id in acquired {
        manager.disconnect(id).await;
    }
}
