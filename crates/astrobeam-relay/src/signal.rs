use astrobeam_common::{RelayErrorCode, RelayFrame};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{ConnectionId, Endpoint, SharedSessions};
use crate::RelayState;

const WS_OUTBOX_CAPACITY: usize = 128;

/// Loosely typed view of a client frame, so each missing piece can be
/// reported precisely instead of as one parse failure.
#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<Value>,
    message: Option<Value>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .max_frame_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.sessions, addr))
}

async fn handle_socket(stream: WebSocket, sessions: SharedSessions, addr: SocketAddr) {
    let id = Uuid::new_v4();
    info!("client connected from {} ({})", addr, id);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<RelayFrame>(WS_OUTBOX_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode relay frame: {}", err);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut joined: Option<String> = None;

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!("socket error from {}: {}", addr, err);
                break;
            }
        };

        let reply = match msg {
            Message::Text(text) => process_frame(&sessions, id, &tx, &mut joined, &text).await,
            Message::Binary(_) => Some(RelayFrame::error(
                RelayErrorCode::Malformed,
                "Binary messages are not supported.",
            )),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Some(reply) = reply {
            if tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    info!(
        "client {} disconnected from session {}",
        addr,
        joined.as_deref().unwrap_or("none")
    );
    if let Some(session_id) = joined {
        let mut table = sessions.write().await;
        if table.leave(&session_id, id) {
            info!("session {} deleted (no peers left)", session_id);
        } else {
            debug!(
                "session {} now has {} peers",
                session_id,
                table.endpoint_count(&session_id)
            );
        }
    }

    drop(tx);
    let _ = writer.await;
}

/// Apply one text frame from connection `id`. Returns the reply owed to
/// that connection, if any.
pub(crate) async fn process_frame(
    sessions: &SharedSessions,
    id: ConnectionId,
    tx: &mpsc::Sender<RelayFrame>,
    joined: &mut Option<String>,
    text: &str,
) -> Option<RelayFrame> {
    let frame: IncomingFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            return Some(RelayFrame::error(
                RelayErrorCode::Malformed,
                format!("Invalid message format. {err}"),
            ))
        }
    };

    let Some(kind) = frame.kind else {
        return Some(RelayFrame::error(
            RelayErrorCode::Malformed,
            "Missing message type.",
        ));
    };

    match kind.as_str() {
        "join" => {
            if let Some(current) = joined.as_deref() {
                warn!("connection {} tried to re-join (already in {})", id, current);
                return Some(RelayFrame::error(
                    RelayErrorCode::AlreadyJoined,
                    "Connection already joined a session.",
                ));
            }

            let session_id = match frame.session_id {
                Some(Value::String(raw)) if !raw.trim().is_empty() => raw.trim().to_lowercase(),
                _ => {
                    return Some(RelayFrame::error(
                        RelayErrorCode::InvalidSession,
                        "Invalid or missing sessionId.",
                    ))
                }
            };

            let count = sessions
                .write()
                .await
                .join(&session_id, Endpoint::new(id, tx.clone()));
            info!("client joined session: {} ({} peers)", session_id, count);
            *joined = Some(session_id.clone());
            Some(RelayFrame::Joined { session_id })
        }
        "signal" => {
            let Some(session_id) = joined.as_deref() else {
                return Some(RelayFrame::error(
                    RelayErrorCode::NotJoined,
                    "Session not joined.",
                ));
            };
            let Some(message) = frame.message else {
                return Some(RelayFrame::error(
                    RelayErrorCode::MissingPayload,
                    "Missing signaling message.",
                ));
            };

            let relayed = RelayFrame::Signal {
                message,
                session_id: session_id.to_string(),
            };
            let delivered = sessions.read().await.relay(session_id, id, &relayed);
            debug!(
                "relayed signal for session {} to {} peer(s)",
                session_id, delivered
            );
            if delivered == 0 {
                Some(RelayFrame::error(
                    RelayErrorCode::NoPeer,
                    "No other peer connected to this session.",
                ))
            } else {
                None
            }
        }
        other => {
            debug!("unknown frame type {:?} from {}", other, id);
            Some(RelayFrame::error(
                RelayErrorCode::Malformed,
                "Unknown message type.",
            ))
        }
    }
}
