use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use mesh_proto::{ErrorCode, ErrorReply, PeerId, ServerFrame};
use metrics::{counter, gauge};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// WebSocket upgrade handler for the signaling endpoint.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let session_id = params.session_id.filter(|id| !id.trim().is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: Option<String>, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let Some(session_id) = session_id else {
        info!(target: "rendezvous", "rejecting connection without session id");
        reject(&mut sender, ErrorCode::IdNotGivenInConnectionUrl).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connected = state.registry.lock().connect(&session_id, tx.clone());
    match connected {
        Ok(active_sessions) => {
            counter!("rendezvous_sessions_connected_total", 1);
            gauge!("rendezvous_sessions_active", active_sessions as f64);
        }
        Err(err) => {
            warn!(target: "rendezvous", session = %session_id, error = %err, "refusing connection");
            reject(&mut sender, err.error_code()).await;
            return;
        }
    }

    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(target: "rendezvous", session = %writer_session, "writer task finished");
    });

    info!(target: "rendezvous", session = %session_id, "session connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target: "rendezvous",
                    session = %session_id,
                    error = %err,
                    "error receiving frame"
                );
                break;
            }
        };

        match frame {
            Message::Text(text) => handle_text(&state, &session_id, &tx, text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_text(&state, &session_id, &tx, text),
                Err(_) => {
                    debug!(target: "rendezvous", session = %session_id, "non-UTF8 binary frame");
                    reply_error(&tx, ErrorReply::new(ErrorCode::MalformedJson));
                }
            },
            Message::Close(frame) => {
                debug!(
                    target: "rendezvous",
                    session = %session_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let gone = state.registry.lock().disconnect(&session_id);
    gauge!("rendezvous_sessions_active", gone.active_sessions as f64);
    gauge!("rendezvous_peers_registered", gone.registered_peers as f64);
    writer.abort();

    info!(
        target: "rendezvous",
        session = %session_id,
        peers_removed = gone.removed.len(),
        neighbors_released = gone.released.len(),
        "session disconnected"
    );
}

fn handle_text(state: &AppState, session_id: &str, tx: &mpsc::UnboundedSender<String>, text: String) {
    let value: Value = match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            debug!(target: "rendezvous", session = %session_id, "malformed frame");
            reply_error(tx, ErrorReply::new(ErrorCode::MalformedJson));
            return;
        }
    };

    if let Some(new_peer) = value.get("new") {
        let peer_id = match new_peer.as_str().map(PeerId::parse) {
            Some(Ok(peer_id)) => peer_id,
            _ => {
                reply_error(tx, ErrorReply::new(ErrorCode::MalformedJson));
                return;
            }
        };
        register_peer(state, session_id, tx, peer_id);
        return;
    }

    let Some(destination) = value.get("destination").and_then(Value::as_str) else {
        reply_error(tx, ErrorReply::unknown_target(None));
        return;
    };

    let kind = relay_kind(&value);
    let routed = state.registry.lock().route(destination, text);
    match routed {
        Ok(()) => {
            counter!("rendezvous_messages_forwarded_total", 1, "kind" => kind);
            debug!(
                target: "rendezvous",
                session = %session_id,
                destination,
                kind,
                "forwarded signaling frame"
            );
        }
        Err(err) => {
            debug!(target: "rendezvous", session = %session_id, error = %err, "route failed");
            reply_error(tx, ErrorReply::unknown_target(Some(destination.to_string())));
        }
    }
}

fn register_peer(
    state: &AppState,
    session_id: &str,
    tx: &mpsc::UnboundedSender<String>,
    peer_id: PeerId,
) {
    let registered = state.registry.lock().register(session_id, peer_id.clone());
    match registered {
        Ok(registration) => {
            counter!("rendezvous_peers_registered_total", 1);
            gauge!(
                "rendezvous_peers_registered",
                registration.registered_peers as f64
            );
            match registration.assignment {
                Some(assign) => {
                    counter!("rendezvous_pairings_total", 1);
                    info!(
                        target: "rendezvous",
                        peer = %assign.node_id,
                        neighbor = %assign.connect,
                        "assigned neighbor"
                    );
                    let _ = tx.send(encode(&ServerFrame::Assign(assign)));
                }
                None => {
                    debug!(target: "rendezvous", peer = %peer_id, "registered without neighbor");
                }
            }
        }
        Err(err) => {
            warn!(target: "rendezvous", session = %session_id, error = %err, "registration failed");
            reply_error(tx, ErrorReply::new(err.error_code()));
        }
    }
}

fn relay_kind(value: &Value) -> &'static str {
    ["offer", "answer", "candidate"]
        .into_iter()
        .find(|key| value.get(key).is_some())
        .unwrap_or("other")
}

fn reply_error(tx: &mpsc::UnboundedSender<String>, reply: ErrorReply) {
    record_protocol_error(reply.error_code);
    let _ = tx.send(encode(&reply));
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, code: ErrorCode) {
    record_protocol_error(code);
    let _ = sender
        .send(Message::Text(encode(&ErrorReply::new(code))))
        .await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: code.as_str().into(),
        })))
        .await;
}

fn encode<T: serde::Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}

fn record_protocol_error(code: ErrorCode) {
    counter!(
        "rendezvous_protocol_errors_total",
        1,
        "reason" => code.as_str()
    );
}
