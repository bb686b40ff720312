//! WebSocket gateway: submit/abort/approve/ping over `/api/ws`.
//!
//! The upgrade authenticates through a `token` query parameter (constant
//! time, same as the bearer path). Each connection holds its own session
//! subscriptions; journal events reach it through the fan-out loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::journal::{AuthFailedPayload, EventBody};
use crate::types::ApprovalDecision;

use super::{approvals::ResolveError, ServerState, SubmitParams};

/// Per-message size cap: oversized frames get an error, not a close.
pub const MAX_WS_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Deserialize)]
pub(crate) struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Upgrade handler for `/api/ws`.
pub(crate) async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.auth.enabled() {
        let authorized = query
            .token
            .as_deref()
            .is_some_and(|token| state.auth.verify(token));
        if !authorized {
            state
                .emit_system(EventBody::AuthFailed(AuthFailedPayload {
                    ip: addr.ip().to_string(),
                    method: "GET".to_owned(),
                    path: "/api/ws".to_owned(),
                    reason: "invalid ws token".to_owned(),
                }))
                .await;
            return (
                StatusCode::UNAUTHORIZED,
                axum::Json(json!({ "error": "Unauthorized" })),
            )
                .into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<ServerState>, socket: WebSocket) {
    let (connection_id, mut outbound) = state.ws.register();
    debug!(connection_id, "ws client connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(connection_id, error = %e, "ws read error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if text.len() > MAX_WS_MESSAGE_BYTES {
                    state.ws.send_to(
                        connection_id,
                        &json!({ "type": "error", "message": "message too large" }),
                    );
                    continue;
                }
                handle_message(&state, connection_id, text.as_str()).await;
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer.
            _ => {}
        }
    }

    state.ws.unregister(connection_id);
    writer.abort();
    debug!(connection_id, "ws client disconnected");
}

async fn handle_message(state: &Arc<ServerState>, connection_id: u64, text: &str) {
    let reply = |frame: serde_json::Value| state.ws.send_to(connection_id, &frame);

    let Ok(message) = serde_json::from_str::<serde_json::Value>(text) else {
        reply(json!({ "type": "error", "message": "invalid JSON" }));
        return;
    };
    let message_type = message.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match message_type {
        "submit" => {
            let params: SubmitParams = match serde_json::from_value(message.clone()) {
                Ok(params) => params,
                Err(e) => {
                    reply(json!({ "type": "error", "message": format!("invalid submit: {e}") }));
                    return;
                }
            };
            match state.admit_session(params).await {
                Ok((kernel, session)) => {
                    // Subscribe before the session starts so the
                    // connection misses no events.
                    state.ws.subscribe(connection_id, &session.session_id);
                    reply(json!({
                        "type": "session.created",
                        "session_id": session.session_id,
                        "session": session,
                    }));
                    // Replay the just-emitted session.created journal
                    // event so the connection sees the full trail.
                    if let Ok(events) = state
                        .journal
                        .read_session(&session.session_id, 0, 1)
                        .await
                    {
                        if let Some(event) = events.first() {
                            reply(json!({
                                "type": "event",
                                "session_id": session.session_id,
                                "event": event,
                            }));
                        }
                    }
                    state.start_session(kernel, session);
                }
                Err(e) => {
                    warn!(connection_id, error = %e, "ws submit rejected");
                    reply(json!({ "type": "error", "message": e.to_string() }));
                }
            }
        }
        "abort" => {
            let Some(session_id) = message.get("session_id").and_then(|v| v.as_str()) else {
                reply(json!({ "type": "error", "message": "abort requires session_id" }));
                return;
            };
            match state.kernel_for(session_id) {
                Some(kernel) => {
                    kernel.abort();
                    reply(json!({ "type": "abort.requested", "session_id": session_id }));
                }
                None => {
                    reply(json!({ "type": "error", "message": "unknown session" }));
                }
            }
        }
        "approve" => {
            let request_id = message.get("request_id").and_then(|v| v.as_str());
            let decision = message.get("decision").and_then(|v| v.as_str());
            let (Some(request_id), Some(decision)) = (request_id, decision) else {
                reply(json!({
                    "type": "error",
                    "message": "approve requires request_id and decision",
                }));
                return;
            };
            let decision = match ApprovalDecision::parse(decision) {
                Ok(d) => d,
                Err(e) => {
                    reply(json!({ "type": "error", "message": e.to_string() }));
                    return;
                }
            };
            match state.approvals.resolve(request_id, decision) {
                // The approve.resolved broadcast reaches this client too.
                Ok(()) => {}
                Err(ResolveError::NotFound) => {
                    reply(json!({ "type": "error", "message": "unknown approval request" }));
                }
                Err(ResolveError::Gone) => {
                    reply(json!({ "type": "error", "message": "approval request expired" }));
                }
            }
        }
        "ping" => reply(json!({ "type": "pong" })),
        other => {
            reply(json!({
                "type": "error",
                "message": format!("unknown message type: {other}"),
            }));
        }
    }
}
