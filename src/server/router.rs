//! REST router: endpoints, input validation, security headers, and the
//! auth/rate-limit gates.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::debug;

use crate::config::is_production;
use crate::journal::{AuthFailedPayload, AuthKeyRotatedPayload, AuthRateLimitedPayload, EventBody};
use crate::types::{parse_session_id, ApprovalDecision};

use super::events::{self, SseClientGuard, SSE_KEEPALIVE};
use super::rate_limit::now_ms;
use super::{approvals::ResolveError, ws, AdmissionError, ServerState, SubmitParams};

/// Journal page size ceiling.
pub const MAX_JOURNAL_PAGE: usize = 500;

/// Replay endpoint event ceiling.
pub const MAX_REPLAY_EVENTS: usize = 1000;

// ── Error envelope ──────────────────────────────────────────────

/// REST error response: `{ "error": string }` with a status code.
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        // Production mode keeps internals out of client-visible bodies.
        let message = if is_production() {
            "internal error".to_owned()
        } else {
            message.into()
        };
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, Json(json!({ "error": self.message }))).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Invalid(message) => Self::bad_request(message),
            AdmissionError::Capacity => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, e.to_string())
            }
            AdmissionError::AlreadyActive => Self::new(StatusCode::CONFLICT, e.to_string()),
            AdmissionError::NotRecoverable => Self::not_found(e.to_string()),
            AdmissionError::Internal(message) => Self::internal(message),
        }
    }
}

fn parse_json_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

// ── Router assembly ─────────────────────────────────────────────

/// Build the full `/api` router with security headers and gate layers.
pub fn build(state: Arc<ServerState>) -> Router {
    let routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/abort", post(abort_session))
        .route("/api/sessions/{id}/journal", get(session_journal))
        .route("/api/sessions/{id}/stream", get(session_stream))
        .route("/api/sessions/{id}/replay", post(session_replay))
        .route("/api/sessions/{id}/recover", post(session_recover))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/{id}", post(resolve_approval))
        .route("/api/auth/rotate-key", post(rotate_key))
        .route("/api/journal/compact", post(compact_journal))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/{name}", get(get_tool))
        .route("/api/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_gate,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_gate,
        ));

    routes
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
        ))
        .with_state(state)
}

fn gate_exempt(path: &str) -> bool {
    path == "/api/health" || path.starts_with("/docs")
}

// ── Gates ───────────────────────────────────────────────────────

async fn rate_limit_gate(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if gate_exempt(&path) {
        return next.run(request).await;
    }

    let ip = addr.ip().to_string();
    let check = state.rate_limiter.check(&ip);
    let limit = state.rate_limiter.max_requests();

    let mut response = if check.allowed {
        next.run(request).await
    } else {
        state
            .emit_system(EventBody::AuthRateLimited(AuthRateLimitedPayload {
                ip: ip.clone(),
                path,
            }))
            .await;
        let retry_secs = check
            .reset_at
            .saturating_sub(now_ms())
            .saturating_add(999)
            .checked_div(1000)
            .unwrap_or(1)
            .max(1);
        let mut error = ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
        error.retry_after_secs = Some(retry_secs);
        error.into_response()
    };

    let headers = response.headers_mut();
    insert_header(headers, "x-ratelimit-limit", &limit.to_string());
    insert_header(headers, "x-ratelimit-remaining", &check.remaining.to_string());
    insert_header(
        headers,
        "x-ratelimit-reset",
        &check.reset_at.checked_div(1000).unwrap_or(0).to_string(),
    );
    response
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

async fn auth_gate(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.auth.enabled() {
        return next.run(request).await;
    }
    let path = request.uri().path().to_owned();
    // The WS upgrade authenticates through its query token.
    if gate_exempt(&path) || path == "/api/ws" {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let (ok, reason) = match presented {
        Some(token) if state.auth.verify(token) => (true, ""),
        Some(_) => (false, "invalid token"),
        None => (false, "missing bearer"),
    };

    if !ok {
        state
            .emit_system(EventBody::AuthFailed(AuthFailedPayload {
                ip: addr.ip().to_string(),
                method: request.method().to_string(),
                path,
                reason: reason.to_owned(),
            }))
            .await;
        return ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    // Strip the raw credential before the request reaches handlers.
    request.headers_mut().remove(header::AUTHORIZATION);
    next.run(request).await
}

// ── Handlers ────────────────────────────────────────────────────

async fn health(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(super::health::report(&state).await)
}

async fn list_sessions(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let sessions = state.list_sessions().await;
    Json(json!({ "sessions": sessions }))
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let params: SubmitParams = parse_json_body(&body)?;
    let session = state.submit_session(params).await?;
    Ok(Json(json!({
        "session_id": session.session_id,
        "session": session,
    })))
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    parse_session_id(&id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let session = state
        .session_view(&id)
        .await
        .ok_or_else(|| ApiError::not_found("unknown session"))?;
    Ok(Json(serde_json::to_value(&session).unwrap_or(json!({}))))
}

async fn abort_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    parse_session_id(&id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    if let Some(kernel) = state.kernel_for(&id) {
        kernel.abort();
        return Ok(Json(json!({ "session_id": id, "status": "aborting" })));
    }
    // A session known only from the journal: abort is a no-op.
    let session = state
        .session_view(&id)
        .await
        .ok_or_else(|| ApiError::not_found("unknown session"))?;
    Ok(Json(json!({ "session_id": id, "status": session.status })))
}

#[derive(Deserialize)]
struct JournalQuery {
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn session_journal(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<JournalQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    parse_session_id(&id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(MAX_JOURNAL_PAGE);
    let events = state
        .journal
        .read_session(&id, offset, limit)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let total = state
        .journal
        .count_session(&id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({
        "events": events,
        "total": total,
        "offset": offset,
        "limit": limit,
    })))
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(default)]
    after_seq: Option<u64>,
}

async fn session_stream(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: axum::http::HeaderMap,
) -> Result<Response, ApiError> {
    parse_session_id(&id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    if state.session_view(&id).await.is_none() {
        return Err(ApiError::not_found("unknown session"));
    }
    if state.sse.client_count(&id) >= state.config.max_sse_clients_per_session {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "too many stream clients for session",
        ));
    }

    let after_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or(query.after_seq);

    let (client_id, live) = state.sse.register(&id);
    let guard = SseClientGuard::new(Arc::clone(&state.sse), id.clone(), client_id);

    let replay = match after_seq {
        Some(after) => events::compute_replay(state.journal.as_ref(), &id, after)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?,
        None => events::SseReplay {
            events: Vec::new(),
            remaining: None,
        },
    };
    debug!(session_id = %id, client_id, replayed = replay.events.len(), "sse client attached");

    let stream = events::sse_stream(replay, live, guard);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
        .into_response())
}

async fn session_replay(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    parse_session_id(&id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let mut events = state
        .journal
        .read_session(&id, 0, MAX_REPLAY_EVENTS.saturating_add(1))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if events.is_empty() {
        return Err(ApiError::not_found("unknown session"));
    }
    let truncated = events.len() > MAX_REPLAY_EVENTS;
    events.truncate(MAX_REPLAY_EVENTS);
    Ok(Json(json!({
        "events": events,
        "truncated": truncated,
    })))
}

async fn session_recover(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    parse_session_id(&id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let session = state.recover_session(&id).await?;
    Ok(Json(json!({
        "session_id": session.session_id,
        "session": session,
    })))
}

async fn list_approvals(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(json!({ "approvals": state.approvals.list() }))
}

#[derive(Deserialize)]
struct DecisionBody {
    decision: String,
}

async fn resolve_approval(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body: DecisionBody = parse_json_body(&body)?;
    let decision = ApprovalDecision::parse(&body.decision)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    match state.approvals.resolve(&id, decision) {
        Ok(()) => Ok(Json(json!({ "request_id": id, "resolved": true }))),
        Err(ResolveError::NotFound) => Err(ApiError::not_found("unknown approval request")),
        Err(ResolveError::Gone) => Err(ApiError::new(
            StatusCode::GONE,
            "approval request expired",
        )),
    }
}

async fn rotate_key(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let new_key = state
        .auth
        .rotate()
        .map_err(|e| ApiError::new(StatusCode::FORBIDDEN, e.to_string()))?;
    let rotated_at = chrono::Utc::now();
    state
        .emit_system(EventBody::AuthKeyRotated(AuthKeyRotatedPayload {
            rotated_at,
        }))
        .await;
    Ok(Json(json!({
        "new_key": new_key,
        "rotated_at": rotated_at,
    })))
}

#[derive(Deserialize, Default)]
struct CompactBody {
    #[serde(default)]
    retain_sessions: Vec<String>,
}

async fn compact_journal(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body: CompactBody = if body.is_empty() {
        CompactBody::default()
    } else {
        parse_json_body(&body)?
    };
    // Active sessions always survive compaction.
    let mut retain = body.retain_sessions;
    if let Ok(active) = state.active.lock() {
        retain.extend(active.iter().cloned());
    }
    let removed = state
        .journal
        .compact(&retain)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "removed": removed })))
}

async fn list_tools(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(json!({ "tools": state.registry.list() }))
}

async fn get_tool(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let spec = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::not_found("unknown tool"))?;
    Ok(Json(serde_json::to_value(&spec).unwrap_or(json!({}))))
}
