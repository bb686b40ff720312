//! Control-plane server: session admission, REST + SSE + WS surfaces,
//! approval rendezvous, and graceful shutdown.
//!
//! The server owns one journal subscription and republishes events to
//! clients; every other shared structure (kernels, active set, hubs,
//! approvals, rate limiter, auth keys) sits behind its own lock.

pub mod approvals;
pub mod auth;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod mdns;
pub mod rate_limit;
mod router;
mod ws;

pub use approvals::{ApprovalRegistry, RegistryGate, ResolveError, MAX_PENDING_APPROVALS};
pub use auth::AuthState;
pub use events::{SseHub, WsHub};
pub use rate_limit::{RateCheck, RateLimiter, MAX_IPS};

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::journal::{Event, EventBody, Journal};
use crate::kernel::{
    recovery, ActiveMemory, ApprovalWait, Kernel, KernelConfig, KernelDeps, Planner,
};
use crate::tools::{LocalRuntime, ToolRegistry};
use crate::types::{ExecutionMode, Limits, Session, SessionStatus, Task};

/// Maximum sessions returned by the listing endpoint.
const MAX_SESSION_LISTING: usize = 100;

/// Rate-limiter prune interval.
const RATE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

// ── Submission types ────────────────────────────────────────────

/// Client-supplied limit overrides; absent fields take server maxima.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ClientLimits {
    /// Cumulative step budget.
    pub max_steps: Option<u32>,
    /// Wall-clock budget in milliseconds.
    pub max_duration_ms: Option<u64>,
    /// Dollar budget.
    pub max_cost_usd: Option<f64>,
    /// Token budget.
    pub max_tokens: Option<u64>,
    /// Agentic iteration budget.
    pub max_iterations: Option<u32>,
}

impl ClientLimits {
    /// Merge over the server maxima, validate, then clamp back to them.
    pub fn resolve(self, server_max: &Limits) -> Result<Limits, crate::types::ValidationError> {
        let merged = Limits {
            max_steps: self.max_steps.unwrap_or(server_max.max_steps),
            max_duration_ms: self.max_duration_ms.unwrap_or(server_max.max_duration_ms),
            max_cost_usd: self.max_cost_usd.unwrap_or(server_max.max_cost_usd),
            max_tokens: self.max_tokens.unwrap_or(server_max.max_tokens),
            max_iterations: self.max_iterations.unwrap_or(server_max.max_iterations),
        };
        merged.validate()?;
        Ok(merged.clamp_to(server_max))
    }
}

/// One session submission (REST body or WS `submit` frame).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitParams {
    /// Task text.
    pub text: String,
    /// Execution mode; defaults to mock.
    #[serde(default)]
    pub mode: Option<String>,
    /// Limit overrides.
    #[serde(default)]
    pub limits: Option<ClientLimits>,
    /// Free-form constraints for the planner.
    #[serde(default)]
    pub constraints: Option<std::collections::BTreeMap<String, serde_json::Value>>,
    /// Submitter label.
    #[serde(default)]
    pub submitted_by: Option<String>,
    /// Accepted and ignored — policy is server-controlled.
    #[serde(default)]
    pub policy: Option<serde_json::Value>,
}

/// Session admission failures.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Invalid client input (400).
    #[error("{0}")]
    Invalid(String),
    /// Concurrent session cap reached (429).
    #[error("too many concurrent sessions")]
    Capacity,
    /// Recover on an already-active session (409).
    #[error("session is already active")]
    AlreadyActive,
    /// Session not recoverable (404).
    #[error("session is not recoverable")]
    NotRecoverable,
    /// Internal failure (500).
    #[error("internal error: {0}")]
    Internal(String),
}

// ── Shared state ────────────────────────────────────────────────

/// Shared state behind every HTTP/WS handler.
pub struct ServerState {
    /// Daemon configuration.
    pub config: ServerConfig,
    /// The journal, sole durable store.
    pub journal: Arc<dyn Journal>,
    /// Tool registry.
    pub registry: Arc<ToolRegistry>,
    /// Planner handed to every kernel.
    pub planner: Arc<dyn Planner>,
    /// Optional active memory shared across sessions.
    pub memory: Option<Arc<dyn ActiveMemory>>,
    /// Kernels by session id; evicted on a delay after finishing.
    pub kernels: Mutex<HashMap<String, Arc<Kernel>>>,
    /// Session ids currently under lifecycle supervision.
    pub active: Mutex<HashSet<String>>,
    /// SSE client hub.
    pub sse: Arc<SseHub>,
    /// WS client hub.
    pub ws: Arc<WsHub>,
    /// Approval rendezvous.
    pub approvals: Arc<ApprovalRegistry>,
    /// Per-IP limiter.
    pub rate_limiter: RateLimiter,
    /// Bearer auth state.
    pub auth: AuthState,
    /// Process start time for health reporting.
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    fn new(
        config: ServerConfig,
        journal: Arc<dyn Journal>,
        registry: Arc<ToolRegistry>,
        planner: Arc<dyn Planner>,
        memory: Option<Arc<dyn ActiveMemory>>,
    ) -> Arc<Self> {
        let approvals =
            ApprovalRegistry::new(Duration::from_millis(config.approval_timeout_ms));
        let rate_limiter = RateLimiter::new(config.rate_limit);
        let auth = AuthState::new(config.api_token.clone());
        Arc::new(Self {
            config,
            journal,
            registry,
            planner,
            memory,
            kernels: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            sse: Arc::new(SseHub::new()),
            ws: Arc::new(WsHub::new()),
            approvals,
            rate_limiter,
            auth,
            started_at: Utc::now(),
        })
    }

    // ── Session bookkeeping ─────────────────────────────────────

    pub(crate) fn kernel_for(&self, session_id: &str) -> Option<Arc<Kernel>> {
        self.kernels
            .lock()
            .ok()
            .and_then(|k| k.get(session_id).cloned())
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub(crate) fn is_active(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(session_id))
            .unwrap_or(false)
    }

    pub(crate) fn remove_active(&self, session_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(session_id);
        }
    }

    pub(crate) fn evict_kernel(&self, session_id: &str) {
        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.remove(session_id);
        }
        debug!(session_id, "kernel evicted");
    }

    /// Reserve an admission slot under the active-set lock (no TOCTOU
    /// between the cap check and the insert). Returns the placeholder to
    /// swap for the real session id.
    fn reserve_slot(&self) -> Result<String, AdmissionError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| AdmissionError::Internal("active set lock poisoned".to_owned()))?;
        if active.len() >= self.config.max_concurrent_sessions {
            return Err(AdmissionError::Capacity);
        }
        let placeholder = format!("reserved-{}", Uuid::new_v4());
        active.insert(placeholder.clone());
        Ok(placeholder)
    }

    fn fill_slot(&self, placeholder: &str, session_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(placeholder);
            active.insert(session_id.to_owned());
        }
    }

    fn release_slot(&self, placeholder: &str) {
        self.remove_active(placeholder);
    }

    /// Build a kernel wired to this server's collaborators.
    fn build_kernel(&self, mode: ExecutionMode, limits: Limits) -> Arc<Kernel> {
        let wait = Arc::new(ApprovalWait::new());
        let gate = RegistryGate::new(Arc::clone(&self.approvals), Arc::clone(&wait));
        let runtime = LocalRuntime::new(Arc::clone(&self.registry)).with_gate(Arc::new(gate));
        let deps = KernelDeps {
            journal: Arc::clone(&self.journal),
            registry: Arc::clone(&self.registry),
            planner: Arc::clone(&self.planner),
            runtime: Some(Arc::new(runtime)),
            memory: self.memory.clone(),
            hooks: None,
            approval_wait: Some(wait),
        };
        let config = KernelConfig {
            mode,
            limits,
            policy: self.config.policy.clone(),
            agentic: self.config.agentic,
            critics_enabled: self.config.critics_enabled,
            planner_retries: self.config.planner.retries,
            planner_timeout: Duration::from_millis(self.config.planner.timeout_ms),
            futility: self.config.futility,
            pricing: self.config.pricing,
            task_domain: None,
        };
        Arc::new(Kernel::new(deps, config))
    }

    // ── Admission paths ─────────────────────────────────────────

    /// Validate, admit, create, and start a session.
    pub async fn submit_session(
        self: &Arc<Self>,
        params: SubmitParams,
    ) -> Result<Session, AdmissionError> {
        let (kernel, session) = self.admit_session(params).await?;
        self.start_session(kernel, session.clone());
        Ok(session)
    }

    /// Validate and admit a session without starting it.
    ///
    /// The WS gateway subscribes the connection between admission and
    /// start so no early event is missed; REST starts immediately.
    pub async fn admit_session(
        self: &Arc<Self>,
        params: SubmitParams,
    ) -> Result<(Arc<Kernel>, Session), AdmissionError> {
        let task = Task::new(
            &params.text,
            params.constraints.clone(),
            params.submitted_by.clone(),
        )
        .map_err(|e| AdmissionError::Invalid(e.to_string()))?;
        let mode = match &params.mode {
            Some(mode) => ExecutionMode::parse(mode)
                .map_err(|e| AdmissionError::Invalid(e.to_string()))?,
            None => ExecutionMode::default(),
        };
        let limits = params
            .limits
            .unwrap_or_default()
            .resolve(&self.config.server_limits)
            .map_err(|e| AdmissionError::Invalid(e.to_string()))?;

        let placeholder = self.reserve_slot()?;
        let kernel = self.build_kernel(mode, limits);
        let session = match kernel.create_session(task).await {
            Ok(session) => session,
            Err(e) => {
                self.release_slot(&placeholder);
                return Err(AdmissionError::Internal(e.to_string()));
            }
        };
        self.fill_slot(&placeholder, &session.session_id);
        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.insert(session.session_id.clone(), Arc::clone(&kernel));
        }
        info!(session_id = %session.session_id, "session admitted");
        Ok((kernel, session))
    }

    /// Put an admitted session under lifecycle supervision.
    pub fn start_session(self: &Arc<Self>, kernel: Arc<Kernel>, session: Session) {
        let _supervisor = lifecycle::supervise(Arc::clone(self), kernel, session);
    }

    /// Recover a crashed session from the journal and continue it.
    pub async fn recover_session(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<Session, AdmissionError> {
        if self.is_active(session_id) {
            return Err(AdmissionError::AlreadyActive);
        }
        let placeholder = self.reserve_slot()?;
        // Recovered sessions run under current server maxima.
        let kernel = self.build_kernel(ExecutionMode::default(), self.config.server_limits);
        let resumed = match kernel.resume_session(session_id).await {
            Ok(resumed) => resumed,
            Err(e) => {
                self.release_slot(&placeholder);
                return Err(AdmissionError::Internal(e.to_string()));
            }
        };
        let Some(session) = resumed else {
            self.release_slot(&placeholder);
            return Err(AdmissionError::NotRecoverable);
        };
        self.fill_slot(&placeholder, session_id);
        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.insert(session_id.to_owned(), Arc::clone(&kernel));
        }
        let _supervisor = lifecycle::supervise(Arc::clone(self), kernel, session.clone());
        info!(session_id, "session recovered");
        Ok(session)
    }

    // ── Views ───────────────────────────────────────────────────

    /// A session by id: live kernel view first, then the journal.
    pub async fn session_view(&self, session_id: &str) -> Option<Session> {
        if let Some(kernel) = self.kernel_for(session_id) {
            if let Some(session) = kernel.get_session() {
                return Some(session);
            }
        }
        let events = self
            .journal
            .read_session(session_id, 0, usize::MAX)
            .await
            .ok()?;
        session_from_events(&events)
    }

    /// Recent sessions: live kernels merged with journal history.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut by_id: HashMap<String, Session> = HashMap::new();
        if let Ok(recovered) = recovery::scan_sessions(self.journal.as_ref()).await {
            for session in recovered {
                by_id.insert(session.session_id.clone(), session);
            }
        }
        let live: Vec<Arc<Kernel>> = self
            .kernels
            .lock()
            .map(|k| k.values().cloned().collect())
            .unwrap_or_default();
        for kernel in live {
            if let Some(session) = kernel.get_session() {
                by_id.insert(session.session_id.clone(), session);
            }
        }
        let mut sessions: Vec<Session> = by_id.into_values().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions.truncate(MAX_SESSION_LISTING);
        sessions
    }

    /// Best-effort `_system` journal emission.
    pub(crate) async fn emit_system(&self, body: EventBody) {
        if let Err(e) = self
            .journal
            .emit(crate::journal::SYSTEM_SESSION_ID, body)
            .await
        {
            warn!(error = %e, "failed to journal system event");
        }
    }
}

/// Fold a session's event trail into its current record.
fn session_from_events(events: &[Event]) -> Option<Session> {
    let mut session: Option<Session> = None;
    for event in events {
        match EventBody::decode(event) {
            EventBody::SessionCreated(p) => session = Some(p.session),
            EventBody::SessionStarted(_) => {
                if let Some(s) = session.as_mut() {
                    s.status = SessionStatus::Running;
                    s.updated_at = event.timestamp;
                }
            }
            EventBody::PlanAccepted(p) => {
                if let Some(s) = session.as_mut() {
                    s.active_plan_id = Some(p.plan.plan_id);
                    s.updated_at = event.timestamp;
                }
            }
            EventBody::SessionCompleted(_) => {
                if let Some(s) = session.as_mut() {
                    s.status = SessionStatus::Completed;
                    s.updated_at = event.timestamp;
                }
            }
            EventBody::SessionFailed(_) => {
                if let Some(s) = session.as_mut() {
                    s.status = SessionStatus::Failed;
                    s.updated_at = event.timestamp;
                }
            }
            EventBody::SessionAborted(_) => {
                if let Some(s) = session.as_mut() {
                    s.status = SessionStatus::Aborted;
                    s.updated_at = event.timestamp;
                }
            }
            _ => {}
        }
    }
    session
}

// ── Server ──────────────────────────────────────────────────────

/// The control-plane daemon: binds HTTP + WS and supervises sessions.
pub struct Server {
    state: Arc<ServerState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    http: Mutex<Option<JoinHandle<()>>>,
    mdns: Mutex<Option<mdns::MdnsHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Build a server over its collaborators. Validates configuration.
    pub fn new(
        config: ServerConfig,
        journal: Arc<dyn Journal>,
        registry: Arc<ToolRegistry>,
        planner: Arc<dyn Planner>,
        memory: Option<Arc<dyn ActiveMemory>>,
    ) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        let state = ServerState::new(config, journal, registry, planner, memory);
        let (shutdown_tx, _rx) = watch::channel(false);
        Ok(Self {
            state,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            http: Mutex::new(None),
            mdns: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Shared state handle (used by tests and embedders).
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Address the server is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    /// Bind HTTP + WS, start background pumps, and (on Unix hosts)
    /// advertise over mDNS.
    pub async fn listen(&self) -> anyhow::Result<SocketAddr> {
        let bind = format!("{}:{}", self.state.config.bind_addr, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        if let Ok(mut local) = self.local_addr.lock() {
            *local = Some(addr);
        }

        let mut handles = Vec::new();

        // Single journal subscription feeding both hubs.
        handles.push(tokio::spawn(events::fan_out_loop(
            Arc::clone(&self.state.journal),
            Arc::clone(&self.state.sse),
            Arc::clone(&self.state.ws),
            self.shutdown_tx.subscribe(),
        )));

        // Approval frames go to every WS client.
        {
            let approvals = Arc::clone(&self.state.approvals);
            let ws = Arc::clone(&self.state.ws);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut frames = approvals.subscribe_frames();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        frame = frames.recv() => match frame {
                            Ok(frame) => ws.send_all(&frame),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }));
        }

        // Periodic rate-limiter pruning.
        {
            let state = Arc::clone(&self.state);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RATE_PRUNE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => state.rate_limiter.prune(),
                    }
                }
            }));
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }

        if self.state.config.mdns_enabled {
            let handle = mdns::MdnsHandle::advertise(&self.state.config.service_name, addr.port());
            if let Ok(mut mdns) = self.mdns.lock() {
                *mdns = Some(handle);
            }
        }

        let app = router::build(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();
        let mut shutdown = self.shutdown_tx.subscribe();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        let http = tokio::spawn(async move {
            if let Err(e) = server.await {
                warn!(error = %e, "http server exited with error");
            }
        });
        if let Ok(mut slot) = self.http.lock() {
            *slot = Some(http);
        }

        info!(%addr, "control plane listening");
        Ok(addr)
    }

    /// Drain everything in order: approvals → kernels → SSE/WS → rate
    /// limiter → scheduler/metrics hooks → journal → mDNS → HTTP.
    pub async fn shutdown(&self) {
        info!("control plane shutting down");

        // 1. Auto-deny pending approvals so gated steps unblock.
        self.state.approvals.deny_all();

        // 2. Abort every kernel cooperatively.
        let kernels: Vec<Arc<Kernel>> = self
            .state
            .kernels
            .lock()
            .map(|k| k.values().cloned().collect())
            .unwrap_or_default();
        for kernel in kernels {
            kernel.abort();
        }

        // 3. Close live client surfaces and stop the fan-out pumps.
        let _ = self.shutdown_tx.send(true);
        self.state.sse.close_all();
        self.state.ws.close_all();

        // 4. Rate limiter: final prune; its timer task stops with the
        //    shutdown signal.
        self.state.rate_limiter.prune();

        // 5./6. Scheduler and metrics are external collaborators; nothing
        //       to stop in this build.

        // 7. Close the journal.
        if let Err(e) = self.state.journal.close().await {
            warn!(error = %e, "journal close failed");
        }

        // 8. Stop mDNS advertisement.
        let mdns = self.mdns.lock().ok().and_then(|mut m| m.take());
        if let Some(mdns) = mdns {
            mdns.stop().await;
        }

        // 9. Wait for the HTTP accept loop to finish.
        let http = self.http.lock().ok().and_then(|mut h| h.take());
        if let Some(http) = http {
            if tokio::time::timeout(Duration::from_secs(5), http)
                .await
                .is_err()
            {
                warn!("http server did not stop in time");
            }
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }
}
