//! Approval rendezvous: request_id → resolver, with auto-deny timers.
//!
//! A gated tool call registers here and parks on a oneshot receiver; the
//! decision arrives over REST or WS. The entry is removed from the map
//! *before* the resolver fires, so a race between the two surfaces can
//! never resolve twice. Registration and resolution are announced to every
//! WS client through a broadcast frame channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::kernel::ApprovalWait;
use crate::tools::PermissionGate;
use crate::types::{ApprovalDecision, ApprovalRequest};

/// Hard cap on simultaneously pending approvals.
pub const MAX_PENDING_APPROVALS: usize = 10_000;

/// Capacity of the control-frame broadcast channel.
const FRAME_CAPACITY: usize = 256;

/// Resolution failure surfaced to the control plane.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No pending approval with that id.
    #[error("unknown approval request")]
    NotFound,
    /// The entry outlived twice the approval timeout.
    #[error("approval request expired")]
    Gone,
}

/// Listing view of one pending approval.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingApproval {
    /// Rendezvous id.
    pub request_id: String,
    /// Session that raised the request.
    pub session_id: String,
    /// The gated call.
    pub request: ApprovalRequest,
    /// When the request was registered.
    pub created_at: DateTime<Utc>,
}

struct Entry {
    request: ApprovalRequest,
    resolver: oneshot::Sender<ApprovalDecision>,
    registered: Instant,
    created_at: DateTime<Utc>,
    timer: tokio::task::JoinHandle<()>,
}

/// Rendezvous map between gated tool calls and approval decisions.
pub struct ApprovalRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    timeout: Duration,
    frames: broadcast::Sender<serde_json::Value>,
}

impl ApprovalRegistry {
    /// Create a registry with the given auto-deny timeout.
    pub fn new(timeout: Duration) -> Arc<Self> {
        let (frames, _rx) = broadcast::channel(FRAME_CAPACITY);
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
            frames,
        })
    }

    /// Subscribe to `approve.needed` / `approve.resolved` frames.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<serde_json::Value> {
        self.frames.subscribe()
    }

    /// Register a request; the returned receiver yields the decision.
    ///
    /// Malformed request ids (control characters) and a full registry are
    /// denied synchronously. Otherwise an auto-deny timer is armed and
    /// `approve.needed` is broadcast to all WS clients.
    pub fn register(
        self: &Arc<Self>,
        request: ApprovalRequest,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();

        if request.request_id.chars().any(char::is_control) {
            warn!("denied approval request with control characters in id");
            let _ = tx.send(ApprovalDecision::Deny);
            return rx;
        }
        {
            let entries = match self.entries.lock() {
                Ok(e) => e,
                Err(_) => {
                    let _ = tx.send(ApprovalDecision::Deny);
                    return rx;
                }
            };
            if entries.len() >= MAX_PENDING_APPROVALS {
                warn!("approval registry full; denying request");
                let _ = tx.send(ApprovalDecision::Deny);
                return rx;
            }
        }

        let request_id = request.request_id.clone();
        let timer = {
            let registry = Arc::clone(self);
            let request_id = request_id.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if registry
                    .resolve(&request_id, ApprovalDecision::Deny)
                    .is_ok()
                {
                    debug!(request_id, "approval auto-denied after timeout");
                }
            })
        };

        let entry = Entry {
            request: request.clone(),
            resolver: tx,
            registered: Instant::now(),
            created_at: Utc::now(),
            timer,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(request_id.clone(), entry);
        }

        let _ = self.frames.send(serde_json::json!({
            "type": "approve.needed",
            "request_id": request_id,
            "session_id": request.session_id,
            "request": request,
        }));
        rx
    }

    /// Resolve a pending approval exactly once.
    ///
    /// The entry is removed from the map before the resolver is invoked,
    /// which makes a REST/WS race safe: the loser sees `NotFound`.
    pub fn resolve(
        &self,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), ResolveError> {
        let entry = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| ResolveError::NotFound)?;
            entries.remove(request_id).ok_or(ResolveError::NotFound)?
        };
        entry.timer.abort();

        let max_age = self.timeout.saturating_mul(2);
        if entry.registered.elapsed() > max_age {
            // Dropping the resolver denies the waiting gate.
            return Err(ResolveError::Gone);
        }

        let _ = entry.resolver.send(decision);
        let _ = self.frames.send(serde_json::json!({
            "type": "approve.resolved",
            "request_id": request_id,
            "decision": decision,
        }));
        Ok(())
    }

    /// Snapshot of all pending approvals.
    pub fn list(&self) -> Vec<PendingApproval> {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut pending: Vec<PendingApproval> = entries
            .iter()
            .map(|(id, entry)| PendingApproval {
                request_id: id.clone(),
                session_id: entry.request.session_id.clone(),
                request: entry.request.clone(),
                created_at: entry.created_at,
            })
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Number of pending approvals.
    pub fn pending_count(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Deny every pending approval (shutdown drain).
    pub fn deny_all(&self) {
        let drained: Vec<(String, Entry)> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (request_id, entry) in drained {
            entry.timer.abort();
            let _ = entry.resolver.send(ApprovalDecision::Deny);
            let _ = self.frames.send(serde_json::json!({
                "type": "approve.resolved",
                "request_id": request_id,
                "decision": ApprovalDecision::Deny,
            }));
        }
    }
}

// ── Gate bridging the runtime to the registry ───────────────────

/// Permission gate that parks gated tool calls on the approval registry.
pub struct RegistryGate {
    registry: Arc<ApprovalRegistry>,
    wait: Arc<ApprovalWait>,
}

impl RegistryGate {
    /// Create a gate raising `wait` while blocked.
    pub fn new(registry: Arc<ApprovalRegistry>, wait: Arc<ApprovalWait>) -> Self {
        Self { registry, wait }
    }
}

#[async_trait]
impl PermissionGate for RegistryGate {
    async fn request(&self, request: ApprovalRequest) -> ApprovalDecision {
        self.wait.set(true);
        let rx = self.registry.register(request);
        // A dropped resolver (expiry past 2× timeout, shutdown) denies.
        let decision = rx.await.unwrap_or(ApprovalDecision::Deny);
        self.wait.set(false);
        decision
    }
}
