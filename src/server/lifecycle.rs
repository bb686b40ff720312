//! Lifecycle supervision: race each session against its wall-clock
//! deadline, surface kernel exceptions as journal failures, and evict
//! finished kernels after a grace period so clients can still GET them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::journal::{Event, EventBody, SessionFailedPayload};
use crate::kernel::Kernel;
use crate::types::Session;

use super::ServerState;

/// Extra wall-clock allowance on top of `max_duration_ms`.
pub const SESSION_TIMEOUT_BUFFER: Duration = Duration::from_secs(30);

/// How long a finished kernel stays fetchable before eviction.
pub const KERNEL_EVICTION_GRACE: Duration = Duration::from_secs(60);

/// Supervise one session: run the kernel, enforce the deadline, then
/// schedule eviction.
pub fn supervise(
    state: Arc<ServerState>,
    kernel: Arc<Kernel>,
    session: Session,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = Duration::from_millis(session.limits.max_duration_ms)
            .saturating_add(SESSION_TIMEOUT_BUFFER);
        let session_id = session.session_id.clone();

        match tokio::time::timeout(deadline, kernel.run()).await {
            Ok(Ok(finished)) => {
                info!(session_id = %session_id, status = ?finished.status, "session finished");
            }
            Ok(Err(e)) => {
                error!(session_id = %session_id, error = %e, "kernel run failed");
                append_failure(&state, &kernel, &session_id, &format!("kernel error: {e}"))
                    .await;
            }
            Err(_) => {
                warn!(session_id = %session_id, "session exceeded its deadline; aborting");
                kernel.abort();
                append_failure(
                    &state,
                    &kernel,
                    &session_id,
                    "session exceeded max_duration_ms deadline",
                )
                .await;
            }
        }

        state.remove_active(&session_id);
        tokio::time::sleep(KERNEL_EVICTION_GRACE).await;
        state.evict_kernel(&session_id);
    })
}

/// Best-effort `session.failed` append; falls back to a synthetic
/// broadcast frame when the journal itself is unavailable, so live
/// clients still learn the session died.
async fn append_failure(state: &ServerState, kernel: &Kernel, session_id: &str, reason: &str) {
    if kernel
        .get_session()
        .is_some_and(|s| s.status.is_terminal())
    {
        // The kernel already emitted its terminal event.
        return;
    }
    let body = EventBody::SessionFailed(SessionFailedPayload {
        reason: reason.to_owned(),
    });
    match state.journal.emit(session_id, body.clone()).await {
        Ok(_) => {}
        Err(e) => {
            warn!(session_id, error = %e, "failed to append failure; broadcasting synthetic event");
            let synthetic = Event {
                seq: 0,
                event_type: body.event_type().to_owned(),
                session_id: session_id.to_owned(),
                timestamp: chrono::Utc::now(),
                payload: body.payload_json(),
            };
            state.sse.dispatch(&synthetic);
            state.ws.send_event(&synthetic);
        }
    }
}
