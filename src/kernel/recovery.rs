//! Rebuilding kernel state from the journal after a crash.
//!
//! A session is recoverable when its event trail has `session.created`,
//! `session.started`, and at least one `plan.accepted`, and no terminal
//! event. The replay restores the active plan, every recorded step result,
//! and the usage totals, so the continued run never re-executes a step
//! that already succeeded.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::Utc;

use crate::journal::{Event, EventBody, Journal, JournalError};
use crate::types::{Plan, Session, SessionStatus, StepResult, StepStatus, UsageSummary};

/// State rebuilt from a session's event trail.
#[derive(Debug, Clone)]
pub struct RecoveredSession {
    /// The session record, status reset to `running`.
    pub session: Session,
    /// The most recently accepted plan.
    pub plan: Plan,
    /// Step results recorded before the crash.
    pub results: Vec<StepResult>,
    /// Usage totals at the last `usage.recorded` event.
    pub usage: UsageSummary,
    /// Iteration of the last accepted plan.
    pub iteration: u32,
    /// Number of distinct steps that had started.
    pub started_steps: u32,
}

/// Inspect a session's journal and rebuild it if recoverable.
pub async fn inspect(
    journal: &dyn Journal,
    session_id: &str,
) -> Result<Option<RecoveredSession>, JournalError> {
    let events = journal.read_session(session_id, 0, usize::MAX).await?;
    if events.is_empty() {
        return Ok(None);
    }

    let mut session: Option<Session> = None;
    let mut has_started = false;
    let mut plan: Option<Plan> = None;
    let mut iteration: u32 = 0;
    let mut results: BTreeMap<String, StepResult> = BTreeMap::new();
    let mut started_ids: BTreeSet<String> = BTreeSet::new();
    let mut usage = UsageSummary::default();

    for event in &events {
        if event.is_terminal() {
            return Ok(None);
        }
        match EventBody::decode(event) {
            EventBody::SessionCreated(p) => session = Some(p.session),
            EventBody::SessionStarted(_) => has_started = true,
            EventBody::PlanAccepted(p) => {
                iteration = p.iteration;
                plan = Some(p.plan);
            }
            EventBody::StepStarted(p) => {
                started_ids.insert(p.step_id);
            }
            EventBody::StepSucceeded(p) => {
                results.insert(
                    p.step_id.clone(),
                    StepResult {
                        step_id: p.step_id,
                        status: StepStatus::Succeeded,
                        attempts: p.attempts,
                        output: Some(p.output),
                        error: None,
                    },
                );
            }
            EventBody::StepFailed(p) => {
                results.insert(
                    p.step_id.clone(),
                    StepResult {
                        step_id: p.step_id,
                        status: StepStatus::Failed,
                        attempts: p.attempts,
                        error: Some(p.error),
                        output: None,
                    },
                );
            }
            EventBody::UsageRecorded(p) => usage = p.summary,
            _ => {}
        }
    }

    let (Some(mut session), Some(plan)) = (session, plan) else {
        return Ok(None);
    };
    if !has_started {
        return Ok(None);
    }

    session.status = SessionStatus::Running;
    session.active_plan_id = Some(plan.plan_id.clone());
    session.updated_at = Utc::now();

    Ok(Some(RecoveredSession {
        session,
        plan,
        results: results.into_values().collect(),
        usage,
        iteration,
        started_steps: u32::try_from(started_ids.len()).unwrap_or(u32::MAX),
    }))
}

/// Scan the whole journal for session records (terminal ones included),
/// newest first. Used by the control plane's session listing.
pub async fn scan_sessions(journal: &dyn Journal) -> Result<Vec<Session>, JournalError> {
    let events = journal.read_all().await?;
    let mut sessions: BTreeMap<String, Session> = BTreeMap::new();

    for event in &events {
        match EventBody::decode(event) {
            EventBody::SessionCreated(p) => {
                sessions.insert(event.session_id.clone(), p.session);
            }
            EventBody::PlanAccepted(p) => {
                if let Some(session) = sessions.get_mut(&event.session_id) {
                    session.active_plan_id = Some(p.plan.plan_id);
                    session.updated_at = event.timestamp;
                }
            }
            EventBody::SessionStarted(_) => {
                if let Some(session) = sessions.get_mut(&event.session_id) {
                    session.status = SessionStatus::Running;
                    session.updated_at = event.timestamp;
                }
            }
            EventBody::SessionCompleted(_) => {
                set_status(&mut sessions, event, SessionStatus::Completed);
            }
            EventBody::SessionFailed(_) => {
                set_status(&mut sessions, event, SessionStatus::Failed);
            }
            EventBody::SessionAborted(_) => {
                set_status(&mut sessions, event, SessionStatus::Aborted);
            }
            _ => {}
        }
    }

    let mut list: Vec<Session> = sessions.into_values().collect();
    list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(list)
}

fn set_status(sessions: &mut BTreeMap<String, Session>, event: &Event, status: SessionStatus) {
    if let Some(session) = sessions.get_mut(&event.session_id) {
        session.status = status;
        session.updated_at = event.timestamp;
    }
}
