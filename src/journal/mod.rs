//! Append-only session journal: event envelope, typed payloads, stores.
//!
//! The journal is the sole durable store and the single fan-out point for
//! live clients. The kernel writes; the control plane reads through one
//! subscription and re-publishes to SSE/WS. Every event carries a
//! journal-wide monotonically increasing sequence number assigned at emit
//! time, which clients use for resumable streaming.

mod store;

pub use store::{Journal, JournalError, MemoryJournal, SqliteJournal};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Plan, Session, StepError, Usage, UsageSummary};

/// Pseudo-session id for server-level events (auth, rotation).
pub const SYSTEM_SESSION_ID: &str = "_system";

// ── Envelope ────────────────────────────────────────────────────

/// A journaled event as stored and as sent on the wire.
///
/// `payload` stays a raw JSON value in the envelope so that unknown event
/// types read back from an older or newer journal are preserved verbatim;
/// dispatching code goes through [`EventBody::decode`] and treats
/// unrecognized types as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Journal-wide monotonically increasing sequence number.
    pub seq: u64,
    /// Event type tag, e.g. `session.created`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Session the event belongs to, or [`SYSTEM_SESSION_ID`].
    pub session_id: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload object.
    pub payload: serde_json::Value,
}

impl Event {
    /// Whether this event terminates its session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "session.completed" | "session.failed" | "session.aborted"
        )
    }
}

// ── Typed payloads ──────────────────────────────────────────────

/// One finding from a plan critic, embedded in `plan.criticized`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticFinding {
    /// Critic name.
    pub name: String,
    /// Whether the critic passed.
    pub passed: bool,
    /// Failure message when not passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `error` findings block plan acceptance; `warning` is informational.
    pub severity: String,
}

/// Payload of `session.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreatedPayload {
    /// Full session record at creation time.
    pub session: Session,
}

/// Payload of `session.started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartedPayload {
    /// Execution mode the session runs under.
    pub mode: crate::types::ExecutionMode,
}

/// Payload of `session.checkpoint`, emitted after each completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpointPayload {
    /// Ids of every step that has succeeded so far in the session.
    pub completed_step_ids: Vec<String>,
}

/// Payload of `session.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCompletedPayload {
    /// Planner iterations consumed.
    pub iterations: u32,
    /// Steps that succeeded over the session lifetime.
    pub completed_steps: u32,
}

/// Payload of `session.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFailedPayload {
    /// Human-readable failure reason.
    pub reason: String,
}

/// Payload of `session.aborted`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionAbortedPayload {}

/// Payload of `planner.requested`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerRequestedPayload {
    /// 1-based agentic iteration.
    pub iteration: u32,
}

/// Payload of `planner.plan_rejected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRejectedPayload {
    /// Why the plan (or planner call) was rejected.
    pub reason: String,
    /// Which planner attempt this was.
    pub attempt: u32,
}

/// Payload of `plan.criticized`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCriticizedPayload {
    /// Plan the critics ran against.
    pub plan_id: String,
    /// Critic findings, failures first.
    pub findings: Vec<CriticFinding>,
}

/// Payload of `plan.accepted`. Carries the full plan for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAcceptedPayload {
    /// The accepted plan.
    pub plan: Plan,
    /// 1-based agentic iteration that produced it.
    pub iteration: u32,
}

/// Payload of `plan.replaced`, emitted immediately before the replacing
/// `plan.accepted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReplacedPayload {
    /// Plan being replaced.
    pub previous_plan_id: String,
    /// Plan about to be accepted.
    pub new_plan_id: String,
    /// Iteration performing the replacement.
    pub iteration: u32,
}

/// Payload of `step.started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    /// Step being started.
    pub step_id: String,
    /// Plan the step belongs to.
    pub plan_id: String,
    /// Tool the step invokes.
    pub tool: String,
}

/// Payload of `step.succeeded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSucceededPayload {
    /// Step that succeeded.
    pub step_id: String,
    /// Attempts consumed (≥ 1).
    pub attempts: u32,
    /// Opaque tool output.
    pub output: serde_json::Value,
}

/// Payload of `step.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedPayload {
    /// Step that failed.
    pub step_id: String,
    /// Attempts consumed (≥ 1).
    pub attempts: u32,
    /// Structured failure.
    pub error: StepError,
}

/// Payload of `tool.started` / `tool.succeeded` / `tool.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    /// Tool name.
    pub tool: String,
    /// Step driving the call.
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Failure detail, only on `tool.failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// Payload of `usage.recorded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecordedPayload {
    /// The call's metrics with `cost_usd` already resolved.
    pub usage: Usage,
    /// Running session totals after recording.
    pub summary: UsageSummary,
}

/// Payload of `limit.exceeded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitExceededPayload {
    /// Which limit fired, e.g. `max_steps`.
    pub limit: String,
    /// Observed value.
    pub value: f64,
    /// Configured threshold.
    pub threshold: f64,
}

/// Payload of `futility.detected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FutilityDetectedPayload {
    /// Which futility rule fired.
    pub reason: String,
}

/// Payload of `memory.lesson_extracted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonExtractedPayload {
    /// One-sentence lesson.
    pub lesson: String,
    /// `completed` or `failed`.
    pub outcome: String,
}

/// Payload of `permission.observed_execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedExecutionPayload {
    /// Tool that ran under observation.
    pub tool: String,
    /// Step driving the call.
    pub step_id: String,
}

/// Payload of `policy.violated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolatedPayload {
    /// Tool whose call violated policy.
    pub tool: String,
    /// What was violated.
    pub reason: String,
}

/// Payload of `_system` `auth.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailedPayload {
    /// Client IP.
    pub ip: String,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Generic reason tag.
    pub reason: String,
}

/// Payload of `_system` `auth.rate_limited`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRateLimitedPayload {
    /// Client IP.
    pub ip: String,
    /// Request path.
    pub path: String,
}

/// Payload of `_system` `auth.key_rotated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthKeyRotatedPayload {
    /// When the rotation happened.
    pub rotated_at: DateTime<Utc>,
}

// ── Event body union ────────────────────────────────────────────

/// Typed union over every event the core emits.
///
/// Emission goes through [`Journal::emit`] with one of these; replay code
/// uses [`EventBody::decode`] and falls back to [`EventBody::Unknown`] for
/// types this build does not recognize.
#[derive(Debug, Clone)]
pub enum EventBody {
    /// `session.created`
    SessionCreated(SessionCreatedPayload),
    /// `session.started`
    SessionStarted(SessionStartedPayload),
    /// `session.checkpoint`
    SessionCheckpoint(SessionCheckpointPayload),
    /// `session.completed`
    SessionCompleted(SessionCompletedPayload),
    /// `session.failed`
    SessionFailed(SessionFailedPayload),
    /// `session.aborted`
    SessionAborted(SessionAbortedPayload),
    /// `planner.requested`
    PlannerRequested(PlannerRequestedPayload),
    /// `planner.plan_rejected`
    PlanRejected(PlanRejectedPayload),
    /// `plan.criticized`
    PlanCriticized(PlanCriticizedPayload),
    /// `plan.accepted`
    PlanAccepted(PlanAcceptedPayload),
    /// `plan.replaced`
    PlanReplaced(PlanReplacedPayload),
    /// `step.started`
    StepStarted(StepStartedPayload),
    /// `step.succeeded`
    StepSucceeded(StepSucceededPayload),
    /// `step.failed`
    StepFailed(StepFailedPayload),
    /// `tool.started`
    ToolStarted(ToolCallPayload),
    /// `tool.succeeded`
    ToolSucceeded(ToolCallPayload),
    /// `tool.failed`
    ToolFailed(ToolCallPayload),
    /// `usage.recorded`
    UsageRecorded(UsageRecordedPayload),
    /// `limit.exceeded`
    LimitExceeded(LimitExceededPayload),
    /// `futility.detected`
    FutilityDetected(FutilityDetectedPayload),
    /// `memory.lesson_extracted`
    LessonExtracted(LessonExtractedPayload),
    /// `permission.observed_execution`
    ObservedExecution(ObservedExecutionPayload),
    /// `policy.violated`
    PolicyViolated(PolicyViolatedPayload),
    /// `auth.failed`
    AuthFailed(AuthFailedPayload),
    /// `auth.rate_limited`
    AuthRateLimited(AuthRateLimitedPayload),
    /// `auth.key_rotated`
    AuthKeyRotated(AuthKeyRotatedPayload),
    /// Any event type this build does not recognize. Preserved, never
    /// dispatched.
    Unknown {
        /// Original type tag.
        event_type: String,
        /// Original payload.
        payload: serde_json::Value,
    },
}

impl EventBody {
    /// The wire type tag for this body.
    pub fn event_type(&self) -> &str {
        match self {
            Self::SessionCreated(_) => "session.created",
            Self::SessionStarted(_) => "session.started",
            Self::SessionCheckpoint(_) => "session.checkpoint",
            Self::SessionCompleted(_) => "session.completed",
            Self::SessionFailed(_) => "session.failed",
            Self::SessionAborted(_) => "session.aborted",
            Self::PlannerRequested(_) => "planner.requested",
            Self::PlanRejected(_) => "planner.plan_rejected",
            Self::PlanCriticized(_) => "plan.criticized",
            Self::PlanAccepted(_) => "plan.accepted",
            Self::PlanReplaced(_) => "plan.replaced",
            Self::StepStarted(_) => "step.started",
            Self::StepSucceeded(_) => "step.succeeded",
            Self::StepFailed(_) => "step.failed",
            Self::ToolStarted(_) => "tool.started",
            Self::ToolSucceeded(_) => "tool.succeeded",
            Self::ToolFailed(_) => "tool.failed",
            Self::UsageRecorded(_) => "usage.recorded",
            Self::LimitExceeded(_) => "limit.exceeded",
            Self::FutilityDetected(_) => "futility.detected",
            Self::LessonExtracted(_) => "memory.lesson_extracted",
            Self::ObservedExecution(_) => "permission.observed_execution",
            Self::PolicyViolated(_) => "policy.violated",
            Self::AuthFailed(_) => "auth.failed",
            Self::AuthRateLimited(_) => "auth.rate_limited",
            Self::AuthKeyRotated(_) => "auth.key_rotated",
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    /// Serialize this body's payload to a JSON object.
    pub fn payload_json(&self) -> serde_json::Value {
        fn ser<T: Serialize>(v: &T) -> serde_json::Value {
            serde_json::to_value(v).unwrap_or(serde_json::Value::Null)
        }
        match self {
            Self::SessionCreated(p) => ser(p),
            Self::SessionStarted(p) => ser(p),
            Self::SessionCheckpoint(p) => ser(p),
            Self::SessionCompleted(p) => ser(p),
            Self::SessionFailed(p) => ser(p),
            Self::SessionAborted(p) => ser(p),
            Self::PlannerRequested(p) => ser(p),
            Self::PlanRejected(p) => ser(p),
            Self::PlanCriticized(p) => ser(p),
            Self::PlanAccepted(p) => ser(p),
            Self::PlanReplaced(p) => ser(p),
            Self::StepStarted(p) => ser(p),
            Self::StepSucceeded(p) => ser(p),
            Self::StepFailed(p) => ser(p),
            Self::ToolStarted(p) => ser(p),
            Self::ToolSucceeded(p) => ser(p),
            Self::ToolFailed(p) => ser(p),
            Self::UsageRecorded(p) => ser(p),
            Self::LimitExceeded(p) => ser(p),
            Self::FutilityDetected(p) => ser(p),
            Self::LessonExtracted(p) => ser(p),
            Self::ObservedExecution(p) => ser(p),
            Self::PolicyViolated(p) => ser(p),
            Self::AuthFailed(p) => ser(p),
            Self::AuthRateLimited(p) => ser(p),
            Self::AuthKeyRotated(p) => ser(p),
            Self::Unknown { payload, .. } => payload.clone(),
        }
    }

    /// Decode a stored event back into a typed body.
    ///
    /// Unrecognized types (and recognized types whose payloads fail to
    /// deserialize) come back as [`EventBody::Unknown`].
    pub fn decode(event: &Event) -> EventBody {
        fn de<T: for<'de> Deserialize<'de>>(
            event: &Event,
            wrap: impl FnOnce(T) -> EventBody,
        ) -> EventBody {
            match serde_json::from_value::<T>(event.payload.clone()) {
                Ok(p) => wrap(p),
                Err(_) => EventBody::Unknown {
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                },
            }
        }
        match event.event_type.as_str() {
            "session.created" => de(event, Self::SessionCreated),
            "session.started" => de(event, Self::SessionStarted),
            "session.checkpoint" => de(event, Self::SessionCheckpoint),
            "session.completed" => de(event, Self::SessionCompleted),
            "session.failed" => de(event, Self::SessionFailed),
            "session.aborted" => de(event, Self::SessionAborted),
            "planner.requested" => de(event, Self::PlannerRequested),
            "planner.plan_rejected" => de(event, Self::PlanRejected),
            "plan.criticized" => de(event, Self::PlanCriticized),
            "plan.accepted" => de(event, Self::PlanAccepted),
            "plan.replaced" => de(event, Self::PlanReplaced),
            "step.started" => de(event, Self::StepStarted),
            "step.succeeded" => de(event, Self::StepSucceeded),
            "step.failed" => de(event, Self::StepFailed),
            "tool.started" => de(event, Self::ToolStarted),
            "tool.succeeded" => de(event, Self::ToolSucceeded),
            "tool.failed" => de(event, Self::ToolFailed),
            "usage.recorded" => de(event, Self::UsageRecorded),
            "limit.exceeded" => de(event, Self::LimitExceeded),
            "futility.detected" => de(event, Self::FutilityDetected),
            "memory.lesson_extracted" => de(event, Self::LessonExtracted),
            "permission.observed_execution" => de(event, Self::ObservedExecution),
            "policy.violated" => de(event, Self::PolicyViolated),
            "auth.failed" => de(event, Self::AuthFailed),
            "auth.rate_limited" => de(event, Self::AuthRateLimited),
            "auth.key_rotated" => de(event, Self::AuthKeyRotated),
            other => EventBody::Unknown {
                event_type: other.to_owned(),
                payload: event.payload.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_event_preserved() {
        let event = Event {
            seq: 7,
            event_type: "swarm.joined".to_owned(),
            session_id: "s".to_owned(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"node": "n1"}),
        };
        match EventBody::decode(&event) {
            EventBody::Unknown {
                event_type,
                payload,
            } => {
                assert_eq!(event_type, "swarm.joined");
                assert_eq!(payload["node"], "n1");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_body_round_trip() {
        let body = EventBody::LimitExceeded(LimitExceededPayload {
            limit: "max_steps".to_owned(),
            value: 25.0,
            threshold: 5.0,
        });
        assert_eq!(body.event_type(), "limit.exceeded");
        let event = Event {
            seq: 1,
            event_type: body.event_type().to_owned(),
            session_id: "s".to_owned(),
            timestamp: Utc::now(),
            payload: body.payload_json(),
        };
        match EventBody::decode(&event) {
            EventBody::LimitExceeded(p) => {
                assert_eq!(p.limit, "max_steps");
                assert!((p.threshold - 5.0).abs() < f64::EPSILON);
            }
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_terminal_detection() {
        let mut event = Event {
            seq: 1,
            event_type: "session.completed".to_owned(),
            session_id: "s".to_owned(),
            timestamp: Utc::now(),
            payload: serde_json::json!({}),
        };
        assert!(event.is_terminal());
        event.event_type = "step.failed".to_owned();
        assert!(!event.is_terminal());
    }
}
