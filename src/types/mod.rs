//! Core data model shared by the kernel and the control plane.
//!
//! Everything here serializes with `serde` using snake_case wire casing so
//! the same types back the journal payloads, the REST responses, and the
//! WS/SSE frames.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum task text length in characters.
pub const MAX_TASK_TEXT_CHARS: usize = 10_000;

/// Maximum `submitted_by` length in characters.
pub const MAX_SUBMITTED_BY_CHARS: usize = 200;

/// Current plan schema version emitted by planners.
pub const PLAN_SCHEMA_VERSION: u32 = 1;

// ── Errors ──────────────────────────────────────────────────────

/// Client-visible validation errors for task and limit inputs.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Task text is empty after trimming.
    #[error("task text must be non-empty")]
    EmptyTaskText,
    /// Task text exceeds [`MAX_TASK_TEXT_CHARS`].
    #[error("task text exceeds {MAX_TASK_TEXT_CHARS} characters")]
    TaskTextTooLong,
    /// `submitted_by` exceeds [`MAX_SUBMITTED_BY_CHARS`].
    #[error("submitted_by exceeds {MAX_SUBMITTED_BY_CHARS} characters")]
    SubmittedByTooLong,
    /// A limit field was zero or negative.
    #[error("limit {0} must be positive")]
    NonPositiveLimit(&'static str),
    /// A string is not a valid UUID.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    /// Unknown execution mode string.
    #[error("invalid mode: {0}")]
    InvalidMode(String),
    /// Unknown approval decision string.
    #[error("invalid decision: {0}")]
    InvalidDecision(String),
}

// ── Session ─────────────────────────────────────────────────────

/// Lifecycle status of a session. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session allocated, not yet running.
    Created,
    /// Planner call in flight.
    Planning,
    /// Executing plan steps.
    Running,
    /// Blocked on a human approval.
    AwaitingApproval,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: failed (limits, futility, planner, or step failure).
    Failed,
    /// Terminal: cooperatively aborted.
    Aborted,
}

impl SessionStatus {
    /// Whether this status is terminal (completed / failed / aborted).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Execution mode for tool dispatch within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Serve canned `mock_responses` from the tool spec.
    #[default]
    Mock,
    /// Describe what would run without side effects.
    DryRun,
    /// Dispatch to the registered executor.
    Live,
}

impl ExecutionMode {
    /// Parse a wire-format mode string.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "mock" => Ok(Self::Mock),
            "dry_run" => Ok(Self::DryRun),
            "live" => Ok(Self::Live),
            other => Err(ValidationError::InvalidMode(other.to_owned())),
        }
    }
}

/// The top-level unit of work, surfaced read-only via the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque lowercase hyphenated UUID string.
    pub session_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Tool dispatch mode.
    pub mode: ExecutionMode,
    /// The immutable task this session works on.
    pub task: Task,
    /// Plan currently being executed, if any.
    pub active_plan_id: Option<String>,
    /// Resource budgets for the whole session.
    pub limits: Limits,
    /// Server-controlled execution policy.
    pub policy: Policy,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session last changed state.
    pub updated_at: DateTime<Utc>,
}

/// Validate that a string is a well-formed session id (UUID).
pub fn parse_session_id(s: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(s).map_err(|_| ValidationError::InvalidSessionId(s.to_owned()))
}

// ── Task ────────────────────────────────────────────────────────

/// An immutable natural-language task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// Trimmed task text.
    pub text: String,
    /// Optional free-form constraints passed through to the planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<BTreeMap<String, serde_json::Value>>,
    /// Optional submitter label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Build a validated task from raw client input.
    ///
    /// Trims `text`; rejects empty or oversized text and oversized
    /// `submitted_by`.
    pub fn new(
        text: &str,
        constraints: Option<BTreeMap<String, serde_json::Value>>,
        submitted_by: Option<String>,
    ) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyTaskText);
        }
        if trimmed.chars().count() > MAX_TASK_TEXT_CHARS {
            return Err(ValidationError::TaskTextTooLong);
        }
        if let Some(by) = &submitted_by {
            if by.chars().count() > MAX_SUBMITTED_BY_CHARS {
                return Err(ValidationError::SubmittedByTooLong);
            }
        }
        Ok(Self {
            task_id: Uuid::new_v4(),
            text: trimmed.to_owned(),
            constraints,
            submitted_by,
            created_at: Utc::now(),
        })
    }
}

// ── Plan & steps ────────────────────────────────────────────────

/// Reference to a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRef {
    /// Registered tool name.
    pub name: String,
}

/// What the kernel does when a step fails after exhausting retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// End the execute phase with session failure.
    #[default]
    Abort,
    /// Keep executing independent steps; dependents are skipped.
    Continue,
    /// Break out to the agentic loop for a new plan.
    Replan,
}

/// A single planned tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Identifier stable across replans when the planner reuses it.
    pub step_id: String,
    /// Human-readable step title.
    pub title: String,
    /// Tool to invoke.
    pub tool_ref: ToolRef,
    /// Static input object; `input_from` bindings are merged over it.
    #[serde(default = "empty_object")]
    pub input: serde_json::Value,
    /// Optional success criteria for the planner's own bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
    /// Failure handling after retries are exhausted.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Per-attempt tool timeout in milliseconds.
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional retry attempts after the first failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Step ids that must succeed before this step starts.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Input-field bindings: field name → `<step_id>.<output.path>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_from: BTreeMap<String, String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

/// An ordered step plan produced by a planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan identifier.
    pub plan_id: String,
    /// Plan schema version; currently [`PLAN_SCHEMA_VERSION`].
    pub schema_version: u32,
    /// What the plan is trying to achieve.
    pub goal: String,
    /// Assumptions the planner made.
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// When the plan was produced.
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Build an empty "done" plan — the planner's signal to conclude.
    pub fn done(goal: &str) -> Self {
        Self {
            plan_id: Uuid::new_v4().to_string(),
            schema_version: PLAN_SCHEMA_VERSION,
            goal: goal.to_owned(),
            assumptions: Vec::new(),
            steps: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Stable content fingerprint over goal and steps.
    ///
    /// Used by the futility monitor to detect identical plans accepted
    /// across iterations. FNV-1a over the goal plus each step's id, tool,
    /// and canonical (key-sorted) input serialization. The `plan_id` and
    /// timestamps are deliberately excluded.
    pub fn fingerprint(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
            hash ^= 0xff;
            hash = hash.wrapping_mul(FNV_PRIME);
        };

        mix(self.goal.as_bytes());
        for step in &self.steps {
            mix(step.step_id.as_bytes());
            mix(step.tool_ref.name.as_bytes());
            // serde_json maps are key-sorted by default, so this is canonical.
            let input = serde_json::to_string(&step.input).unwrap_or_default();
            mix(input.as_bytes());
        }
        hash
    }
}

// ── Step results ────────────────────────────────────────────────

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed after exhausting retries.
    Failed,
    /// Never started because a dependency failed or was skipped.
    Skipped,
}

/// Structured error attached to a failed step or tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Kernel-internal error codes attached to `step.failed` / `tool.failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No tool runtime configured at execute time.
    NoRuntime,
    /// A hook plugin returned `block` for this step.
    PluginHookBlocked,
    /// The effective policy forbade the call.
    PolicyViolation,
    /// The tool's circuit breaker is open.
    CircuitBreakerOpen,
    /// Merged input failed schema validation.
    InvalidInput,
    /// Tool output failed validation.
    InvalidOutput,
    /// The permission gate denied the call.
    PermissionDenied,
    /// The tool executor raised an error.
    ExecutionError,
    /// The referenced tool is not registered.
    ToolNotFound,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoRuntime => "NO_RUNTIME",
            Self::PluginHookBlocked => "PLUGIN_HOOK_BLOCKED",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::InvalidInput => "INVALID_INPUT",
            Self::InvalidOutput => "INVALID_OUTPUT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
        };
        f.write_str(s)
    }
}

/// Terminal or in-flight record for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step this result belongs to.
    pub step_id: String,
    /// Current status.
    pub status: StepStatus,
    /// Attempts made; at least 1 once terminal.
    pub attempts: u32,
    /// Opaque output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepResult {
    /// A fresh pending result for a step.
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_owned(),
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
        }
    }
}

// ── Limits & policy ─────────────────────────────────────────────

/// Resource budgets enforced across the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Cumulative step budget across all iterations.
    pub max_steps: u32,
    /// Wall-clock budget since session creation, in milliseconds.
    pub max_duration_ms: u64,
    /// Dollar budget.
    pub max_cost_usd: f64,
    /// Token budget (input + output).
    pub max_tokens: u64,
    /// Planner iteration budget for the agentic loop.
    pub max_iterations: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 32,
            max_duration_ms: 600_000,
            max_cost_usd: 5.0,
            max_tokens: 500_000,
            max_iterations: 10,
        }
    }
}

impl Limits {
    /// Reject non-positive budgets.
    ///
    /// A zero budget would make every session fail its first limit check,
    /// so validation refuses it outright rather than clamping.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_steps == 0 {
            return Err(ValidationError::NonPositiveLimit("max_steps"));
        }
        if self.max_duration_ms == 0 {
            return Err(ValidationError::NonPositiveLimit("max_duration_ms"));
        }
        if self.max_cost_usd <= 0.0 {
            return Err(ValidationError::NonPositiveLimit("max_cost_usd"));
        }
        if self.max_tokens == 0 {
            return Err(ValidationError::NonPositiveLimit("max_tokens"));
        }
        if self.max_iterations == 0 {
            return Err(ValidationError::NonPositiveLimit("max_iterations"));
        }
        Ok(())
    }

    /// Clamp each budget to the server maximum. Never raises a value.
    pub fn clamp_to(&self, server_max: &Limits) -> Limits {
        Limits {
            max_steps: self.max_steps.min(server_max.max_steps),
            max_duration_ms: self.max_duration_ms.min(server_max.max_duration_ms),
            max_cost_usd: self.max_cost_usd.min(server_max.max_cost_usd),
            max_tokens: self.max_tokens.min(server_max.max_tokens),
            max_iterations: self.max_iterations.min(server_max.max_iterations),
        }
    }
}

/// Server-controlled execution policy. Never overridden by client input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Filesystem paths tools may touch.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Network endpoints tools may call.
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    /// Shell commands tools may spawn.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Whether write-side-effect tools require human approval.
    #[serde(default)]
    pub require_approval_for_writes: bool,
}

// ── Usage ───────────────────────────────────────────────────────

/// Token/cost metrics reported by a single tool or planner call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens produced.
    #[serde(default)]
    pub output_tokens: u64,
    /// Total tokens; derived from input + output when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    /// Direct dollar cost when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Per-1k-token pricing used when a call reports no direct cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Dollars per 1000 input tokens.
    #[serde(default)]
    pub input_cost_per_1k: f64,
    /// Dollars per 1000 output tokens.
    #[serde(default)]
    pub output_cost_per_1k: f64,
}

/// Running usage totals for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Total input tokens.
    pub input_tokens: u64,
    /// Total output tokens.
    pub output_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
    /// Total dollar cost.
    pub cost_usd: f64,
    /// Number of recorded calls.
    pub call_count: u64,
}

// ── Approvals ───────────────────────────────────────────────────

/// A decision resolving an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Allow this single call.
    AllowOnce,
    /// Allow for the rest of the session.
    AllowSession,
    /// Allow permanently.
    AllowAlways,
    /// Deny the call.
    Deny,
    /// Allow with caller-supplied constraints.
    AllowConstrained,
    /// Allow but tag for post-hoc monitoring.
    AllowObserved,
    /// Deny and suggest an alternative.
    DenyWithAlternative,
}

impl ApprovalDecision {
    /// Parse a wire-format decision string.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "allow_once" => Ok(Self::AllowOnce),
            "allow_session" => Ok(Self::AllowSession),
            "allow_always" => Ok(Self::AllowAlways),
            "deny" => Ok(Self::Deny),
            "allow_constrained" => Ok(Self::AllowConstrained),
            "allow_observed" => Ok(Self::AllowObserved),
            "deny_with_alternative" => Ok(Self::DenyWithAlternative),
            other => Err(ValidationError::InvalidDecision(other.to_owned())),
        }
    }

    /// Whether the decision permits execution.
    pub fn is_allow(self) -> bool {
        matches!(
            self,
            Self::AllowOnce
                | Self::AllowSession
                | Self::AllowAlways
                | Self::AllowConstrained
                | Self::AllowObserved
        )
    }
}

/// A pending request for human approval of a gated tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Rendezvous identifier.
    pub request_id: String,
    /// Session the request belongs to.
    pub session_id: String,
    /// Tool whose call is gated.
    pub tool: String,
    /// Reason the gate fired.
    pub reason: String,
    /// Input the tool would receive.
    pub input: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_trims_and_validates() {
        let task = Task::new("  do the thing  ", None, None).expect("valid task");
        assert_eq!(task.text, "do the thing");

        assert!(matches!(
            Task::new("   ", None, None),
            Err(ValidationError::EmptyTaskText)
        ));

        let long = "x".repeat(MAX_TASK_TEXT_CHARS + 1);
        assert!(matches!(
            Task::new(&long, None, None),
            Err(ValidationError::TaskTextTooLong)
        ));

        let by = "y".repeat(MAX_SUBMITTED_BY_CHARS + 1);
        assert!(matches!(
            Task::new("ok", None, Some(by)),
            Err(ValidationError::SubmittedByTooLong)
        ));
    }

    #[test]
    fn test_limits_clamp_never_raises() {
        let client = Limits {
            max_steps: 100,
            max_duration_ms: 10,
            max_cost_usd: 100.0,
            max_tokens: 10,
            max_iterations: 100,
        };
        let server = Limits::default();
        let clamped = client.clamp_to(&server);
        assert_eq!(clamped.max_steps, server.max_steps);
        assert_eq!(clamped.max_duration_ms, 10);
        assert!((clamped.max_cost_usd - server.max_cost_usd).abs() < f64::EPSILON);
        assert_eq!(clamped.max_tokens, 10);
        assert_eq!(clamped.max_iterations, server.max_iterations);
    }

    #[test]
    fn test_limits_validate_rejects_zero() {
        let mut limits = Limits::default();
        limits.max_steps = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_plan_fingerprint_ignores_plan_id() {
        let step = Step {
            step_id: "s1".to_owned(),
            title: "run".to_owned(),
            tool_ref: ToolRef {
                name: "echo".to_owned(),
            },
            input: serde_json::json!({"a": 1}),
            success_criteria: None,
            failure_policy: FailurePolicy::Abort,
            timeout_ms: 1000,
            max_retries: 0,
            depends_on: BTreeSet::new(),
            input_from: BTreeMap::new(),
        };
        let mut a = Plan::done("goal");
        a.steps = vec![step.clone()];
        let mut b = Plan::done("goal");
        b.steps = vec![step];
        assert_ne!(a.plan_id, b.plan_id);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = b.clone();
        c.steps[0].input = serde_json::json!({"a": 2});
        assert_ne!(b.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_mode_and_decision_parsing() {
        assert_eq!(
            ExecutionMode::parse("dry_run").expect("mode"),
            ExecutionMode::DryRun
        );
        assert!(ExecutionMode::parse("yolo").is_err());
        assert!(ApprovalDecision::parse("allow_once").expect("decision").is_allow());
        assert!(!ApprovalDecision::parse("deny").expect("decision").is_allow());
        assert!(ApprovalDecision::parse("maybe").is_err());
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::CircuitBreakerOpen).expect("serialize");
        assert_eq!(json, "\"CIRCUIT_BREAKER_OPEN\"");
        assert_eq!(ErrorCode::NoRuntime.to_string(), "NO_RUNTIME");
    }

    #[test]
    fn test_step_defaults_deserialize() {
        let step: Step = serde_json::from_str(
            r#"{"step_id":"s1","title":"t","tool_ref":{"name":"echo"}}"#,
        )
        .expect("deserialize");
        assert_eq!(step.timeout_ms, 30_000);
        assert_eq!(step.max_retries, 0);
        assert_eq!(step.failure_policy, FailurePolicy::Abort);
        assert!(step.depends_on.is_empty());
        assert!(step.input.is_object());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::AwaitingApproval.is_terminal());
    }
}
