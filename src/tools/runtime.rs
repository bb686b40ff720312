//! Validated tool execution: schema checks, timeout, circuit breaker,
//! permission gate, and mode dispatch (mock / dry-run / live).
//!
//! The kernel talks to the runtime through the [`ToolRuntime`] trait and
//! wraps every invocation in `tool.started` / `tool.succeeded` /
//! `tool.failed` journal events; the runtime itself stays journal-free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{ApprovalDecision, ApprovalRequest, ErrorCode, ExecutionMode, Policy, Usage};

use super::breaker::CircuitBreaker;
use super::{SideEffects, ToolRegistry, ToolSpec};

// ── Call contract ───────────────────────────────────────────────

/// One tool invocation request from the kernel.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Session issuing the call.
    pub session_id: String,
    /// Step driving the call.
    pub step_id: String,
    /// Registered tool name.
    pub tool: String,
    /// Merged input (static `input` + resolved `input_from` bindings).
    pub input: serde_json::Value,
    /// Session execution mode.
    pub mode: ExecutionMode,
    /// Effective server-controlled policy.
    pub policy: Policy,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

/// Successful invocation result.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Opaque tool output.
    pub output: serde_json::Value,
    /// Token/cost metrics, when the tool reports them.
    pub usage: Option<Usage>,
    /// Whether the call was allowed under observation
    /// (`allow_observed`).
    pub observed: bool,
}

/// Structured invocation failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolCallError {
    /// Machine-readable code attached to `tool.failed` / `step.failed`.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether a retry might succeed (drives breaker counting and step
    /// retries).
    pub retriable: bool,
}

impl ToolCallError {
    fn new(code: ErrorCode, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retriable,
        }
    }
}

/// Output of a live executor call.
#[derive(Debug, Clone)]
pub struct ExecutorOutput {
    /// Tool output.
    pub output: serde_json::Value,
    /// Metrics, when known.
    pub usage: Option<Usage>,
}

/// Live-mode dispatch target for registered tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute a tool with validated input.
    async fn execute(
        &self,
        spec: &ToolSpec,
        input: serde_json::Value,
    ) -> Result<ExecutorOutput, ToolCallError>;
}

/// Human-approval gate consulted for write-side-effect tools.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Ask for a decision; implementations may block on a human.
    async fn request(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Fixed-decision gate for tests and headless runs.
#[derive(Debug, Clone, Copy)]
pub struct StaticGate {
    /// The decision returned for every request.
    pub decision: ApprovalDecision,
}

#[async_trait]
impl PermissionGate for StaticGate {
    async fn request(&self, _request: ApprovalRequest) -> ApprovalDecision {
        self.decision
    }
}

/// Validated tool execution surface the kernel depends on.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    /// Execute one validated call end to end.
    async fn invoke(&self, call: ToolCall) -> Result<ToolInvocation, ToolCallError>;
}

// ── Local runtime ───────────────────────────────────────────────

/// In-process runtime: registry lookup, breaker, schema validation,
/// approval gate, and mode dispatch.
pub struct LocalRuntime {
    registry: Arc<ToolRegistry>,
    breaker: CircuitBreaker,
    gate: Option<Arc<dyn PermissionGate>>,
    executor: Option<Arc<dyn ToolExecutor>>,
    mock_cursors: Mutex<HashMap<String, usize>>,
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("tools", &self.registry.count())
            .field("has_gate", &self.gate.is_some())
            .field("has_executor", &self.executor.is_some())
            .finish()
    }
}

impl LocalRuntime {
    /// Create a runtime over a registry with neither gate nor live
    /// executor.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            breaker: CircuitBreaker::new(),
            gate: None,
            executor: None,
            mock_cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a permission gate.
    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Attach a live-mode executor.
    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    fn next_mock_response(&self, spec: &ToolSpec) -> serde_json::Value {
        if spec.mock_responses.is_empty() {
            return serde_json::json!({});
        }
        let mut cursors = match self.mock_cursors.lock() {
            Ok(c) => c,
            Err(_) => return spec.mock_responses[0].clone(),
        };
        let cursor = cursors.entry(spec.name.clone()).or_insert(0);
        let index = cursor.checked_rem(spec.mock_responses.len()).unwrap_or(0);
        *cursor = cursor.wrapping_add(1);
        spec.mock_responses[index].clone()
    }

    fn validate_input(spec: &ToolSpec, input: &serde_json::Value) -> Result<(), ToolCallError> {
        let object = input.as_object().ok_or_else(|| {
            ToolCallError::new(ErrorCode::InvalidInput, "input must be an object", false)
        })?;
        for field in spec.required_inputs() {
            if !object.contains_key(&field) {
                return Err(ToolCallError::new(
                    ErrorCode::InvalidInput,
                    format!("missing required input field: {field}"),
                    false,
                ));
            }
        }
        Ok(())
    }

    fn validate_output(spec: &ToolSpec, output: &serde_json::Value) -> Result<(), ToolCallError> {
        let required = spec.required_outputs();
        if required.is_empty() {
            return Ok(());
        }
        let object = output.as_object().ok_or_else(|| {
            ToolCallError::new(ErrorCode::InvalidOutput, "output must be an object", true)
        })?;
        for field in &required {
            if !object.contains_key(field) {
                return Err(ToolCallError::new(
                    ErrorCode::InvalidOutput,
                    format!("missing required output field: {field}"),
                    true,
                ));
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        spec: &ToolSpec,
        call: &ToolCall,
    ) -> Result<ExecutorOutput, ToolCallError> {
        match call.mode {
            ExecutionMode::Mock => Ok(ExecutorOutput {
                output: self.next_mock_response(spec),
                usage: None,
            }),
            ExecutionMode::DryRun => Ok(ExecutorOutput {
                output: serde_json::json!({
                    "dry_run": true,
                    "tool": spec.name,
                    "input": call.input,
                }),
                usage: None,
            }),
            ExecutionMode::Live => match &self.executor {
                Some(executor) => executor.execute(spec, call.input.clone()).await,
                None => Err(ToolCallError::new(
                    ErrorCode::ExecutionError,
                    "no live executor registered",
                    false,
                )),
            },
        }
    }
}

#[async_trait]
impl ToolRuntime for LocalRuntime {
    async fn invoke(&self, call: ToolCall) -> Result<ToolInvocation, ToolCallError> {
        let spec = self.registry.get(&call.tool).ok_or_else(|| {
            ToolCallError::new(
                ErrorCode::ToolNotFound,
                format!("unknown tool: {}", call.tool),
                false,
            )
        })?;

        if self.breaker.is_open(&spec.name, spec.category) {
            return Err(ToolCallError::new(
                ErrorCode::CircuitBreakerOpen,
                format!("circuit open for tool: {}", spec.name),
                true,
            ));
        }

        Self::validate_input(&spec, &call.input)?;

        // Approval gate for write tools under a gating policy.
        let mut observed = false;
        if spec.side_effects == SideEffects::Write && call.policy.require_approval_for_writes {
            let decision = match &self.gate {
                Some(gate) => {
                    gate.request(ApprovalRequest {
                        request_id: uuid::Uuid::new_v4().to_string(),
                        session_id: call.session_id.clone(),
                        tool: spec.name.clone(),
                        reason: "write requires approval".to_owned(),
                        input: call.input.clone(),
                    })
                    .await
                }
                None => ApprovalDecision::Deny,
            };
            if !decision.is_allow() {
                return Err(ToolCallError::new(
                    ErrorCode::PermissionDenied,
                    format!("approval denied for tool: {}", spec.name),
                    false,
                ));
            }
            observed = decision == ApprovalDecision::AllowObserved;
        }

        let result = tokio::time::timeout(call.timeout, self.dispatch(&spec, &call)).await;
        let outcome = match result {
            Err(_) => Err(ToolCallError::new(
                ErrorCode::ExecutionError,
                format!("tool timed out after {} ms", call.timeout.as_millis()),
                true,
            )),
            Ok(Err(e)) => Err(e),
            Ok(Ok(out)) => Self::validate_output(&spec, &out.output).map(|()| out),
        };

        match outcome {
            Ok(out) => {
                self.breaker.record_success(&spec.name);
                Ok(ToolInvocation {
                    output: out.output,
                    usage: out.usage,
                    observed,
                })
            }
            Err(e) => {
                self.breaker
                    .record_failure(&spec.name, spec.category, e.retriable);
                Err(e)
            }
        }
    }
}
