//! Plan execution: wave-based DAG scheduling, `input_from` resolution,
//! retries with exponential backoff, and failure-policy handling.
//!
//! Ready steps (dependencies all succeeded) run concurrently; the kernel
//! joins each wave before computing the next, so a dependent never starts
//! while its dependency is in flight.

use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde_json::Value;
use tracing::warn;

use crate::journal::{
    EventBody, ObservedExecutionPayload, PolicyViolatedPayload, SessionCheckpointPayload,
    StepFailedPayload, StepStartedPayload, StepSucceededPayload, ToolCallPayload,
    UsageRecordedPayload,
};
use crate::tools::runtime::ToolCall;
use crate::types::{ErrorCode, FailurePolicy, Plan, Step, StepError, StepStatus};

use super::{dag, HookAction, Kernel, KernelError};

/// Backoff ceiling between retries.
const BACKOFF_CAP_MS: u64 = 15_000;

/// Base backoff unit.
const BACKOFF_BASE_MS: u64 = 500;

/// Maximum jitter added to each backoff.
const BACKOFF_JITTER_MS: u64 = 500;

/// Result of one execute phase.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Every runnable step finished; failures (if any) carried
    /// `continue` policy.
    Completed,
    /// A step with `replan` policy failed; the agentic loop takes over.
    Replan,
    /// The abort flag fired.
    Aborted,
    /// The phase failed the session.
    Failed(String),
    /// A futility rule fired mid-phase.
    Futile(String),
    /// A budget breach: (limit, value, threshold).
    LimitExceeded((String, f64, f64)),
}

/// Outcome of one step including its retries.
enum StepOutcome {
    Succeeded,
    Failed(StepError),
    Aborted,
}

/// Compute the retry backoff: `min(500·2^attempt, 15_000) + jitter(0..500)`.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(6)));
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base.min(BACKOFF_CAP_MS).saturating_add(jitter))
}

impl Kernel {
    /// Execute one plan to its end, a replan break, or a terminal outcome.
    pub(crate) async fn execute_plan(
        &self,
        session_id: &str,
        plan: &Plan,
    ) -> Result<ExecOutcome, KernelError> {
        if let Some(cycle) = dag::find_cycle(&plan.steps) {
            return Ok(ExecOutcome::Failed(format!(
                "plan has a dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        loop {
            if self.is_aborted() {
                return Ok(ExecOutcome::Aborted);
            }

            self.propagate_skips(plan)?;
            let ready: Vec<Step> = {
                let state = self.lock_state()?;
                dag::ready_steps(
                    &plan.steps,
                    |id| state.status_of(id) == Some(StepStatus::Pending),
                    |id| state.status_of(id) == Some(StepStatus::Succeeded),
                )
                .into_iter()
                .cloned()
                .collect()
            };
            if ready.is_empty() {
                break;
            }

            // Budget checks before any step of the wave starts.
            if let Some(breach) = self.check_budgets()? {
                return Ok(ExecOutcome::LimitExceeded(breach));
            }
            let started = self.started_steps.load(std::sync::atomic::Ordering::SeqCst);
            let wave = u32::try_from(ready.len()).unwrap_or(u32::MAX);
            let would_start = started.saturating_add(wave);
            if would_start > self.config.limits.max_steps {
                return Ok(ExecOutcome::LimitExceeded((
                    "max_steps".to_owned(),
                    f64::from(would_start),
                    f64::from(self.config.limits.max_steps),
                )));
            }

            let outcomes = join_all(
                ready
                    .iter()
                    .map(|step| self.run_step(session_id, plan, step)),
            )
            .await;

            let mut first_failure: Option<(FailurePolicy, StepError)> = None;
            for (step, outcome) in ready.iter().zip(outcomes) {
                match outcome? {
                    StepOutcome::Aborted => return Ok(ExecOutcome::Aborted),
                    StepOutcome::Succeeded => {
                        self.lock_futility()?.record_success();
                    }
                    StepOutcome::Failed(error) => {
                        if error.code == ErrorCode::NoRuntime {
                            return Ok(ExecOutcome::Failed(
                                "no tool runtime configured".to_owned(),
                            ));
                        }
                        if let Some(reason) =
                            self.lock_futility()?.record_error(&error.code.to_string())
                        {
                            return Ok(ExecOutcome::Futile(reason));
                        }
                        if first_failure.is_none() {
                            first_failure = Some((step.failure_policy, error));
                        }
                    }
                }
            }

            // Budget re-check after the wave completes.
            if let Some(breach) = self.check_budgets()? {
                return Ok(ExecOutcome::LimitExceeded(breach));
            }

            if let Some((policy, error)) = first_failure {
                match policy {
                    FailurePolicy::Continue => {}
                    FailurePolicy::Replan if self.config.agentic => {
                        return Ok(ExecOutcome::Replan);
                    }
                    FailurePolicy::Replan | FailurePolicy::Abort => {
                        return Ok(ExecOutcome::Failed(format!(
                            "step failed: {}",
                            error.message
                        )));
                    }
                }
            }
        }

        Ok(ExecOutcome::Completed)
    }

    /// Mark steps whose dependencies failed or were skipped (or are
    /// unknown) as skipped, to a fixpoint.
    fn propagate_skips(&self, plan: &Plan) -> Result<(), KernelError> {
        let mut state = self.lock_state()?;
        loop {
            let mut to_skip: Vec<String> = Vec::new();
            for step in &plan.steps {
                if state.status_of(&step.step_id) != Some(StepStatus::Pending) {
                    continue;
                }
                let blocked = step.depends_on.iter().any(|dep| {
                    matches!(
                        state.status_of(dep),
                        Some(StepStatus::Failed) | Some(StepStatus::Skipped) | None
                    )
                });
                if blocked {
                    to_skip.push(step.step_id.clone());
                }
            }
            if to_skip.is_empty() {
                return Ok(());
            }
            for id in to_skip {
                state.record_skipped(&id);
            }
        }
    }

    // ── Single-step execution ───────────────────────────────────

    async fn run_step(
        &self,
        session_id: &str,
        plan: &Plan,
        step: &Step,
    ) -> Result<StepOutcome, KernelError> {
        self.started_steps
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.lock_state()?.record_started(&step.step_id);
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::StepStarted(StepStartedPayload {
                    step_id: step.step_id.clone(),
                    plan_id: plan.plan_id.clone(),
                    tool: step.tool_ref.name.clone(),
                }),
            )
            .await?;

        if let Some(hooks) = &self.deps.hooks {
            if let HookAction::Block { reason } = hooks.before_step(session_id, step).await {
                let error = StepError {
                    code: ErrorCode::PluginHookBlocked,
                    message: format!("blocked by hook: {reason}"),
                };
                return self.fail_step(session_id, step, 1, error).await;
            }
        }

        let resolved_input = {
            let state = self.lock_state()?;
            let result = resolve_input(&state, step);
            drop(state);
            result
        };
        let merged_input = match resolved_input {
            Ok(input) => input,
            Err(error) => return self.fail_step(session_id, step, 1, error).await,
        };

        let Some(runtime) = self.deps.runtime.clone() else {
            let error = StepError {
                code: ErrorCode::NoRuntime,
                message: "no tool runtime configured".to_owned(),
            };
            return self.fail_step(session_id, step, 1, error).await;
        };

        let mut attempt: u32 = 0;
        loop {
            let attempt_number = attempt.saturating_add(1);
            if attempt > 0 {
                self.lock_state()?.record_retry(&step.step_id);
                if self.backoff_sleep(attempt.saturating_sub(1)).await {
                    return Ok(StepOutcome::Aborted);
                }
            }
            if self.is_aborted() {
                return Ok(StepOutcome::Aborted);
            }

            self.deps
                .journal
                .emit(
                    session_id,
                    EventBody::ToolStarted(ToolCallPayload {
                        tool: step.tool_ref.name.clone(),
                        step_id: step.step_id.clone(),
                        attempt: attempt_number,
                        error: None,
                    }),
                )
                .await?;

            let call = ToolCall {
                session_id: session_id.to_owned(),
                step_id: step.step_id.clone(),
                tool: step.tool_ref.name.clone(),
                input: merged_input.clone(),
                mode: self.config.mode,
                policy: self.config.policy.clone(),
                timeout: Duration::from_millis(step.timeout_ms),
            };

            // Dropping the invoke future on abort is the runtime's
            // cancellation contract.
            let invoked = tokio::select! {
                result = runtime.invoke(call) => result,
                () = self.abort_notify.notified() => return Ok(StepOutcome::Aborted),
            };

            match invoked {
                Ok(invocation) => {
                    self.deps
                        .journal
                        .emit(
                            session_id,
                            EventBody::ToolSucceeded(ToolCallPayload {
                                tool: step.tool_ref.name.clone(),
                                step_id: step.step_id.clone(),
                                attempt: attempt_number,
                                error: None,
                            }),
                        )
                        .await?;
                    if invocation.observed {
                        self.deps
                            .journal
                            .emit(
                                session_id,
                                EventBody::ObservedExecution(ObservedExecutionPayload {
                                    tool: step.tool_ref.name.clone(),
                                    step_id: step.step_id.clone(),
                                }),
                            )
                            .await?;
                    }
                    if let Some(usage) = &invocation.usage {
                        let (resolved, summary) = {
                            let mut acc = self.lock_usage()?;
                            let resolved = acc.record(usage);
                            (resolved, acc.summary())
                        };
                        self.deps
                            .journal
                            .emit(
                                session_id,
                                EventBody::UsageRecorded(UsageRecordedPayload {
                                    usage: resolved,
                                    summary,
                                }),
                            )
                            .await?;
                    }

                    let completed_step_ids = {
                        let mut state = self.lock_state()?;
                        state.record_succeeded(&step.step_id, invocation.output.clone());
                        state.completed_step_ids()
                    };
                    self.deps
                        .journal
                        .emit(
                            session_id,
                            EventBody::StepSucceeded(StepSucceededPayload {
                                step_id: step.step_id.clone(),
                                attempts: attempt_number,
                                output: invocation.output,
                            }),
                        )
                        .await?;
                    self.deps
                        .journal
                        .emit(
                            session_id,
                            EventBody::SessionCheckpoint(SessionCheckpointPayload {
                                completed_step_ids,
                            }),
                        )
                        .await?;
                    return Ok(StepOutcome::Succeeded);
                }
                Err(call_error) => {
                    let error = StepError {
                        code: call_error.code,
                        message: call_error.message.clone(),
                    };
                    self.deps
                        .journal
                        .emit(
                            session_id,
                            EventBody::ToolFailed(ToolCallPayload {
                                tool: step.tool_ref.name.clone(),
                                step_id: step.step_id.clone(),
                                attempt: attempt_number,
                                error: Some(error.clone()),
                            }),
                        )
                        .await?;
                    warn!(
                        session_id,
                        step_id = %step.step_id,
                        code = %error.code,
                        attempt = attempt_number,
                        "tool call failed"
                    );
                    if call_error.retriable && attempt < step.max_retries {
                        attempt = attempt_number;
                        continue;
                    }
                    return self
                        .fail_step(session_id, step, attempt_number, error)
                        .await;
                }
            }
        }
    }

    async fn fail_step(
        &self,
        session_id: &str,
        step: &Step,
        attempts: u32,
        error: StepError,
    ) -> Result<StepOutcome, KernelError> {
        if error.code == ErrorCode::PolicyViolation {
            self.deps
                .journal
                .emit(
                    session_id,
                    EventBody::PolicyViolated(PolicyViolatedPayload {
                        tool: step.tool_ref.name.clone(),
                        reason: error.message.clone(),
                    }),
                )
                .await?;
        }
        self.lock_state()?
            .record_failed(&step.step_id, error.clone());
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::StepFailed(StepFailedPayload {
                    step_id: step.step_id.clone(),
                    attempts,
                    error: error.clone(),
                }),
            )
            .await?;
        Ok(StepOutcome::Failed(error))
    }
}

// ── Input resolution ────────────────────────────────────────────

/// Resolve `input_from` bindings over prior step outputs and shallow-merge
/// them over the step's static input.
fn resolve_input(state: &super::TaskState, step: &Step) -> Result<Value, StepError> {
    let mut merged = match &step.input {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (field, binding) in &step.input_from {
        let (source, path) = match binding.split_once('.') {
            Some((source, path)) => (source, Some(path)),
            None => (binding.as_str(), None),
        };
        let output = state.output_of(source).ok_or_else(|| StepError {
            code: ErrorCode::InvalidInput,
            message: format!("input_from references step without output: {source}"),
        })?;
        let value = match path {
            None => output.clone(),
            Some(path) => walk_path(output, path).cloned().ok_or_else(|| StepError {
                code: ErrorCode::InvalidInput,
                message: format!("input_from path not found: {binding}"),
            })?,
        };
        merged.insert(field.clone(), value);
    }
    Ok(Value::Object(merged))
}

/// Walk a dotted path through objects and arrays.
fn walk_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(arr) => arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolRef;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_backoff_delay_bounds() {
        for attempt in 0..10u32 {
            let delay = backoff_delay(attempt).as_millis();
            let base = u128::from(
                BACKOFF_BASE_MS
                    .saturating_mul(2u64.saturating_pow(attempt.min(6)))
                    .min(BACKOFF_CAP_MS),
            );
            assert!(delay >= base);
            assert!(delay < base.saturating_add(u128::from(BACKOFF_JITTER_MS)));
        }
    }

    #[test]
    fn test_walk_path_objects_and_arrays() {
        let value = serde_json::json!({"a": {"b": [{"c": 42}]}});
        assert_eq!(walk_path(&value, "a.b.0.c"), Some(&serde_json::json!(42)));
        assert!(walk_path(&value, "a.b.1").is_none());
        assert!(walk_path(&value, "a.x").is_none());
    }

    #[test]
    fn test_resolve_input_merges_bindings_over_static() {
        let mut state = super::super::TaskState::new();
        let mut plan = Plan::done("g");
        plan.steps = vec![step_with("src", BTreeMap::new())];
        state.set_plan(plan);
        state.record_started("src");
        state.record_succeeded("src", serde_json::json!({"url": "https://x", "meta": {"n": 1}}));

        let mut bindings = BTreeMap::new();
        bindings.insert("url".to_owned(), "src.url".to_owned());
        bindings.insert("count".to_owned(), "src.meta.n".to_owned());
        let mut step = step_with("dst", bindings);
        step.input = serde_json::json!({"url": "will-be-overridden", "keep": true});

        let merged = resolve_input(&state, &step).expect("resolve");
        assert_eq!(merged["url"], "https://x");
        assert_eq!(merged["count"], 1);
        assert_eq!(merged["keep"], true);
    }

    #[test]
    fn test_resolve_input_missing_source_fails() {
        let state = super::super::TaskState::new();
        let mut bindings = BTreeMap::new();
        bindings.insert("x".to_owned(), "ghost.value".to_owned());
        let step = step_with("dst", bindings);
        let err = resolve_input(&state, &step).expect_err("should fail");
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    fn step_with(id: &str, input_from: BTreeMap<String, String>) -> Step {
        Step {
            step_id: id.to_owned(),
            title: id.to_owned(),
            tool_ref: ToolRef {
                name: "echo".to_owned(),
            },
            input: serde_json::json!({}),
            success_criteria: None,
            failure_policy: FailurePolicy::Abort,
            timeout_ms: 1000,
            max_retries: 0,
            depends_on: BTreeSet::new(),
            input_from,
        }
    }
}
