//! In-memory task state: current plan plus per-step results.
//!
//! Mutated only by the kernel. Step ids are stable across replans, so
//! results and titles accumulate over the whole agentic session and feed
//! the planner's state snapshot on later iterations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Plan, StepError, StepResult, StepStatus};

/// Plan handoff snapshot for the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Whether a plan has been accepted in this session.
    pub has_plan: bool,
    /// Step results keyed by step id, across all iterations.
    pub step_results: BTreeMap<String, StepResult>,
    /// Step titles keyed by step id, across all iterations.
    pub step_titles: BTreeMap<String, String>,
    /// Number of steps that have succeeded so far.
    pub completed_steps: u32,
}

/// Current plan and cumulative step results for one session.
#[derive(Debug, Default)]
pub struct TaskState {
    plan: Option<Plan>,
    results: BTreeMap<String, StepResult>,
    titles: BTreeMap<String, String>,
}

impl TaskState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a plan, seeding pending results for steps not seen before.
    ///
    /// Results of steps reused from earlier plans are kept as-is, so a
    /// replan never re-executes an already-succeeded step.
    pub fn set_plan(&mut self, plan: Plan) {
        for step in &plan.steps {
            self.titles
                .insert(step.step_id.clone(), step.title.clone());
            self.results
                .entry(step.step_id.clone())
                .or_insert_with(|| StepResult::pending(&step.step_id));
        }
        self.plan = Some(plan);
    }

    /// The currently installed plan.
    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Mark a step as running and count the attempt.
    pub fn record_started(&mut self, step_id: &str) {
        let entry = self
            .results
            .entry(step_id.to_owned())
            .or_insert_with(|| StepResult::pending(step_id));
        entry.status = StepStatus::Running;
        entry.attempts = entry.attempts.saturating_add(1);
    }

    /// Record an additional attempt on a running step.
    pub fn record_retry(&mut self, step_id: &str) {
        if let Some(entry) = self.results.get_mut(step_id) {
            entry.attempts = entry.attempts.saturating_add(1);
        }
    }

    /// Record a successful step with its output.
    pub fn record_succeeded(&mut self, step_id: &str, output: serde_json::Value) {
        if let Some(entry) = self.results.get_mut(step_id) {
            entry.status = StepStatus::Succeeded;
            entry.output = Some(output);
            entry.error = None;
        }
    }

    /// Record a failed step with its error.
    pub fn record_failed(&mut self, step_id: &str, error: StepError) {
        if let Some(entry) = self.results.get_mut(step_id) {
            entry.status = StepStatus::Failed;
            entry.error = Some(error);
        }
    }

    /// Mark a step skipped because a dependency failed or was skipped.
    pub fn record_skipped(&mut self, step_id: &str) {
        if let Some(entry) = self.results.get_mut(step_id) {
            entry.status = StepStatus::Skipped;
        }
    }

    /// Install a recovered result verbatim (journal recovery).
    pub fn restore_result(&mut self, result: StepResult) {
        self.results.insert(result.step_id.clone(), result);
    }

    /// Status of a step, if known.
    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.results.get(step_id).map(|r| r.status)
    }

    /// Output of a succeeded step, if any.
    pub fn output_of(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.results
            .get(step_id)
            .filter(|r| r.status == StepStatus::Succeeded)
            .and_then(|r| r.output.as_ref())
    }

    /// All step results keyed by id.
    pub fn all_results(&self) -> &BTreeMap<String, StepResult> {
        &self.results
    }

    /// Ids of all succeeded steps, sorted.
    pub fn completed_step_ids(&self) -> Vec<String> {
        self.results
            .values()
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// Number of succeeded steps.
    pub fn completed_count(&self) -> u32 {
        u32::try_from(
            self.results
                .values()
                .filter(|r| r.status == StepStatus::Succeeded)
                .count(),
        )
        .unwrap_or(u32::MAX)
    }

    /// Snapshot for the planner handoff.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            has_plan: self.plan.is_some(),
            step_results: self.results.clone(),
            step_titles: self.titles.clone(),
            completed_steps: self.completed_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorCode, Step, ToolRef};
    use std::collections::BTreeSet;

    fn step(id: &str) -> Step {
        Step {
            step_id: id.to_owned(),
            title: format!("step {id}"),
            tool_ref: ToolRef {
                name: "echo".to_owned(),
            },
            input: serde_json::json!({}),
            success_criteria: None,
            failure_policy: Default::default(),
            timeout_ms: 1000,
            max_retries: 0,
            depends_on: BTreeSet::new(),
            input_from: BTreeMap::new(),
        }
    }

    fn plan_with(ids: &[&str]) -> Plan {
        let mut plan = Plan::done("goal");
        plan.steps = ids.iter().map(|id| step(id)).collect();
        plan
    }

    #[test]
    fn test_set_plan_seeds_pending_results() {
        let mut state = TaskState::new();
        state.set_plan(plan_with(&["a", "b"]));
        assert_eq!(state.status_of("a"), Some(StepStatus::Pending));
        assert_eq!(state.status_of("b"), Some(StepStatus::Pending));
        assert_eq!(state.completed_count(), 0);
    }

    #[test]
    fn test_replan_preserves_prior_results() {
        let mut state = TaskState::new();
        state.set_plan(plan_with(&["a"]));
        state.record_started("a");
        state.record_succeeded("a", serde_json::json!({"out": 1}));

        // Replan reuses "a" and adds "b" — "a" must stay succeeded.
        state.set_plan(plan_with(&["a", "b"]));
        assert_eq!(state.status_of("a"), Some(StepStatus::Succeeded));
        assert_eq!(state.status_of("b"), Some(StepStatus::Pending));
        assert_eq!(state.completed_step_ids(), vec!["a"]);
    }

    #[test]
    fn test_attempt_counting() {
        let mut state = TaskState::new();
        state.set_plan(plan_with(&["a"]));
        state.record_started("a");
        state.record_retry("a");
        state.record_failed(
            "a",
            StepError {
                code: ErrorCode::ExecutionError,
                message: "boom".to_owned(),
            },
        );
        let result = state.all_results().get("a").expect("result");
        assert_eq!(result.attempts, 2);
        assert_eq!(result.status, StepStatus::Failed);
    }

    #[test]
    fn test_snapshot_contents() {
        let mut state = TaskState::new();
        state.set_plan(plan_with(&["a", "b"]));
        state.record_started("a");
        state.record_succeeded("a", serde_json::json!({"n": 42}));
        let snapshot = state.snapshot();
        assert!(snapshot.has_plan);
        assert_eq!(snapshot.completed_steps, 1);
        assert_eq!(snapshot.step_titles.get("b"), Some(&"step b".to_owned()));
        assert_eq!(
            snapshot.step_results.get("a").map(|r| r.status),
            Some(StepStatus::Succeeded)
        );
    }

    #[test]
    fn test_output_of_only_for_succeeded() {
        let mut state = TaskState::new();
        state.set_plan(plan_with(&["a"]));
        state.record_started("a");
        assert!(state.output_of("a").is_none());
        state.record_succeeded("a", serde_json::json!({"x": true}));
        assert_eq!(state.output_of("a"), Some(&serde_json::json!({"x": true})));
    }
}
