//! Pluggable planner contract and the state snapshot it receives.
//!
//! Concrete planners (LLM-backed or otherwise) live outside the kernel;
//! the kernel owns retry, timeout, and critic gating around the call. A
//! scripted planner ships here for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::ToolSpec;
use crate::types::{Limits, Plan, Task};

use super::state::StateSnapshot;

/// Planner failure surfaced after the kernel's retry budget is spent.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// The planner could not produce a plan.
    #[error("planner failed: {0}")]
    Failed(String),
}

/// State handed to the planner on each invocation.
///
/// Iteration 1 carries only the optional task domain; later iterations
/// additionally carry step results, step titles, and — when an active
/// memory store is configured — memories recalled for the task text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerSnapshot {
    /// 1-based agentic iteration.
    pub iteration: u32,
    /// Accumulated execution state.
    #[serde(flatten)]
    pub state: StateSnapshot,
    /// Memories recalled for this task, newest first.
    #[serde(default)]
    pub relevant_memories: Vec<String>,
    /// Optional task domain hint (first iteration only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_domain: Option<String>,
}

/// One planner invocation.
#[derive(Debug, Clone)]
pub struct PlannerRequest {
    /// The task being worked on.
    pub task: Task,
    /// Schemas of every registered tool.
    pub tools: Vec<ToolSpec>,
    /// Execution state snapshot.
    pub snapshot: PlannerSnapshot,
    /// Session limits, so planners can size plans to the budget.
    pub limits: Limits,
}

/// Produces step plans for tasks. A plan with zero steps is the done
/// signal that concludes the agentic loop.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce the next plan for the task given accumulated state.
    async fn plan(&self, request: PlannerRequest) -> Result<Plan, PlannerError>;
}

// ── Scripted planner ────────────────────────────────────────────

/// Outcome queued into a [`ScriptedPlanner`].
pub type ScriptedOutcome = Result<Plan, String>;

/// Planner that replays a fixed sequence of outcomes.
///
/// Once the script is exhausted it returns an empty plan (the done
/// signal), so a session driven by it always concludes.
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    /// Goal used for the trailing done plan.
    done_goal: String,
}

impl ScriptedPlanner {
    /// Create a planner replaying `outcomes` in order.
    pub fn new(outcomes: Vec<ScriptedOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            done_goal: "done".to_owned(),
        }
    }

    /// Planner that immediately signals done.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _request: PlannerRequest) -> Result<Plan, PlannerError> {
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        match next {
            Some(Ok(plan)) => Ok(plan),
            Some(Err(message)) => Err(PlannerError::Failed(message)),
            None => Ok(Plan::done(&self.done_goal)),
        }
    }
}

// ── Keyword planner ─────────────────────────────────────────────

/// Offline fallback planner for daemons with no LLM planner wired in.
///
/// Iteration 1 plans a single step against the first registered tool
/// whose name appears in the task text (or the only registered tool);
/// iteration 2 signals done. Anything smarter belongs to an external
/// planner implementation.
pub struct KeywordPlanner;

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, request: PlannerRequest) -> Result<Plan, PlannerError> {
        if request.snapshot.iteration > 1 {
            return Ok(Plan::done(&request.task.text));
        }
        let lowered = request.task.text.to_lowercase();
        let tool = request
            .tools
            .iter()
            .find(|t| lowered.contains(&t.name.to_lowercase()))
            .or_else(|| {
                if request.tools.len() == 1 {
                    request.tools.first()
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                PlannerError::Failed("no registered tool matches the task".to_owned())
            })?;

        let mut plan = Plan::done(&request.task.text);
        plan.steps = vec![crate::types::Step {
            step_id: "step-1".to_owned(),
            title: format!("run {}", tool.name),
            tool_ref: crate::types::ToolRef {
                name: tool.name.clone(),
            },
            input: serde_json::json!({}),
            success_criteria: None,
            failure_policy: crate::types::FailurePolicy::Abort,
            timeout_ms: 30_000,
            max_retries: 0,
            depends_on: Default::default(),
            input_from: Default::default(),
        }];
        Ok(plan)
    }
}
