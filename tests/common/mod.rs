//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use karnevil9::journal::{Event, Journal, MemoryJournal};
use karnevil9::kernel::{
    Kernel, KernelConfig, KernelDeps, Planner, PlannerError, PlannerRequest, ScriptedPlanner,
};
use karnevil9::tools::{
    ExecutorOutput, LocalRuntime, ToolCallError, ToolExecutor, ToolRegistry, ToolSpec,
};
use karnevil9::types::{
    ErrorCode, ExecutionMode, FailurePolicy, Limits, Plan, Step, Task, ToolRef, Usage,
};

/// A mock tool serving one canned response.
pub fn mock_tool(name: &str, response: serde_json::Value) -> ToolSpec {
    let mut spec = ToolSpec::new(name, &format!("{name} (mock)"));
    spec.mock_responses = vec![response];
    spec
}

/// A bare step invoking `tool`.
pub fn step(step_id: &str, tool: &str) -> Step {
    Step {
        step_id: step_id.to_owned(),
        title: format!("run {tool}"),
        tool_ref: ToolRef {
            name: tool.to_owned(),
        },
        input: serde_json::json!({}),
        success_criteria: None,
        failure_policy: FailurePolicy::Abort,
        timeout_ms: 5_000,
        max_retries: 0,
        depends_on: Default::default(),
        input_from: BTreeMap::new(),
    }
}

/// A plan over the given steps.
pub fn plan(steps: Vec<Step>) -> Plan {
    let mut plan = Plan::done("test goal");
    plan.steps = steps;
    plan
}

/// A task with the given text.
pub fn task(text: &str) -> Task {
    Task::new(text, None, None).expect("valid task")
}

/// Event type tags of a journal trail in order.
pub async fn event_types(journal: &dyn Journal, session_id: &str) -> Vec<String> {
    journal
        .read_session(session_id, 0, usize::MAX)
        .await
        .expect("read journal")
        .iter()
        .map(|e| e.event_type.clone())
        .collect()
}

/// Assert that `expected` occurs as an in-order subsequence of `actual`.
pub fn assert_subsequence(actual: &[String], expected: &[&str]) {
    let mut cursor = actual.iter();
    for want in expected {
        assert!(
            cursor.any(|got| got == want),
            "expected {want:?} (in order) within {actual:?}"
        );
    }
}

/// Find the first event of a type in a trail.
pub async fn find_event(journal: &dyn Journal, session_id: &str, event_type: &str) -> Option<Event> {
    journal
        .read_session(session_id, 0, usize::MAX)
        .await
        .expect("read journal")
        .into_iter()
        .find(|e| e.event_type == event_type)
}

/// Planner that sleeps before answering; for re-entrancy and abort tests.
pub struct SlowPlanner {
    pub delay: Duration,
    pub inner: ScriptedPlanner,
}

#[async_trait]
impl Planner for SlowPlanner {
    async fn plan(&self, request: PlannerRequest) -> Result<Plan, PlannerError> {
        tokio::time::sleep(self.delay).await;
        self.inner.plan(request).await
    }
}

/// Live executor that records every input it receives.
pub struct CapturingExecutor {
    pub calls: Mutex<Vec<(String, serde_json::Value)>>,
    pub output: serde_json::Value,
    pub usage: Option<Usage>,
    /// Tools whose calls should fail with `EXECUTION_ERROR`.
    pub fail_tools: Vec<String>,
}

impl CapturingExecutor {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            output,
            usage: None,
            fail_tools: Vec::new(),
        }
    }

    pub fn inputs_for(&self, tool: &str) -> Vec<serde_json::Value> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, input)| input.clone())
            .collect()
    }
}

#[async_trait]
impl ToolExecutor for CapturingExecutor {
    async fn execute(
        &self,
        spec: &ToolSpec,
        input: serde_json::Value,
    ) -> Result<ExecutorOutput, ToolCallError> {
        self.calls
            .lock()
            .expect("lock")
            .push((spec.name.clone(), input));
        if self.fail_tools.contains(&spec.name) {
            return Err(ToolCallError {
                code: ErrorCode::ExecutionError,
                message: format!("{} is wired to fail", spec.name),
                retriable: true,
            });
        }
        Ok(ExecutorOutput {
            output: self.output.clone(),
            usage: self.usage.clone(),
        })
    }
}

/// Everything a kernel test needs in one bundle.
pub struct KernelFixture {
    pub journal: Arc<MemoryJournal>,
    pub registry: Arc<ToolRegistry>,
    pub kernel: Arc<Kernel>,
}

/// Build a kernel over a memory journal and a mock-mode runtime.
pub fn kernel_fixture(
    tools: Vec<ToolSpec>,
    planner: Arc<dyn Planner>,
    configure: impl FnOnce(&mut KernelConfig),
) -> KernelFixture {
    kernel_fixture_with_runtime(tools, planner, configure, None)
}

/// [`kernel_fixture`] with a live executor attached (mode stays whatever
/// `configure` sets; default mock).
pub fn kernel_fixture_with_runtime(
    tools: Vec<ToolSpec>,
    planner: Arc<dyn Planner>,
    configure: impl FnOnce(&mut KernelConfig),
    executor: Option<Arc<dyn ToolExecutor>>,
) -> KernelFixture {
    let journal = Arc::new(MemoryJournal::new());
    let registry = Arc::new(ToolRegistry::new());
    for tool in tools {
        registry.register(tool);
    }

    let mut runtime = LocalRuntime::new(Arc::clone(&registry));
    if let Some(executor) = executor {
        runtime = runtime.with_executor(executor);
    }

    let mut config = KernelConfig {
        mode: ExecutionMode::Mock,
        limits: Limits::default(),
        planner_retries: 0,
        planner_timeout: Duration::from_secs(5),
        ..KernelConfig::default()
    };
    configure(&mut config);

    let deps = KernelDeps {
        journal: Arc::clone(&journal) as Arc<dyn Journal>,
        registry: Arc::clone(&registry),
        planner,
        runtime: Some(Arc::new(runtime)),
        memory: None,
        hooks: None,
        approval_wait: None,
    };
    KernelFixture {
        kernel: Arc::new(Kernel::new(deps, config)),
        journal,
        registry,
    }
}
