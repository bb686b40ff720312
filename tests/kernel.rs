//! Kernel integration tests: full sessions over a memory journal with a
//! mock-mode runtime and scripted planners.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use karnevil9::journal::{EventBody, Journal, MemoryJournal};
use karnevil9::kernel::{
    Kernel, KernelConfig, KernelDeps, KernelError, ScriptedPlanner,
};
use karnevil9::tools::{LocalRuntime, ToolRegistry, ToolSpec};
use karnevil9::types::{
    ErrorCode, FailurePolicy, SessionStatus, StepStatus, Usage,
};

// ── Happy path ──────────────────────────────────────────────────

#[tokio::test]
async fn test_happy_mock_session_event_trail() {
    let tool = mock_tool("test-tool", serde_json::json!({"echo": "mock echo"}));
    let the_plan = plan(vec![step("s1", "test-tool")]);
    let fixture = kernel_fixture(
        vec![tool],
        Arc::new(ScriptedPlanner::new(vec![Ok(the_plan)])),
        |_| {},
    );

    fixture
        .kernel
        .create_session(task("Run the test tool"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Completed);

    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert_subsequence(
        &types,
        &[
            "session.created",
            "session.started",
            "planner.requested",
            "plan.accepted",
            "step.started",
            "tool.started",
            "tool.succeeded",
            "step.succeeded",
            "session.checkpoint",
            "session.completed",
        ],
    );

    // The step result carries the mock output.
    let snapshot = fixture.kernel.get_task_state();
    let result = snapshot.step_results.get("s1").expect("result");
    assert_eq!(result.status, StepStatus::Succeeded);
    assert_eq!(
        result.output.as_ref().expect("output")["echo"],
        "mock echo"
    );

    // Exactly one terminal event.
    let terminal = types
        .iter()
        .filter(|t| {
            matches!(
                t.as_str(),
                "session.completed" | "session.failed" | "session.aborted"
            )
        })
        .count();
    assert_eq!(terminal, 1);
}

#[tokio::test]
async fn test_parallel_independent_steps_all_run() {
    let tool = mock_tool("echo", serde_json::json!({"ok": true}));
    let the_plan = plan(vec![step("a", "echo"), step("b", "echo"), step("c", "echo")]);
    let fixture = kernel_fixture(
        vec![tool],
        Arc::new(ScriptedPlanner::new(vec![Ok(the_plan)])),
        |_| {},
    );

    fixture
        .kernel
        .create_session(task("run three"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(fixture.kernel.get_task_state().completed_steps, 3);
}

// ── Critics ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_circular_dependency_blocked_before_any_step() {
    let tool = mock_tool("echo", serde_json::json!({}));
    let mut a = step("a", "echo");
    a.depends_on.insert("b".to_owned());
    let mut b = step("b", "echo");
    b.depends_on.insert("a".to_owned());

    let fixture = kernel_fixture(
        vec![tool],
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![a, b]))])),
        |_| {},
    );

    fixture
        .kernel
        .create_session(task("cycle"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);

    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert_subsequence(
        &types,
        &["plan.criticized", "planner.plan_rejected", "session.failed"],
    );
    assert!(!types.iter().any(|t| t == "step.started"));
}

#[tokio::test]
async fn test_unknown_tool_never_enters_execute() {
    let fixture = kernel_fixture(
        Vec::new(),
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![step(
            "a", "ghost",
        )]))])),
        |_| {},
    );
    fixture
        .kernel
        .create_session(task("ghost tool"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);
    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert!(!types.iter().any(|t| t == "step.started"));
}

// ── Retries ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_with_backoff_consumes_attempts_and_time() {
    let mut strict = ToolSpec::new("strict", "always fails output validation");
    strict.output_schema = Some(serde_json::json!({"required": ["result"]}));
    strict.mock_responses = vec![serde_json::json!({"echo": "missing result"})];

    let mut s = step("s1", "strict");
    s.max_retries = 1;
    s.failure_policy = FailurePolicy::Abort;

    let fixture = kernel_fixture(
        vec![strict],
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![s]))])),
        |_| {},
    );
    fixture
        .kernel
        .create_session(task("retry me"))
        .await
        .expect("create");

    let started = Instant::now();
    let session = fixture.kernel.run().await.expect("run");
    let elapsed = started.elapsed();

    assert_eq!(session.status, SessionStatus::Failed);
    let result = fixture
        .kernel
        .get_task_state()
        .step_results
        .get("s1")
        .cloned()
        .expect("result");
    assert_eq!(result.attempts, 2);
    assert_eq!(
        result.error.expect("error").code,
        ErrorCode::InvalidOutput
    );
    // One backoff of at least min(500·2^0, 15000) ms.
    assert!(
        elapsed >= Duration::from_millis(400),
        "elapsed {elapsed:?} too fast for one backoff"
    );

    let failed = find_event(fixture.journal.as_ref(), &session.session_id, "step.failed")
        .await
        .expect("step.failed");
    assert_eq!(failed.payload["attempts"], 2);
}

// ── Limits ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_max_steps_limit_fails_oversized_execution() {
    let tool = mock_tool("echo", serde_json::json!({}));
    let steps: Vec<_> = (0..25).map(|i| step(&format!("s{i}"), "echo")).collect();
    let fixture = kernel_fixture(
        vec![tool],
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(steps))])),
        |config| {
            // Diagnostic run: the step-limit critic is off so the
            // execution-time budget guard is what fires.
            config.critics_enabled = false;
            config.limits.max_steps = 5;
        },
    );

    fixture
        .kernel
        .create_session(task("too many steps"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);

    let limit = find_event(
        fixture.journal.as_ref(),
        &session.session_id,
        "limit.exceeded",
    )
    .await
    .expect("limit.exceeded");
    assert_eq!(limit.payload["limit"], "max_steps");

    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert_subsequence(&types, &["limit.exceeded", "session.failed"]);
}

#[tokio::test]
async fn test_cost_limit_fires_after_usage_accumulates() {
    let mut tool = ToolSpec::new("pricey", "live tool with cost");
    tool.mock_responses = Vec::new();
    let mut executor = CapturingExecutor::new(serde_json::json!({"done": true}));
    executor.usage = Some(Usage {
        input_tokens: 10,
        output_tokens: 10,
        total_tokens: None,
        cost_usd: Some(1.0),
    });

    let mut b = step("b", "pricey");
    b.depends_on.insert("a".to_owned());
    let fixture = kernel_fixture_with_runtime(
        vec![tool],
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![
            step("a", "pricey"),
            b,
        ]))])),
        |config| {
            config.mode = karnevil9::types::ExecutionMode::Live;
            config.limits.max_cost_usd = 1.5;
        },
        Some(Arc::new(executor)),
    );

    fixture
        .kernel
        .create_session(task("spend money"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);

    let limit = find_event(
        fixture.journal.as_ref(),
        &session.session_id,
        "limit.exceeded",
    )
    .await
    .expect("limit.exceeded");
    assert_eq!(limit.payload["limit"], "max_cost_usd");

    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert!(types.iter().any(|t| t == "usage.recorded"));
}

#[tokio::test]
async fn test_iteration_limit_bounds_agentic_loop() {
    // The planner keeps handing back fresh single-step plans with fresh
    // step ids; only the iteration budget stops it.
    let tool = mock_tool("echo", serde_json::json!({}));
    let plans: Vec<_> = (0..10)
        .map(|i| Ok(plan(vec![step(&format!("s{i}"), "echo")])))
        .collect();
    let fixture = kernel_fixture(
        vec![tool],
        Arc::new(ScriptedPlanner::new(plans)),
        |config| {
            config.limits.max_iterations = 3;
            // Keep the futility monitor out of the way.
            config.futility.max_stagnant_iterations = 100;
            config.futility.max_identical_plans = 100;
        },
    );
    fixture
        .kernel
        .create_session(task("loop forever"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);
    let limit = find_event(
        fixture.journal.as_ref(),
        &session.session_id,
        "limit.exceeded",
    )
    .await
    .expect("limit.exceeded");
    assert_eq!(limit.payload["limit"], "max_iterations");

    // Each replacement announces itself right before the new acceptance.
    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert_subsequence(&types, &["plan.accepted", "plan.replaced", "plan.accepted"]);
}

#[tokio::test]
async fn test_replan_policy_breaks_to_the_agentic_loop() {
    let mut strict = ToolSpec::new("strict", "fails output validation");
    strict.output_schema = Some(serde_json::json!({"required": ["result"]}));
    strict.mock_responses = vec![serde_json::json!({})];

    let mut failing = step("s1", "strict");
    failing.failure_policy = FailurePolicy::Replan;

    // One failing plan; the retry planner call signals done, so the
    // session recovers gracefully after the replan break.
    let fixture = kernel_fixture(
        vec![strict],
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![failing]))])),
        |config| {
            config.futility.max_repeated_errors = 10;
        },
    );
    fixture
        .kernel
        .create_session(task("replan on failure"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Completed);

    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert_subsequence(
        &types,
        &["step.failed", "planner.requested", "plan.accepted", "session.completed"],
    );
}

// ── Failure policies ────────────────────────────────────────────

#[tokio::test]
async fn test_continue_policy_skips_dependents_and_completes() {
    let mut flaky = ToolSpec::new("flaky", "fails in live mode");
    flaky.mock_responses = Vec::new();
    let ok_tool = ToolSpec::new("steady", "succeeds");

    let mut executor = CapturingExecutor::new(serde_json::json!({"ok": true}));
    executor.fail_tools = vec!["flaky".to_owned()];

    let mut a = step("a", "flaky");
    a.failure_policy = FailurePolicy::Continue;
    let mut b = step("b", "steady");
    b.depends_on.insert("a".to_owned());
    let c = step("c", "steady");

    let fixture = kernel_fixture_with_runtime(
        vec![flaky, ok_tool],
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![a, b, c]))])),
        |config| {
            config.mode = karnevil9::types::ExecutionMode::Live;
        },
        Some(Arc::new(executor)),
    );

    fixture
        .kernel
        .create_session(task("partial failure"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Completed);

    let snapshot = fixture.kernel.get_task_state();
    assert_eq!(
        snapshot.step_results.get("a").map(|r| r.status),
        Some(StepStatus::Failed)
    );
    assert_eq!(
        snapshot.step_results.get("b").map(|r| r.status),
        Some(StepStatus::Skipped)
    );
    assert_eq!(
        snapshot.step_results.get("c").map(|r| r.status),
        Some(StepStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_input_from_binding_feeds_dependent_step() {
    let mut source = ToolSpec::new("source", "produces a url");
    source.mock_responses = Vec::new();
    let mut sink = ToolSpec::new("sink", "consumes a url");
    sink.input_schema = serde_json::json!({"required": ["url"]});
    sink.mock_responses = Vec::new();

    let executor = Arc::new(CapturingExecutor::new(
        serde_json::json!({"value": {"url": "https://example.com"}}),
    ));

    let mut b = step("b", "sink");
    b.depends_on.insert("a".to_owned());
    b.input_from
        .insert("url".to_owned(), "a.value.url".to_owned());

    let fixture = kernel_fixture_with_runtime(
        vec![source, sink],
        Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![
            step("a", "source"),
            b,
        ]))])),
        |config| {
            config.mode = karnevil9::types::ExecutionMode::Live;
        },
        Some(Arc::clone(&executor) as Arc<dyn karnevil9::tools::ToolExecutor>),
    );

    fixture
        .kernel
        .create_session(task("pipe data"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Completed);

    let sink_inputs = executor.inputs_for("sink");
    assert_eq!(sink_inputs.len(), 1);
    assert_eq!(sink_inputs[0]["url"], "https://example.com");
}

#[tokio::test]
async fn test_missing_runtime_fails_session_with_no_runtime() {
    let journal = Arc::new(MemoryJournal::new());
    let registry = Arc::new(ToolRegistry::new());
    registry.register(mock_tool("echo", serde_json::json!({})));
    let deps = KernelDeps {
        journal: Arc::clone(&journal) as Arc<dyn Journal>,
        registry: Arc::clone(&registry),
        planner: Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![step(
            "a", "echo",
        )]))])),
        runtime: None,
        memory: None,
        hooks: None,
        approval_wait: None,
    };
    let kernel = Kernel::new(deps, KernelConfig::default());
    kernel.create_session(task("no runtime")).await.expect("create");
    let session = kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);

    let failed = find_event(journal.as_ref(), &session.session_id, "step.failed")
        .await
        .expect("step.failed");
    assert_eq!(failed.payload["error"]["code"], "NO_RUNTIME");
}

// ── Futility ────────────────────────────────────────────────────

#[tokio::test]
async fn test_identical_plans_trip_futility() {
    let tool = mock_tool("echo", serde_json::json!({}));
    // Same content three times (fingerprints match even though plan ids
    // differ).
    let identical = || {
        let mut p = plan(vec![step("s1", "echo")]);
        p.goal = "same goal".to_owned();
        p
    };
    let fixture = kernel_fixture(
        vec![tool],
        Arc::new(ScriptedPlanner::new(vec![
            Ok(identical()),
            Ok(identical()),
            Ok(identical()),
        ])),
        |config| {
            config.futility.max_identical_plans = 3;
            config.futility.max_stagnant_iterations = 100;
        },
    );
    fixture
        .kernel
        .create_session(task("spin"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);

    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert_subsequence(&types, &["futility.detected", "session.failed"]);
    let failed = find_event(fixture.journal.as_ref(), &session.session_id, "session.failed")
        .await
        .expect("session.failed");
    assert!(failed.payload["reason"]
        .as_str()
        .is_some_and(|r| r.contains("Futility detected")));
}

// ── Lifecycle invariants ────────────────────────────────────────

#[tokio::test]
async fn test_abort_on_terminal_session_is_noop() {
    let fixture = kernel_fixture(Vec::new(), Arc::new(ScriptedPlanner::empty()), |_| {});
    fixture
        .kernel
        .create_session(task("empty"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Completed);

    fixture.kernel.abort();
    let after = fixture.kernel.get_session().expect("session");
    assert_eq!(after.status, SessionStatus::Completed);

    // No aborted event was backfilled.
    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert!(!types.iter().any(|t| t == "session.aborted"));
}

#[tokio::test]
async fn test_second_run_is_invalid_transition() {
    let fixture = kernel_fixture(Vec::new(), Arc::new(ScriptedPlanner::empty()), |_| {});
    fixture
        .kernel
        .create_session(task("once"))
        .await
        .expect("create");
    fixture.kernel.run().await.expect("run");

    let err = fixture.kernel.run().await.expect_err("second run");
    assert!(matches!(err, KernelError::InvalidTransition));
}

#[tokio::test]
async fn test_concurrent_run_is_already_running() {
    let fixture = kernel_fixture(
        Vec::new(),
        Arc::new(SlowPlanner {
            delay: Duration::from_millis(300),
            inner: ScriptedPlanner::empty(),
        }),
        |_| {},
    );
    fixture
        .kernel
        .create_session(task("slow"))
        .await
        .expect("create");

    let kernel = Arc::clone(&fixture.kernel);
    let first = tokio::spawn(async move { kernel.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = fixture.kernel.run().await.expect_err("re-entrant run");
    assert!(matches!(err, KernelError::AlreadyRunning));
    first.await.expect("join").expect("first run");
}

#[tokio::test]
async fn test_run_without_session_and_create_twice() {
    let fixture = kernel_fixture(Vec::new(), Arc::new(ScriptedPlanner::empty()), |_| {});
    assert!(matches!(
        fixture.kernel.run().await.expect_err("no session"),
        KernelError::NoSession
    ));
    fixture
        .kernel
        .create_session(task("first"))
        .await
        .expect("create");
    assert!(matches!(
        fixture
            .kernel
            .create_session(task("second"))
            .await
            .expect_err("dup"),
        KernelError::SessionExists
    ));
}

#[tokio::test]
async fn test_abort_during_planning_yields_aborted_session() {
    let fixture = kernel_fixture(
        Vec::new(),
        Arc::new(SlowPlanner {
            delay: Duration::from_secs(10),
            inner: ScriptedPlanner::empty(),
        }),
        |config| {
            config.planner_timeout = Duration::from_secs(30);
        },
    );
    fixture
        .kernel
        .create_session(task("abort me"))
        .await
        .expect("create");

    let kernel = Arc::clone(&fixture.kernel);
    let run = tokio::spawn(async move { kernel.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    fixture.kernel.abort();

    let session = run.await.expect("join").expect("run");
    assert_eq!(session.status, SessionStatus::Aborted);
    let types = event_types(fixture.journal.as_ref(), &session.session_id).await;
    assert_subsequence(&types, &["session.started", "session.aborted"]);
}

// ── Recovery ────────────────────────────────────────────────────

#[tokio::test]
async fn test_resume_continues_without_reexecuting_succeeded_steps() {
    let mut b = step("b", "echo");
    b.depends_on.insert("a".to_owned());
    let the_plan = plan(vec![step("a", "echo"), b]);

    // Fabricate a pre-crash journal: session created + started, plan
    // accepted, step "a" already succeeded.
    let journal = Arc::new(MemoryJournal::new());
    let registry = Arc::new(ToolRegistry::new());
    registry.register(mock_tool("echo", serde_json::json!({"fresh": true})));

    let seed_kernel = Kernel::new(
        KernelDeps {
            journal: Arc::clone(&journal) as Arc<dyn Journal>,
            registry: Arc::clone(&registry),
            planner: Arc::new(ScriptedPlanner::empty()),
            runtime: None,
            memory: None,
            hooks: None,
            approval_wait: None,
        },
        KernelConfig::default(),
    );
    let session = seed_kernel
        .create_session(task("resume me"))
        .await
        .expect("create");
    let session_id = session.session_id.clone();
    journal
        .emit(
            &session_id,
            EventBody::SessionStarted(karnevil9::journal::SessionStartedPayload {
                mode: karnevil9::types::ExecutionMode::Mock,
            }),
        )
        .await
        .expect("emit");
    journal
        .emit(
            &session_id,
            EventBody::PlanAccepted(karnevil9::journal::PlanAcceptedPayload {
                plan: the_plan.clone(),
                iteration: 1,
            }),
        )
        .await
        .expect("emit");
    journal
        .emit(
            &session_id,
            EventBody::StepStarted(karnevil9::journal::StepStartedPayload {
                step_id: "a".to_owned(),
                plan_id: the_plan.plan_id.clone(),
                tool: "echo".to_owned(),
            }),
        )
        .await
        .expect("emit");
    journal
        .emit(
            &session_id,
            EventBody::StepSucceeded(karnevil9::journal::StepSucceededPayload {
                step_id: "a".to_owned(),
                attempts: 1,
                output: serde_json::json!({"pre_crash": true}),
            }),
        )
        .await
        .expect("emit");

    // "Restart": a fresh kernel over the same journal resumes and runs.
    let resumed_kernel = Kernel::new(
        KernelDeps {
            journal: Arc::clone(&journal) as Arc<dyn Journal>,
            registry: Arc::clone(&registry),
            planner: Arc::new(ScriptedPlanner::empty()),
            runtime: Some(Arc::new(LocalRuntime::new(Arc::clone(&registry)))),
            memory: None,
            hooks: None,
            approval_wait: None,
        },
        KernelConfig::default(),
    );
    let resumed = resumed_kernel
        .resume_session(&session_id)
        .await
        .expect("resume")
        .expect("recoverable");
    assert_eq!(resumed.session_id, session_id);

    let finished = resumed_kernel.run().await.expect("run");
    assert_eq!(finished.status, SessionStatus::Completed);

    // Step "a" kept its pre-crash output (never re-executed); "b" ran.
    let snapshot = resumed_kernel.get_task_state();
    assert_eq!(
        snapshot.step_results.get("a").and_then(|r| r.output.clone()),
        Some(serde_json::json!({"pre_crash": true}))
    );
    assert_eq!(
        snapshot.step_results.get("b").map(|r| r.status),
        Some(StepStatus::Succeeded)
    );

    // P2 holds across the crash boundary: "a" started exactly once.
    let types = event_types(journal.as_ref(), &session_id).await;
    let a_starts = journal
        .read_session(&session_id, 0, usize::MAX)
        .await
        .expect("read")
        .iter()
        .filter(|e| e.event_type == "step.started" && e.payload["step_id"] == "a")
        .count();
    assert_eq!(a_starts, 1);
    assert_subsequence(&types, &["step.started", "session.completed"]);
}

#[tokio::test]
async fn test_resume_rejects_terminal_session() {
    let fixture = kernel_fixture(Vec::new(), Arc::new(ScriptedPlanner::empty()), |_| {});
    fixture
        .kernel
        .create_session(task("done already"))
        .await
        .expect("create");
    let session = fixture.kernel.run().await.expect("run");

    let other = kernel_fixture(Vec::new(), Arc::new(ScriptedPlanner::empty()), |_| {});
    // Same journal is required for a meaningful lookup.
    let resumed = Kernel::new(
        KernelDeps {
            journal: Arc::clone(&fixture.journal) as Arc<dyn Journal>,
            registry: Arc::clone(&other.registry),
            planner: Arc::new(ScriptedPlanner::empty()),
            runtime: None,
            memory: None,
            hooks: None,
            approval_wait: None,
        },
        KernelConfig::default(),
    )
    .resume_session(&session.session_id)
    .await
    .expect("resume");
    assert!(resumed.is_none());
}

// ── Hooks ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_blocking_hook_fails_step_with_plugin_code() {
    struct BlockEverything;

    #[async_trait::async_trait]
    impl karnevil9::kernel::HookEngine for BlockEverything {
        async fn before_step(
            &self,
            _session_id: &str,
            _step: &karnevil9::types::Step,
        ) -> karnevil9::kernel::HookAction {
            karnevil9::kernel::HookAction::Block {
                reason: "not allowed here".to_owned(),
            }
        }
    }

    let journal = Arc::new(MemoryJournal::new());
    let registry = Arc::new(ToolRegistry::new());
    registry.register(mock_tool("echo", serde_json::json!({})));
    let kernel = Kernel::new(
        KernelDeps {
            journal: Arc::clone(&journal) as Arc<dyn Journal>,
            registry: Arc::clone(&registry),
            planner: Arc::new(ScriptedPlanner::new(vec![Ok(plan(vec![step(
                "a", "echo",
            )]))])),
            runtime: Some(Arc::new(LocalRuntime::new(Arc::clone(&registry)))),
            memory: None,
            hooks: Some(Arc::new(BlockEverything)),
            approval_wait: None,
        },
        KernelConfig::default(),
    );

    kernel.create_session(task("hooked")).await.expect("create");
    let session = kernel.run().await.expect("run");
    assert_eq!(session.status, SessionStatus::Failed);

    let failed = find_event(journal.as_ref(), &session.session_id, "step.failed")
        .await
        .expect("step.failed");
    assert_eq!(failed.payload["error"]["code"], "PLUGIN_HOOK_BLOCKED");
}
