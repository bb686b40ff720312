//! Execution kernel: session lifecycle, planning, the agentic loop, limit
//! enforcement, and journal-based recovery.
//!
//! One kernel owns at most one session. Every state transition is emitted
//! to the journal before the in-memory view changes hands, so a crashed
//! kernel can be rebuilt from the event trail alone.

pub mod critics;
pub mod dag;
mod executor;
pub mod futility;
pub mod memory;
pub mod planner;
pub mod recovery;
pub mod state;
pub mod usage;

pub use executor::ExecOutcome;
pub use futility::{FutilityConfig, FutilityMonitor};
pub use memory::{ActiveMemory, InMemoryActiveMemory, MemoryLesson};
pub use planner::{
    KeywordPlanner, Planner, PlannerError, PlannerRequest, PlannerSnapshot, ScriptedPlanner,
};
pub use state::{StateSnapshot, TaskState};
pub use usage::UsageAccumulator;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::journal::{
    EventBody, FutilityDetectedPayload, Journal, JournalError, LessonExtractedPayload,
    LimitExceededPayload, PlanAcceptedPayload, PlanCriticizedPayload, PlanRejectedPayload,
    PlanReplacedPayload, PlannerRequestedPayload, SessionAbortedPayload, SessionCompletedPayload,
    SessionCreatedPayload, SessionFailedPayload, SessionStartedPayload,
};
use crate::tools::{ToolRegistry, ToolRuntime};
use crate::types::{
    ExecutionMode, Limits, Plan, Policy, Pricing, Session, SessionStatus, Step, Task,
    UsageSummary, ValidationError,
};

/// Default planner call timeout.
pub const DEFAULT_PLANNER_TIMEOUT: Duration = Duration::from_secs(120);

/// Default extra planner attempts after the first failure.
pub const DEFAULT_PLANNER_RETRIES: u32 = 2;

// ── Errors ──────────────────────────────────────────────────────

/// Kernel operation errors.
#[derive(Debug, Error)]
pub enum KernelError {
    /// `create_session` on a kernel that already owns one.
    #[error("kernel already has a session")]
    SessionExists,
    /// `run` without a session.
    #[error("no session created")]
    NoSession,
    /// `run` re-entered while already running.
    #[error("session already running")]
    AlreadyRunning,
    /// `run` on a terminal session.
    #[error("invalid transition: session is terminal")]
    InvalidTransition,
    /// Journal failure.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    /// Client input validation failure.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    /// Internal invariant failure (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

// ── Hooks ───────────────────────────────────────────────────────

/// Decision from a pre-step hook.
#[derive(Debug, Clone)]
pub enum HookAction {
    /// Let the step run; informational only.
    Observe,
    /// Block the step; it fails with `PLUGIN_HOOK_BLOCKED`.
    Block {
        /// Why the hook blocked the step.
        reason: String,
    },
}

/// Plugin hook surface consulted before every step.
#[async_trait]
pub trait HookEngine: Send + Sync {
    /// Inspect a step about to run.
    async fn before_step(&self, session_id: &str, step: &Step) -> HookAction;
}

// ── Approval wait flag ──────────────────────────────────────────

/// Shared flag a permission gate raises while blocked on a human.
///
/// Lets [`Kernel::get_session`] surface `awaiting_approval` without the
/// gate and kernel referencing each other.
#[derive(Debug, Default)]
pub struct ApprovalWait(AtomicBool);

impl ApprovalWait {
    /// Create a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise or lower the flag.
    pub fn set(&self, waiting: bool) {
        self.0.store(waiting, Ordering::SeqCst);
    }

    /// Whether a gate is currently blocked on a human.
    pub fn is_waiting(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Configuration ───────────────────────────────────────────────

/// Per-session kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Tool dispatch mode.
    pub mode: ExecutionMode,
    /// Resource budgets.
    pub limits: Limits,
    /// Server-controlled policy handed to the runtime.
    pub policy: Policy,
    /// Whether the planner is re-invoked after each execute phase.
    pub agentic: bool,
    /// Whether plan critics gate acceptance (disable for diagnostics).
    pub critics_enabled: bool,
    /// Extra planner attempts after the first failure.
    pub planner_retries: u32,
    /// Per-call planner timeout.
    pub planner_timeout: Duration,
    /// Futility thresholds.
    pub futility: FutilityConfig,
    /// Pricing used when tools report tokens without cost.
    pub pricing: Pricing,
    /// Optional task domain hint for the first planner call.
    pub task_domain: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            limits: Limits::default(),
            policy: Policy::default(),
            agentic: true,
            critics_enabled: true,
            planner_retries: DEFAULT_PLANNER_RETRIES,
            planner_timeout: DEFAULT_PLANNER_TIMEOUT,
            futility: FutilityConfig::default(),
            pricing: Pricing::default(),
            task_domain: None,
        }
    }
}

/// Collaborator handles the kernel drives.
pub struct KernelDeps {
    /// Append-only event store.
    pub journal: Arc<dyn Journal>,
    /// Tool schema registry.
    pub registry: Arc<ToolRegistry>,
    /// Plan producer.
    pub planner: Arc<dyn Planner>,
    /// Tool execution runtime; absence fails steps with `NO_RUNTIME`.
    pub runtime: Option<Arc<dyn ToolRuntime>>,
    /// Optional long-term memory.
    pub memory: Option<Arc<dyn ActiveMemory>>,
    /// Optional plugin hook engine.
    pub hooks: Option<Arc<dyn HookEngine>>,
    /// Optional shared approval-wait flag.
    pub approval_wait: Option<Arc<ApprovalWait>>,
}

// ── Kernel ──────────────────────────────────────────────────────

/// Outcome of a planner acquisition attempt.
enum PlanOutcome {
    Planned(Plan),
    Aborted,
    Failed(String),
}

/// The execution kernel for a single session.
pub struct Kernel {
    deps: KernelDeps,
    config: KernelConfig,
    session: Mutex<Option<Session>>,
    state: Mutex<TaskState>,
    usage: Mutex<UsageAccumulator>,
    futility: Mutex<FutilityMonitor>,
    /// Cumulative count of launched steps across all iterations.
    started_steps: AtomicU32,
    /// Iteration to resume from (0 for fresh sessions).
    resume_iteration: AtomicU32,
    resumed: AtomicBool,
    running: AtomicBool,
    abort_flag: AtomicBool,
    abort_notify: Notify,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("session", &self.get_session().map(|s| s.session_id))
            .finish()
    }
}

impl Kernel {
    /// Create a kernel from collaborators and configuration.
    pub fn new(deps: KernelDeps, config: KernelConfig) -> Self {
        let futility = FutilityMonitor::new(config.futility);
        let pricing = config.pricing;
        Self {
            deps,
            config,
            session: Mutex::new(None),
            state: Mutex::new(TaskState::new()),
            usage: Mutex::new(UsageAccumulator::new(pricing)),
            futility: Mutex::new(futility),
            started_steps: AtomicU32::new(0),
            resume_iteration: AtomicU32::new(0),
            resumed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            abort_flag: AtomicBool::new(false),
            abort_notify: Notify::new(),
        }
    }

    // ── Session lifecycle ───────────────────────────────────────

    /// Allocate the kernel's session and journal `session.created`.
    ///
    /// # Errors
    ///
    /// [`KernelError::SessionExists`] if this kernel already owns one.
    pub async fn create_session(&self, task: Task) -> Result<Session, KernelError> {
        {
            let guard = self.lock_session()?;
            if guard.is_some() {
                return Err(KernelError::SessionExists);
            }
        }
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Created,
            mode: self.config.mode,
            task,
            active_plan_id: None,
            limits: self.config.limits,
            policy: self.config.policy.clone(),
            created_at: now,
            updated_at: now,
        };
        self.deps
            .journal
            .emit(
                &session.session_id,
                EventBody::SessionCreated(SessionCreatedPayload {
                    session: session.clone(),
                }),
            )
            .await?;
        *self.lock_session()? = Some(session.clone());
        info!(session_id = %session.session_id, "session created");
        Ok(session)
    }

    /// Rebuild a crashed session from the journal.
    ///
    /// Returns `None` when the session is terminal or never got past
    /// `session.started` + `plan.accepted`. On success the kernel owns the
    /// rebuilt session; call [`Kernel::run`] to continue it. Already
    /// succeeded steps are never re-executed.
    pub async fn resume_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Session>, KernelError> {
        {
            let guard = self.lock_session()?;
            if guard.is_some() {
                return Err(KernelError::SessionExists);
            }
        }
        let Some(recovered) = recovery::inspect(self.deps.journal.as_ref(), session_id).await?
        else {
            return Ok(None);
        };

        {
            let mut state = self.lock_state()?;
            state.set_plan(recovered.plan.clone());
            for result in recovered.results.clone() {
                state.restore_result(result);
            }
        }
        self.lock_usage()?.restore_from(recovered.usage);
        self.started_steps
            .store(recovered.started_steps, Ordering::SeqCst);
        self.resume_iteration
            .store(recovered.iteration, Ordering::SeqCst);
        self.resumed.store(true, Ordering::SeqCst);
        *self.lock_session()? = Some(recovered.session.clone());
        info!(session_id, iteration = recovered.iteration, "session resumed from journal");
        Ok(Some(recovered.session))
    }

    /// Execute the session to a terminal state.
    ///
    /// # Errors
    ///
    /// [`KernelError::NoSession`] without a session,
    /// [`KernelError::InvalidTransition`] on a terminal session,
    /// [`KernelError::AlreadyRunning`] when re-entered.
    pub async fn run(&self) -> Result<Session, KernelError> {
        {
            let guard = self.lock_session()?;
            let Some(session) = guard.as_ref() else {
                return Err(KernelError::NoSession);
            };
            if session.status.is_terminal() {
                return Err(KernelError::InvalidTransition);
            }
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(KernelError::AlreadyRunning);
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Request cooperative cancellation.
    ///
    /// Idempotent; a no-op on terminal sessions (terminal status is never
    /// backfilled).
    pub fn abort(&self) {
        if self
            .get_session()
            .is_some_and(|s| s.status.is_terminal())
        {
            return;
        }
        self.abort_flag.store(true, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
    }

    // ── Snapshots ───────────────────────────────────────────────

    /// Current session, with live `awaiting_approval` overlay.
    pub fn get_session(&self) -> Option<Session> {
        let mut session = self.session.lock().ok()?.clone()?;
        if !session.status.is_terminal()
            && self
                .deps
                .approval_wait
                .as_ref()
                .is_some_and(|w| w.is_waiting())
        {
            session.status = SessionStatus::AwaitingApproval;
        }
        Some(session)
    }

    /// Snapshot of the task state.
    pub fn get_task_state(&self) -> StateSnapshot {
        self.state
            .lock()
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Snapshot of usage totals.
    pub fn get_usage_summary(&self) -> UsageSummary {
        self.usage
            .lock()
            .map(|u| u.summary())
            .unwrap_or_default()
    }

    // ── Main loop ───────────────────────────────────────────────

    async fn run_inner(&self) -> Result<Session, KernelError> {
        let session_id = self.session_id()?;
        let resumed = self.resumed.load(Ordering::SeqCst);

        if !resumed {
            self.deps
                .journal
                .emit(
                    &session_id,
                    EventBody::SessionStarted(SessionStartedPayload {
                        mode: self.config.mode,
                    }),
                )
                .await?;
        }

        let mut iteration = self.resume_iteration.load(Ordering::SeqCst).max(1);
        let mut resume_plan: Option<Plan> = if resumed {
            self.lock_state()?.plan().cloned()
        } else {
            None
        };

        loop {
            if self.is_aborted() {
                return self.finish_aborted(&session_id).await;
            }
            if let Some(breach) = self.check_budgets()? {
                return self.finish_limit(&session_id, breach).await;
            }
            if iteration > self.config.limits.max_iterations {
                let breach = (
                    "max_iterations".to_owned(),
                    f64::from(iteration),
                    f64::from(self.config.limits.max_iterations),
                );
                return self.finish_limit(&session_id, breach).await;
            }

            // A resumed session re-enters its recovered plan directly.
            let plan = if let Some(plan) = resume_plan.take() {
                plan
            } else {
                self.set_status(SessionStatus::Planning)?;
                self.deps
                    .journal
                    .emit(
                        &session_id,
                        EventBody::PlannerRequested(PlannerRequestedPayload { iteration }),
                    )
                    .await?;
                match self.obtain_plan(&session_id, iteration).await? {
                    PlanOutcome::Planned(plan) => plan,
                    PlanOutcome::Aborted => return self.finish_aborted(&session_id).await,
                    PlanOutcome::Failed(reason) => {
                        return self.finish_failed(&session_id, reason).await
                    }
                }
            };

            if plan.steps.is_empty() {
                // Zero steps is the planner's done signal.
                self.deps
                    .journal
                    .emit(
                        &session_id,
                        EventBody::PlanAccepted(PlanAcceptedPayload { plan, iteration }),
                    )
                    .await?;
                return self.finish_completed(&session_id, iteration).await;
            }

            let previous_plan_id = self
                .get_session()
                .and_then(|s| s.active_plan_id)
                .filter(|prev| *prev != plan.plan_id);
            if let Some(previous_plan_id) = previous_plan_id {
                self.deps
                    .journal
                    .emit(
                        &session_id,
                        EventBody::PlanReplaced(PlanReplacedPayload {
                            previous_plan_id,
                            new_plan_id: plan.plan_id.clone(),
                            iteration,
                        }),
                    )
                    .await?;
            }
            self.deps
                .journal
                .emit(
                    &session_id,
                    EventBody::PlanAccepted(PlanAcceptedPayload {
                        plan: plan.clone(),
                        iteration,
                    }),
                )
                .await?;

            let futility_reason = self.lock_futility()?.record_plan(plan.fingerprint());
            if let Some(reason) = futility_reason {
                return self.finish_futile(&session_id, reason).await;
            }

            {
                let mut state = self.lock_state()?;
                state.set_plan(plan.clone());
            }
            self.with_session(|s| s.active_plan_id = Some(plan.plan_id.clone()))?;
            self.set_status(SessionStatus::Running)?;

            match self.execute_plan(&session_id, &plan).await? {
                ExecOutcome::Aborted => return self.finish_aborted(&session_id).await,
                ExecOutcome::Failed(reason) => {
                    return self.finish_failed(&session_id, reason).await
                }
                ExecOutcome::Futile(reason) => {
                    return self.finish_futile(&session_id, reason).await
                }
                ExecOutcome::LimitExceeded(breach) => {
                    return self.finish_limit(&session_id, breach).await
                }
                ExecOutcome::Completed | ExecOutcome::Replan => {}
            }

            // End-of-iteration futility rules.
            let completed = self.lock_state()?.completed_count();
            let cost = self.get_usage_summary().cost_usd;
            let futility_reason = self.lock_futility()?.after_iteration(completed, cost);
            if let Some(reason) = futility_reason {
                return self.finish_futile(&session_id, reason).await;
            }

            if !self.config.agentic {
                return self.finish_completed(&session_id, iteration).await;
            }
            iteration = iteration.saturating_add(1);
        }
    }

    // ── Planning ────────────────────────────────────────────────

    async fn obtain_plan(
        &self,
        session_id: &str,
        iteration: u32,
    ) -> Result<PlanOutcome, KernelError> {
        let attempts = self.config.planner_retries.saturating_add(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            if self.is_aborted() {
                return Ok(PlanOutcome::Aborted);
            }

            let request = self.build_planner_request(iteration).await?;
            // The planner call is a suspension point: abort interrupts it
            // by dropping the in-flight future.
            let outcome = tokio::select! {
                outcome = tokio::time::timeout(
                    self.config.planner_timeout,
                    self.deps.planner.plan(request),
                ) => outcome,
                () = self.abort_notify.notified() => return Ok(PlanOutcome::Aborted),
            };

            let plan = match outcome {
                Err(_) => {
                    last_reason = format!(
                        "planner timed out after {} ms",
                        self.config.planner_timeout.as_millis()
                    );
                    warn!(session_id, attempt, "planner call timed out");
                    if attempt < attempts && self.backoff_sleep(attempt.saturating_sub(1)).await {
                        return Ok(PlanOutcome::Aborted);
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    last_reason = e.to_string();
                    warn!(session_id, attempt, error = %e, "planner call failed");
                    if attempt < attempts && self.backoff_sleep(attempt.saturating_sub(1)).await {
                        return Ok(PlanOutcome::Aborted);
                    }
                    continue;
                }
                Ok(Ok(plan)) => plan,
            };

            if self.config.critics_enabled {
                let tools = self.deps.registry.list();
                let findings = critics::run_critics(
                    &plan,
                    &critics::CriticContext {
                        tools: &tools,
                        limits: &self.config.limits,
                    },
                );
                if critics::has_blocking_failure(&findings) {
                    let summary: Vec<String> = findings
                        .iter()
                        .filter(|f| !f.passed)
                        .filter_map(|f| f.message.clone())
                        .collect();
                    last_reason = format!("plan rejected by critics: {}", summary.join("; "));
                    self.deps
                        .journal
                        .emit(
                            session_id,
                            EventBody::PlanCriticized(PlanCriticizedPayload {
                                plan_id: plan.plan_id.clone(),
                                findings,
                            }),
                        )
                        .await?;
                    self.deps
                        .journal
                        .emit(
                            session_id,
                            EventBody::PlanRejected(PlanRejectedPayload {
                                reason: last_reason.clone(),
                                attempt,
                            }),
                        )
                        .await?;
                    continue;
                }
            }

            return Ok(PlanOutcome::Planned(plan));
        }

        // Retry budget exhausted. Planner exceptions get their single
        // terminal plan_rejected here; critic rejections already emitted
        // one per attempt.
        if !last_reason.starts_with("plan rejected by critics") {
            self.deps
                .journal
                .emit(
                    session_id,
                    EventBody::PlanRejected(PlanRejectedPayload {
                        reason: last_reason.clone(),
                        attempt: attempts,
                    }),
                )
                .await?;
        }
        Ok(PlanOutcome::Failed(format!(
            "planning failed after {attempts} attempts: {last_reason}"
        )))
    }

    async fn build_planner_request(&self, iteration: u32) -> Result<PlannerRequest, KernelError> {
        let session = self.get_session().ok_or(KernelError::NoSession)?;
        let mut snapshot = PlannerSnapshot {
            iteration,
            ..PlannerSnapshot::default()
        };
        if iteration >= 2 {
            snapshot.state = self.lock_state()?.snapshot();
            if let Some(memory) = &self.deps.memory {
                snapshot.relevant_memories = memory.recall(&session.task.text, 8).await;
            }
        } else {
            snapshot.task_domain = self.config.task_domain.clone();
        }
        Ok(PlannerRequest {
            task: session.task.clone(),
            tools: self.deps.registry.list(),
            snapshot,
            limits: self.config.limits,
        })
    }

    // ── Terminal transitions ────────────────────────────────────

    async fn finish_completed(
        &self,
        session_id: &str,
        iterations: u32,
    ) -> Result<Session, KernelError> {
        let completed_steps = self.lock_state()?.completed_count();
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::SessionCompleted(SessionCompletedPayload {
                    iterations,
                    completed_steps,
                }),
            )
            .await?;
        self.set_status(SessionStatus::Completed)?;
        self.extract_lesson(session_id, "completed", "").await?;
        info!(session_id, iterations, completed_steps, "session completed");
        self.current_session()
    }

    async fn finish_failed(
        &self,
        session_id: &str,
        reason: String,
    ) -> Result<Session, KernelError> {
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::SessionFailed(SessionFailedPayload {
                    reason: reason.clone(),
                }),
            )
            .await?;
        self.set_status(SessionStatus::Failed)?;
        self.extract_lesson(session_id, "failed", &reason).await?;
        warn!(session_id, reason = %reason, "session failed");
        self.current_session()
    }

    async fn finish_futile(
        &self,
        session_id: &str,
        reason: String,
    ) -> Result<Session, KernelError> {
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::FutilityDetected(FutilityDetectedPayload {
                    reason: reason.clone(),
                }),
            )
            .await?;
        self.finish_failed(session_id, format!("Futility detected: {reason}"))
            .await
    }

    async fn finish_limit(
        &self,
        session_id: &str,
        (limit, value, threshold): (String, f64, f64),
    ) -> Result<Session, KernelError> {
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::LimitExceeded(LimitExceededPayload {
                    limit: limit.clone(),
                    value,
                    threshold,
                }),
            )
            .await?;
        self.finish_failed(session_id, format!("limit exceeded: {limit}"))
            .await
    }

    async fn finish_aborted(&self, session_id: &str) -> Result<Session, KernelError> {
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::SessionAborted(SessionAbortedPayload {}),
            )
            .await?;
        self.set_status(SessionStatus::Aborted)?;
        info!(session_id, "session aborted");
        self.current_session()
    }

    async fn extract_lesson(
        &self,
        session_id: &str,
        outcome: &str,
        detail: &str,
    ) -> Result<(), KernelError> {
        let Some(memory) = &self.deps.memory else {
            return Ok(());
        };
        let session = self.get_session().ok_or(KernelError::NoSession)?;
        let mut summary: String = session.task.text.chars().take(120).collect();
        if session.task.text.chars().count() > 120 {
            summary.push('…');
        }
        let lesson = memory::compose_lesson(&summary, outcome, detail);
        memory
            .append(MemoryLesson {
                task_summary: summary,
                outcome: outcome.to_owned(),
                lesson: lesson.clone(),
                recorded_at: Utc::now(),
            })
            .await;
        self.deps
            .journal
            .emit(
                session_id,
                EventBody::LessonExtracted(LessonExtractedPayload {
                    lesson,
                    outcome: outcome.to_owned(),
                }),
            )
            .await?;
        Ok(())
    }

    // ── Budgets & cancellation ──────────────────────────────────

    /// First budget breach among duration → tokens → cost, if any.
    fn check_budgets(&self) -> Result<Option<(String, f64, f64)>, KernelError> {
        let session = self.get_session().ok_or(KernelError::NoSession)?;
        let limits = &self.config.limits;

        // Wall clock is measured from the original creation time, which a
        // resumed session keeps.
        let elapsed_ms = Utc::now()
            .signed_duration_since(session.created_at)
            .num_milliseconds()
            .max(0);
        let elapsed_ms = u64::try_from(elapsed_ms).unwrap_or(0);
        if elapsed_ms > limits.max_duration_ms {
            return Ok(Some((
                "max_duration_ms".to_owned(),
                to_f64(elapsed_ms),
                to_f64(limits.max_duration_ms),
            )));
        }

        let usage = self.get_usage_summary();
        if usage.total_tokens > limits.max_tokens {
            return Ok(Some((
                "max_tokens".to_owned(),
                to_f64(usage.total_tokens),
                to_f64(limits.max_tokens),
            )));
        }
        if usage.cost_usd > limits.max_cost_usd {
            return Ok(Some((
                "max_cost_usd".to_owned(),
                usage.cost_usd,
                limits.max_cost_usd,
            )));
        }
        Ok(None)
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    /// Sleep the retry backoff for `attempt`; returns `true` on abort.
    pub(crate) async fn backoff_sleep(&self, attempt: u32) -> bool {
        if self.is_aborted() {
            return true;
        }
        let delay = executor::backoff_delay(attempt);
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = self.abort_notify.notified() => true,
        }
    }

    // ── Internal helpers ────────────────────────────────────────

    fn lock_session(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Option<Session>>, KernelError> {
        self.session
            .lock()
            .map_err(|_| KernelError::Internal("session lock poisoned".to_owned()))
    }

    pub(crate) fn lock_state(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, TaskState>, KernelError> {
        self.state
            .lock()
            .map_err(|_| KernelError::Internal("state lock poisoned".to_owned()))
    }

    pub(crate) fn lock_usage(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, UsageAccumulator>, KernelError> {
        self.usage
            .lock()
            .map_err(|_| KernelError::Internal("usage lock poisoned".to_owned()))
    }

    pub(crate) fn lock_futility(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, FutilityMonitor>, KernelError> {
        self.futility
            .lock()
            .map_err(|_| KernelError::Internal("futility lock poisoned".to_owned()))
    }

    fn session_id(&self) -> Result<String, KernelError> {
        self.lock_session()?
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or(KernelError::NoSession)
    }

    fn current_session(&self) -> Result<Session, KernelError> {
        self.lock_session()?
            .as_ref()
            .cloned()
            .ok_or(KernelError::NoSession)
    }

    fn with_session(
        &self,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<(), KernelError> {
        let mut guard = self.lock_session()?;
        if let Some(session) = guard.as_mut() {
            mutate(session);
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    fn set_status(&self, status: SessionStatus) -> Result<(), KernelError> {
        self.with_session(|s| s.status = status)
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn to_f64(v: u64) -> f64 {
    v as f64
}
