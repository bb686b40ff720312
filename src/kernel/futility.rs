//! Futility detection for the agentic loop.
//!
//! Tracks repeated errors, stagnation, identical plans, and cost growth
//! without progress. The kernel consults the monitor at plan acceptance and
//! after each iteration; the first firing rule fails the session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Thresholds for the futility rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FutilityConfig {
    /// Consecutive identical error codes before giving up.
    pub max_repeated_errors: u32,
    /// Iterations without a new succeeded step before giving up.
    pub max_stagnant_iterations: u32,
    /// Times the same plan fingerprint may be accepted.
    pub max_identical_plans: u32,
    /// Dollars spent since the last new succeeded step before giving up.
    pub max_cost_without_progress: f64,
}

impl Default for FutilityConfig {
    fn default() -> Self {
        Self {
            max_repeated_errors: 3,
            max_stagnant_iterations: 3,
            max_identical_plans: 3,
            max_cost_without_progress: 1.0,
        }
    }
}

/// Stateful futility monitor for one session.
#[derive(Debug)]
pub struct FutilityMonitor {
    config: FutilityConfig,
    /// Currently repeating error code and its consecutive count.
    error_streak: Option<(String, u32)>,
    /// Success count observed at the end of the previous iteration.
    last_success_count: u32,
    /// Iterations since the success count last advanced.
    stagnant_iterations: u32,
    /// Acceptance counts per plan fingerprint.
    plan_counts: HashMap<u64, u32>,
    /// Cost observed when the success count last advanced.
    cost_at_last_progress: f64,
}

impl FutilityMonitor {
    /// Create a monitor with the given thresholds.
    pub fn new(config: FutilityConfig) -> Self {
        Self {
            config,
            error_streak: None,
            last_success_count: 0,
            stagnant_iterations: 0,
            plan_counts: HashMap::new(),
            cost_at_last_progress: 0.0,
        }
    }

    /// Record a step error code; returns a reason when the same code has
    /// repeated `max_repeated_errors` consecutive times.
    pub fn record_error(&mut self, code: &str) -> Option<String> {
        let count = match &mut self.error_streak {
            Some((current, count)) if current.as_str() == code => {
                *count = count.saturating_add(1);
                *count
            }
            _ => {
                self.error_streak = Some((code.to_owned(), 1));
                1
            }
        };
        if count >= self.config.max_repeated_errors {
            return Some(format!(
                "error {code} repeated {count} consecutive times"
            ));
        }
        None
    }

    /// Record a step success, breaking any error streak.
    pub fn record_success(&mut self) {
        self.error_streak = None;
    }

    /// Record an accepted plan fingerprint; returns a reason when the same
    /// fingerprint has now been accepted `max_identical_plans` times.
    pub fn record_plan(&mut self, fingerprint: u64) -> Option<String> {
        let count = self.plan_counts.entry(fingerprint).or_insert(0);
        *count = count.saturating_add(1);
        if *count >= self.config.max_identical_plans {
            return Some(format!(
                "identical plan accepted {count} times"
            ));
        }
        None
    }

    /// Evaluate end-of-iteration rules: stagnation and cost-without-progress.
    pub fn after_iteration(&mut self, success_count: u32, cost_usd: f64) -> Option<String> {
        if success_count > self.last_success_count {
            self.last_success_count = success_count;
            self.stagnant_iterations = 0;
            self.cost_at_last_progress = cost_usd;
            return None;
        }

        self.stagnant_iterations = self.stagnant_iterations.saturating_add(1);
        if self.stagnant_iterations >= self.config.max_stagnant_iterations {
            return Some(format!(
                "no progress in {} iterations",
                self.stagnant_iterations
            ));
        }

        let spent = cost_usd - self.cost_at_last_progress;
        if spent >= self.config.max_cost_without_progress {
            return Some(format!(
                "spent ${spent:.2} without completing a new step"
            ));
        }
        None
    }
}
