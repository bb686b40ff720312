//! Per-tool circuit breaker with category defaults and half-open probing.
//!
//! Repeated retriable failures open a tool's circuit; after the cooldown
//! the next call runs as a probe (half-open). A failed probe re-opens the
//! circuit, a successful one closes it and clears the counter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Tool category, selecting breaker defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// LLM-backed tools.
    Llm,
    /// Shell-spawning tools.
    Shell,
    /// Outbound HTTP tools.
    Http,
    /// Everything else.
    #[default]
    Other,
}

/// Failure threshold and cooldown for one category.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    /// Consecutive retriable failures before the circuit opens.
    pub threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub cooldown: Duration,
}

impl BreakerPolicy {
    /// Category defaults: llm 3/60 s, shell 3/15 s, http 3/30 s, other 3/30 s.
    pub fn for_category(category: ToolCategory) -> Self {
        match category {
            ToolCategory::Llm => Self {
                threshold: 3,
                cooldown: Duration::from_secs(60),
            },
            ToolCategory::Shell => Self {
                threshold: 3,
                cooldown: Duration::from_secs(15),
            },
            ToolCategory::Http | ToolCategory::Other => Self {
                threshold: 3,
                cooldown: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ToolState {
    state: State,
    failures: u32,
    tripped_at: Option<Instant>,
}

impl ToolState {
    fn new() -> Self {
        Self {
            state: State::Closed,
            failures: 0,
            tripped_at: None,
        }
    }
}

/// Per-tool circuit breaker map.
///
/// All methods take `&self`; state lives behind a sync mutex since the
/// critical sections are brief and await-free.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    tools: Mutex<HashMap<String, ToolState>>,
}

impl CircuitBreaker {
    /// Create an empty breaker map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether calls to `tool` are currently rejected.
    ///
    /// Returns `false` once the category cooldown has elapsed, flipping the
    /// circuit to half-open so the next call acts as a probe.
    pub fn is_open(&self, tool: &str, category: ToolCategory) -> bool {
        let policy = BreakerPolicy::for_category(category);
        let mut map = match self.tools.lock() {
            Ok(m) => m,
            Err(_) => return false,
        };
        let entry = map.entry(tool.to_owned()).or_insert_with(ToolState::new);
        match entry.state {
            State::Closed | State::HalfOpen => false,
            State::Open => {
                let elapsed = entry
                    .tripped_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= policy.cooldown {
                    entry.state = State::HalfOpen;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Record a failed call. Non-retriable failures don't count.
    pub fn record_failure(&self, tool: &str, category: ToolCategory, retriable: bool) {
        if !retriable {
            return;
        }
        let policy = BreakerPolicy::for_category(category);
        let mut map = match self.tools.lock() {
            Ok(m) => m,
            Err(_) => return,
        };
        let entry = map.entry(tool.to_owned()).or_insert_with(ToolState::new);
        match entry.state {
            State::HalfOpen => {
                // Probe failed — back to open for a full cooldown.
                entry.state = State::Open;
                entry.tripped_at = Some(Instant::now());
            }
            State::Closed => {
                entry.failures = entry.failures.saturating_add(1);
                if entry.failures >= policy.threshold {
                    entry.state = State::Open;
                    entry.tripped_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }

    /// Record a successful call: close the circuit and clear the counter.
    pub fn record_success(&self, tool: &str) {
        if let Ok(mut map) = self.tools.lock() {
            if let Some(entry) = map.get_mut(tool) {
                entry.state = State::Closed;
                entry.failures = 0;
                entry.tripped_at = None;
            }
        }
    }

    #[cfg(test)]
    fn force_trip_age(&self, tool: &str, age: Duration) {
        if let Ok(mut map) = self.tools.lock() {
            if let Some(entry) = map.get_mut(tool) {
                entry.tripped_at = Instant::now().checked_sub(age);
            }
        }
    }
}
