//! Per-IP sliding-window rate limiting with an LRU cap on tracked keys.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::RateLimitConfig;

/// Maximum number of tracked client IPs before LRU eviction.
pub const MAX_IPS: usize = 10_000;

/// Result of one rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateCheck {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Epoch milliseconds when the window resets.
    pub reset_at: u64,
}

#[derive(Debug)]
struct KeyState {
    timestamps: VecDeque<u64>,
    last_used: u64,
}

/// Sliding-window limiter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl RateLimiter {
    /// Create a limiter with the given window/max settings.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Configured requests-per-window maximum.
    pub fn max_requests(&self) -> u32 {
        self.config.max_requests
    }

    /// Record a request for `key` and report whether it is allowed.
    pub fn check(&self, key: &str) -> RateCheck {
        self.check_at(key, now_ms())
    }

    /// [`RateLimiter::check`] with an injected clock, for tests.
    pub fn check_at(&self, key: &str, now: u64) -> RateCheck {
        let mut keys = match self.keys.lock() {
            Ok(k) => k,
            Err(_) => {
                return RateCheck {
                    allowed: true,
                    remaining: self.config.max_requests,
                    reset_at: now.saturating_add(self.config.window_ms),
                }
            }
        };

        if !keys.contains_key(key) && keys.len() >= MAX_IPS {
            evict_lru(&mut keys);
        }

        let entry = keys.entry(key.to_owned()).or_insert_with(|| KeyState {
            timestamps: VecDeque::new(),
            last_used: now,
        });
        entry.last_used = now;

        let cutoff = now.saturating_sub(self.config.window_ms);
        while entry.timestamps.front().is_some_and(|&t| t <= cutoff) {
            entry.timestamps.pop_front();
        }
        entry.timestamps.push_back(now);

        let count = u32::try_from(entry.timestamps.len()).unwrap_or(u32::MAX);
        let allowed = count <= self.config.max_requests;
        let remaining = self.config.max_requests.saturating_sub(count);
        let reset_at = entry
            .timestamps
            .front()
            .copied()
            .unwrap_or(now)
            .saturating_add(self.config.window_ms);

        RateCheck {
            allowed,
            remaining,
            reset_at,
        }
    }

    /// Drop keys whose whole window has elapsed. Run periodically.
    pub fn prune(&self) {
        let now = now_ms();
        let cutoff = now.saturating_sub(self.config.window_ms);
        if let Ok(mut keys) = self.keys.lock() {
            keys.retain(|_, state| state.timestamps.back().is_some_and(|&t| t > cutoff));
        }
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }
}

fn evict_lru(keys: &mut HashMap<String, KeyState>) {
    if let Some(oldest) = keys
        .iter()
        .min_by_key(|(_, state)| state.last_used)
        .map(|(key, _)| key.clone())
    {
        keys.remove(&oldest);
    }
}

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
