//! Server configuration: TOML file plus environment overrides.
//!
//! A single [`ServerConfig`] drives the daemon. The legacy two-argument
//! construction path survives as the [`ServerConfig::legacy`] preset.
//! Running without an API token is refused unless `allow_insecure` is set
//! explicitly.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::kernel::FutilityConfig;
use crate::types::{Limits, Policy, Pricing};

/// Environment variable carrying the API token.
pub const ENV_API_TOKEN: &str = "KARNEVIL9_API_TOKEN";

/// Environment variable selecting production behavior (stack-trace
/// suppression in client-visible errors).
pub const ENV_MODE: &str = "KARNEVIL9_ENV";

/// Whether the process runs in production mode.
pub fn is_production() -> bool {
    std::env::var(ENV_MODE).is_ok_and(|v| v == "production")
}

/// Configuration errors raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// Config file could not be parsed.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    /// No API token and no explicit insecure opt-in.
    #[error("no API token configured; set {ENV_API_TOKEN} or opt in with allow_insecure = true")]
    InsecureWithoutOptIn,
    /// A limit failed validation.
    #[error("invalid server limits: {0}")]
    InvalidLimits(#[from] crate::types::ValidationError),
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in milliseconds.
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    /// Requests allowed per window per IP.
    #[serde(default = "default_rate_max")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            max_requests: default_rate_max(),
        }
    }
}

/// Planner call settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PlannerConfig {
    /// Extra attempts after the first failure.
    #[serde(default = "default_planner_retries")]
    pub retries: u32,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_planner_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            retries: default_planner_retries(),
            timeout_ms: default_planner_timeout_ms(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token; absent means insecure mode (requires opt-in).
    #[serde(default)]
    pub api_token: Option<String>,

    /// Explicit opt-in to running without authentication.
    #[serde(default)]
    pub allow_insecure: bool,

    /// Concurrent session admission cap.
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,

    /// SSE clients allowed per session.
    #[serde(default = "default_max_sse_clients")]
    pub max_sse_clients_per_session: usize,

    /// Per-IP rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Approval auto-deny timeout in milliseconds.
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,

    /// Server maxima that client-supplied limits are clamped to.
    #[serde(default)]
    pub server_limits: Limits,

    /// Execution policy applied to every session.
    #[serde(default)]
    pub policy: Policy,

    /// Planner retry/timeout settings.
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Whether plan critics gate acceptance.
    #[serde(default = "default_true")]
    pub critics_enabled: bool,

    /// Whether sessions run the agentic replan loop.
    #[serde(default = "default_true")]
    pub agentic: bool,

    /// Futility thresholds.
    #[serde(default)]
    pub futility: FutilityConfig,

    /// Pricing for cost accounting when tools report tokens only.
    #[serde(default)]
    pub pricing: Pricing,

    /// SQLite journal path; absent keeps the journal in memory.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,

    /// Directory of tool spec JSON files, hot reloaded.
    #[serde(default)]
    pub tool_specs_dir: Option<PathBuf>,

    /// mDNS service name advertised on Unix hosts.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Whether to attempt mDNS advertisement. Best effort: hosts without
    /// `dns-sd` just skip it.
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            api_token: None,
            allow_insecure: false,
            max_concurrent_sessions: default_max_sessions(),
            max_sse_clients_per_session: default_max_sse_clients(),
            rate_limit: RateLimitConfig::default(),
            approval_timeout_ms: default_approval_timeout_ms(),
            server_limits: Limits::default(),
            policy: Policy::default(),
            planner: PlannerConfig::default(),
            critics_enabled: true,
            agentic: true,
            futility: FutilityConfig::default(),
            pricing: Pricing::default(),
            journal_path: None,
            tool_specs_dir: None,
            service_name: default_service_name(),
            mdns_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ServerConfig = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides (currently the API token).
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(ENV_API_TOKEN) {
            if !token.is_empty() {
                self.api_token = Some(token);
            }
        }
    }

    /// The legacy two-argument construction path: port plus optional
    /// token, everything else at defaults. A `None` token opts into
    /// insecure mode, matching the old constructor's behavior.
    pub fn legacy(port: u16, api_token: Option<String>) -> Self {
        let allow_insecure = api_token.is_none();
        Self {
            port,
            api_token,
            allow_insecure,
            ..Self::default()
        }
    }

    /// Validate invariants before the server starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_token.is_none() && !self.allow_insecure {
            return Err(ConfigError::InsecureWithoutOptIn);
        }
        self.server_limits.validate()?;
        Ok(())
    }

    /// Whether authentication is enforced.
    pub fn auth_enabled(&self) -> bool {
        self.api_token.is_some()
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    7979
}

fn default_max_sessions() -> usize {
    8
}

fn default_max_sse_clients() -> usize {
    10
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_rate_max() -> u32 {
    120
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

fn default_planner_retries() -> u32 {
    2
}

fn default_planner_timeout_ms() -> u64 {
    120_000
}

fn default_service_name() -> String {
    "karnevil9".to_owned()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_refuse_tokenless_without_opt_in() {
        let config = ServerConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InsecureWithoutOptIn)
        ));
    }

    #[test]
    fn test_token_enables_auth() {
        let config = ServerConfig {
            api_token: Some("secret".to_owned()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.auth_enabled());
    }

    #[test]
    fn test_legacy_preset_derives_insecure_from_missing_token() {
        let config = ServerConfig::legacy(9000, None);
        assert_eq!(config.port, 9000);
        assert!(config.allow_insecure);
        assert!(config.validate().is_ok());
        assert!(!config.auth_enabled());

        let secured = ServerConfig::legacy(9000, Some("k".to_owned()));
        assert!(!secured.allow_insecure);
        assert!(secured.auth_enabled());
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
port = 8111
allow_insecure = true

[rate_limit]
max_requests = 3
window_ms = 1000

[server_limits]
max_steps = 16
max_duration_ms = 60000
max_cost_usd = 1.0
max_tokens = 10000
max_iterations = 4
"#,
        )
        .expect("write");

        let config = ServerConfig::load(&path).expect("load");
        assert_eq!(config.port, 8111);
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.server_limits.max_steps, 16);
        // Unspecified sections keep defaults.
        assert_eq!(config.max_concurrent_sessions, 8);
        assert!(config.critics_enabled);
    }
}
