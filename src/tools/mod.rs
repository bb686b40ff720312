//! Tool specs and the registry the planner and kernel draw from.
//!
//! Tools are described by JSON-schema-shaped specs. The registry holds
//! specs in memory and can additionally load them from a directory of
//! `.json` files with a [`notify`] watcher for hot reload.

pub mod breaker;
pub mod runtime;

pub use breaker::{BreakerPolicy, CircuitBreaker, ToolCategory};
pub use runtime::{
    ExecutorOutput, LocalRuntime, PermissionGate, StaticGate, ToolCall, ToolCallError,
    ToolExecutor, ToolInvocation, ToolRuntime,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Side-effect class of a tool, driving the approval gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    /// Read-only; never gated.
    #[default]
    Read,
    /// Mutating; gated when policy requires approval for writes.
    Write,
}

/// Declarative description of a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name referenced by plan steps.
    pub name: String,
    /// Human-readable description handed to the planner.
    pub description: String,
    /// Breaker category.
    #[serde(default)]
    pub category: ToolCategory,
    /// Side-effect class.
    #[serde(default)]
    pub side_effects: SideEffects,
    /// JSON Schema for the tool's input (`properties` + `required`).
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
    /// Optional JSON Schema for the tool's output; `required` fields are
    /// checked against every result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// Canned responses served round-robin in mock mode.
    #[serde(default)]
    pub mock_responses: Vec<serde_json::Value>,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolSpec {
    /// Minimal spec with an empty input schema.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            category: ToolCategory::Other,
            side_effects: SideEffects::Read,
            input_schema: empty_schema(),
            output_schema: None,
            mock_responses: Vec::new(),
        }
    }

    /// Required input field names declared by the schema.
    pub fn required_inputs(&self) -> Vec<String> {
        schema_required(&self.input_schema)
    }

    /// Required output field names, if an output schema is declared.
    pub fn required_outputs(&self) -> Vec<String> {
        self.output_schema
            .as_ref()
            .map(schema_required)
            .unwrap_or_default()
    }
}

/// Extract the `required` string array from a JSON schema value.
fn schema_required(schema: &serde_json::Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

// ── Registry ────────────────────────────────────────────────────

/// Registry of tool specs with optional JSON-directory hot reload.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolSpec>>,
    specs_dir: Option<PathBuf>,
    /// File watcher handle (kept alive to maintain notifications).
    _watcher: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tool_count", &self.count())
            .field("specs_dir", &self.specs_dir)
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty in-memory registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            specs_dir: None,
            _watcher: None,
        }
    }

    /// Create a registry backed by a directory of `*.json` spec files,
    /// loading existing specs and starting a hot-reload watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or the watcher
    /// cannot be initialized.
    pub fn with_specs_dir(specs_dir: PathBuf) -> anyhow::Result<Arc<Self>> {
        let (tx, rx) = std::sync::mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                if let Ok(evt) = event {
                    for path in evt.paths {
                        if let Err(e) = tx.send(path) {
                            warn!(error = %e, "failed to send watcher event");
                        }
                    }
                }
            })?;

        if specs_dir.is_dir() {
            watcher.watch(&specs_dir, RecursiveMode::NonRecursive)?;
        }

        let registry = Arc::new(Self {
            tools: RwLock::new(HashMap::new()),
            specs_dir: Some(specs_dir.clone()),
            _watcher: Some(watcher),
        });
        registry.reload_all()?;

        let registry_for_thread = Arc::clone(&registry);
        std::thread::spawn(move || {
            while let Ok(path) = rx.recv() {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if path.exists() {
                    match load_spec(&path) {
                        Ok(spec) => {
                            debug!(tool = %spec.name, "reloading tool spec from watcher");
                            registry_for_thread.register(spec);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping invalid tool spec");
                        }
                    }
                } else if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    debug!(tool = stem, "removing deleted tool spec");
                    registry_for_thread.remove(stem);
                }
            }
        });

        let count = registry.count();
        info!(count, dir = %specs_dir.display(), "tool registry initialised");
        Ok(registry)
    }

    /// Register (or replace) a spec.
    pub fn register(&self, spec: ToolSpec) {
        if let Ok(mut map) = self.tools.write() {
            map.insert(spec.name.clone(), spec);
        }
    }

    /// Remove a spec by name.
    pub fn remove(&self, name: &str) {
        if let Ok(mut map) = self.tools.write() {
            map.remove(name);
        }
    }

    /// Look up a spec by name.
    pub fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
    }

    /// All specs, sorted by name for stable listings.
    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = match self.tools.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.list().into_iter().map(|s| s.name).collect()
    }

    /// Number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Reload every `*.json` spec from the configured directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn reload_all(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.specs_dir else {
            return Ok(());
        };
        if !dir.is_dir() {
            return Ok(());
        }
        let mut loaded = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_spec(&path) {
                Ok(spec) => {
                    loaded.insert(spec.name.clone(), spec);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid tool spec");
                }
            }
        }
        if let Ok(mut map) = self.tools.write() {
            *map = loaded;
        }
        Ok(())
    }
}

/// Load and validate a tool spec from a JSON file.
fn load_spec(path: &Path) -> anyhow::Result<ToolSpec> {
    let content = std::fs::read_to_string(path)?;
    let spec: ToolSpec = serde_json::from_str(&content)?;
    Ok(spec)
}
