//! Plan critics: pure predicates run before a plan is accepted.
//!
//! Each critic returns a finding; any `error`-severity failure blocks
//! acceptance and sends the kernel back to the planner. Validation here is
//! deliberately shallow (tool existence, required fields, step budget,
//! dependency cycles) — full schema validation stays in the tool runtime.

use crate::journal::CriticFinding;
use crate::tools::ToolSpec;
use crate::types::{Limits, Plan};

use super::dag;

/// Severity for findings that block plan acceptance.
pub const SEVERITY_ERROR: &str = "error";

/// Severity for informational findings.
pub const SEVERITY_WARNING: &str = "warning";

/// Inputs the critics evaluate a plan against.
pub struct CriticContext<'a> {
    /// Specs of every registered tool.
    pub tools: &'a [ToolSpec],
    /// Session limits.
    pub limits: &'a Limits,
}

/// Run the default critic set against a plan.
///
/// Returns every finding, passed and failed; callers block acceptance when
/// [`has_blocking_failure`] is true.
pub fn run_critics(plan: &Plan, ctx: &CriticContext<'_>) -> Vec<CriticFinding> {
    vec![
        unknown_tool(plan, ctx),
        tool_input(plan, ctx),
        step_limit(plan, ctx),
        self_reference(plan),
    ]
}

/// Whether any finding has error severity and did not pass.
pub fn has_blocking_failure(findings: &[CriticFinding]) -> bool {
    findings
        .iter()
        .any(|f| !f.passed && f.severity == SEVERITY_ERROR)
}

fn pass(name: &str) -> CriticFinding {
    CriticFinding {
        name: name.to_owned(),
        passed: true,
        message: None,
        severity: SEVERITY_ERROR.to_owned(),
    }
}

fn fail(name: &str, message: String) -> CriticFinding {
    CriticFinding {
        name: name.to_owned(),
        passed: false,
        message: Some(message),
        severity: SEVERITY_ERROR.to_owned(),
    }
}

/// Every step must reference a registered tool.
fn unknown_tool(plan: &Plan, ctx: &CriticContext<'_>) -> CriticFinding {
    let unknown: Vec<&str> = plan
        .steps
        .iter()
        .filter(|s| !ctx.tools.iter().any(|t| t.name == s.tool_ref.name))
        .map(|s| s.tool_ref.name.as_str())
        .collect();
    if unknown.is_empty() {
        pass("unknown-tool")
    } else {
        fail(
            "unknown-tool",
            format!("plan references unknown tools: {}", unknown.join(", ")),
        )
    }
}

/// Required input fields must be satisfied by static input or an
/// `input_from` binding. Steps whose tool is unknown are skipped — the
/// prior critic already flags those.
fn tool_input(plan: &Plan, ctx: &CriticContext<'_>) -> CriticFinding {
    let mut missing: Vec<String> = Vec::new();
    for step in &plan.steps {
        let Some(spec) = ctx.tools.iter().find(|t| t.name == step.tool_ref.name) else {
            continue;
        };
        let static_fields = step.input.as_object();
        for field in spec.required_inputs() {
            let in_static = static_fields.is_some_and(|o| o.contains_key(&field));
            let bound = step.input_from.contains_key(&field);
            if !in_static && !bound {
                missing.push(format!("{}.{field}", step.step_id));
            }
        }
    }
    if missing.is_empty() {
        pass("tool-input")
    } else {
        fail(
            "tool-input",
            format!("missing required inputs: {}", missing.join(", ")),
        )
    }
}

/// The plan must fit the session's step budget.
fn step_limit(plan: &Plan, ctx: &CriticContext<'_>) -> CriticFinding {
    let count = plan.steps.len();
    let max = usize::try_from(ctx.limits.max_steps).unwrap_or(usize::MAX);
    if count > max {
        fail(
            "step-limit",
            format!("plan has {count} steps, limit is {max}"),
        )
    } else {
        pass("step-limit")
    }
}

/// No step may depend on itself and the dependency graph must be acyclic.
fn self_reference(plan: &Plan) -> CriticFinding {
    for step in &plan.steps {
        if step.depends_on.contains(&step.step_id) {
            return fail(
                "self-reference",
                format!("step {} depends on itself", step.step_id),
            );
        }
    }
    if let Some(cycle) = dag::find_cycle(&plan.steps) {
        return fail(
            "self-reference",
            format!("dependency cycle: {}", cycle.join(" -> ")),
        );
    }
    pass("self-reference")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Step, ToolRef};
    use std::collections::{BTreeMap, BTreeSet};

    fn step(id: &str, tool: &str) -> Step {
        Step {
            step_id: id.to_owned(),
            title: id.to_owned(),
            tool_ref: ToolRef {
                name: tool.to_owned(),
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

    fn plan_with(steps: Vec<Step>) -> Plan {
        let mut plan = Plan::done("goal");
        plan.steps = steps;
        plan
    }

    fn tools() -> Vec<ToolSpec> {
        let mut fetch = ToolSpec::new("fetch", "fetch a url");
        fetch.input_schema = serde_json::json!({"required": ["url"]});
        vec![ToolSpec::new("echo", "echo"), fetch]
    }

    #[test]
    fn test_all_pass_on_clean_plan() {
        let mut s = step("a", "fetch");
        s.input = serde_json::json!({"url": "https://example.com"});
        let plan = plan_with(vec![s, step("b", "echo")]);
        let limits = Limits::default();
        let tools = tools();
        let findings = run_critics(&plan, &CriticContext {
            tools: &tools,
            limits: &limits,
        });
        assert!(!has_blocking_failure(&findings));
        assert_eq!(findings.len(), 4);
    }

    #[test]
    fn test_unknown_tool_fails() {
        let plan = plan_with(vec![step("a", "ghost")]);
        let limits = Limits::default();
        let tools = tools();
        let findings = run_critics(&plan, &CriticContext {
            tools: &tools,
            limits: &limits,
        });
        assert!(has_blocking_failure(&findings));
        let finding = findings
            .iter()
            .find(|f| f.name == "unknown-tool")
            .expect("finding");
        assert!(!finding.passed);
    }

    #[test]
    fn test_missing_required_input_fails() {
        let plan = plan_with(vec![step("a", "fetch")]);
        let limits = Limits::default();
        let tools = tools();
        let findings = run_critics(&plan, &CriticContext {
            tools: &tools,
            limits: &limits,
        });
        let finding = findings
            .iter()
            .find(|f| f.name == "tool-input")
            .expect("finding");
        assert!(!finding.passed);
        assert!(finding
            .message
            .as_deref()
            .is_some_and(|m| m.contains("a.url")));
    }

    #[test]
    fn test_input_from_binding_satisfies_requirement() {
        let mut s = step("b", "fetch");
        s.input_from
            .insert("url".to_owned(), "a.output.url".to_owned());
        let plan = plan_with(vec![step("a", "echo"), s]);
        let limits = Limits::default();
        let tools = tools();
        let findings = run_critics(&plan, &CriticContext {
            tools: &tools,
            limits: &limits,
        });
        let finding = findings
            .iter()
            .find(|f| f.name == "tool-input")
            .expect("finding");
        assert!(finding.passed);
    }

    #[test]
    fn test_step_limit_fails_oversized_plan() {
        let steps: Vec<Step> = (0..6).map(|i| step(&format!("s{i}"), "echo")).collect();
        let plan = plan_with(steps);
        let mut limits = Limits::default();
        limits.max_steps = 5;
        let tools = tools();
        let findings = run_critics(&plan, &CriticContext {
            tools: &tools,
            limits: &limits,
        });
        let finding = findings
            .iter()
            .find(|f| f.name == "step-limit")
            .expect("finding");
        assert!(!finding.passed);
    }

    #[test]
    fn test_circular_dependency_fails() {
        let mut a = step("a", "echo");
        a.depends_on.insert("b".to_owned());
        let mut b = step("b", "echo");
        b.depends_on.insert("a".to_owned());
        let plan = plan_with(vec![a, b]);
        let limits = Limits::default();
        let tools = tools();
        let findings = run_critics(&plan, &CriticContext {
            tools: &tools,
            limits: &limits,
        });
        let finding = findings
            .iter()
            .find(|f| f.name == "self-reference")
            .expect("finding");
        assert!(!finding.passed);
    }

    #[test]
    fn test_self_dependency_fails() {
        let mut a = step("a", "echo");
        a.depends_on.insert("a".to_owned());
        let plan = plan_with(vec![a]);
        let limits = Limits::default();
        let tools = tools();
        let findings = run_critics(&plan, &CriticContext {
            tools: &tools,
            limits: &limits,
        });
        assert!(has_blocking_failure(&findings));
    }
}
