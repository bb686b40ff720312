//! Step dependency graph helpers.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::Step;

/// Find step ids involved in a dependency cycle, if any.
///
/// Iterative depth-first search assigning finishing orders; any step that
/// never receives one sits on (or behind) a cycle. Dependencies on unknown
/// step ids are ignored here — the critics flag those separately.
pub fn find_cycle(steps: &[Step]) -> Option<Vec<String>> {
    let ids: BTreeSet<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
    let deps: BTreeMap<&str, Vec<&str>> = steps
        .iter()
        .map(|s| {
            let known: Vec<&str> = s
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| ids.contains(d))
                .collect();
            (s.step_id.as_str(), known)
        })
        .collect();

    let mut finished: BTreeSet<&str> = BTreeSet::new();
    let mut in_progress: BTreeSet<&str> = BTreeSet::new();

    for &start in &ids {
        if finished.contains(start) {
            continue;
        }
        // Explicit stack of (node, next-dependency-index).
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        in_progress.insert(start);

        while let Some((node, index)) = stack.pop() {
            let node_deps = deps.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if index < node_deps.len() {
                stack.push((node, index.saturating_add(1)));
                let dep = node_deps[index];
                if in_progress.contains(dep) && !finished.contains(dep) {
                    // Back edge — cycle. Report everything on the path.
                    let mut members: Vec<String> =
                        stack.iter().map(|(n, _)| (*n).to_owned()).collect();
                    members.push(dep.to_owned());
                    return Some(members);
                }
                if !finished.contains(dep) {
                    in_progress.insert(dep);
                    stack.push((dep, 0));
                }
            } else {
                finished.insert(node);
            }
        }
        in_progress.clear();
    }

    None
}

/// Step ids whose dependencies are all in `succeeded` and which are still
/// pending, in plan order.
pub fn ready_steps<'a>(
    steps: &'a [Step],
    is_pending: impl Fn(&str) -> bool,
    is_succeeded: impl Fn(&str) -> bool,
) -> Vec<&'a Step> {
    steps
        .iter()
        .filter(|s| is_pending(&s.step_id))
        .filter(|s| s.depends_on.iter().all(|d| is_succeeded(d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolRef;
    use std::collections::{BTreeMap, BTreeSet};

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            step_id: id.to_owned(),
            title: id.to_owned(),
            tool_ref: ToolRef {
                name: "echo".to_owned(),
            },
            input: serde_json::json!({}),
            success_criteria: None,
            failure_policy: Default::default(),
            timeout_ms: 1000,
            max_retries: 0,
            depends_on: deps.iter().map(|d| (*d).to_owned()).collect(),
            input_from: BTreeMap::new(),
        }
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])];
        assert!(find_cycle(&steps).is_none());
    }

    #[test]
    fn test_two_node_cycle_detected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let cycle = find_cycle(&steps).expect("cycle");
        assert!(cycle.contains(&"a".to_owned()));
        assert!(cycle.contains(&"b".to_owned()));
    }

    #[test]
    fn test_self_dependency_detected() {
        let steps = vec![step("a", &["a"])];
        assert!(find_cycle(&steps).is_some());
    }

    #[test]
    fn test_long_cycle_detected() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a", "d"]),
            step("c", &["b"]),
            step("d", &["c"]),
        ];
        assert!(find_cycle(&steps).is_some());
    }

    #[test]
    fn test_unknown_deps_ignored() {
        let steps = vec![step("a", &["ghost"])];
        assert!(find_cycle(&steps).is_none());
    }

    #[test]
    fn test_ready_steps_order_and_filtering() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &[])];
        let done: BTreeSet<&str> = BTreeSet::new();
        let ready = ready_steps(&steps, |_| true, |d| done.contains(d));
        let ids: Vec<&str> = ready.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let mut done = BTreeSet::new();
        done.insert("a");
        let ready = ready_steps(&steps, |id| id != "a", |d| done.contains(d));
        let ids: Vec<&str> = ready.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
