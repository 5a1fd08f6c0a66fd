// ABOUTME: Human-oriented renderings of the routing graph and run state
// ABOUTME: Text and Graphviz DOT output only; never consulted for scheduling

use petgraph::dot::Dot;
use std::fmt::Write;

use super::scheduler::RunState;
use crate::workflow::TaskState;

pub(crate) fn render_text(workflow: &str, state: &RunState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "workflow '{}' [{}]", workflow, state.status);

    for (name, spec) in &state.specs {
        let task_state = state
            .states
            .get(name)
            .copied()
            .unwrap_or(TaskState::Pending);
        let mut required: Vec<String> = state.graph.required_of(name).into_iter().collect();
        required.sort();

        let _ = write!(out, "  {} [{}]", name, task_state);
        if !required.is_empty() {
            let _ = write!(out, " after {}", required.join(", "));
        }
        if !spec.next.is_empty() {
            let _ = write!(out, " -> {}", spec.next.join(", "));
        }
        if !spec.branches.is_empty() {
            let branch_targets: Vec<&str> = spec
                .branches
                .iter()
                .flat_map(|b| b.targets().iter().map(String::as_str))
                .collect();
            let _ = write!(out, " ?> {}", branch_targets.join(", "));
        }
        if !spec.default_targets.is_empty() {
            let _ = write!(out, " |> {}", spec.default_targets.join(", "));
        }
        let _ = writeln!(out);
    }

    out
}

pub(crate) fn render_dot(state: &RunState) -> String {
    format!("{}", Dot::new(state.graph.inner()))
}
