// ABOUTME: Dependency graph construction and incremental extension
// ABOUTME: Derives required-predecessor sets and trigger adjacency from task specs

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeFiltered, EdgeRef};
use petgraph::{Direction, algo};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use super::error::{EngineError, Result};
use crate::workflow::TaskSpec;
use indexmap::IndexMap;

/// The three edge kinds of the routing graph. Only `Dependency` and `Next`
/// contribute to a task's AND-join; `Next`, `Branch`, and `Fallback` carry
/// trigger signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Dependency,
    Next,
    Branch,
    Fallback,
}

impl EdgeKind {
    pub fn joins(&self) -> bool {
        matches!(self, EdgeKind::Dependency | EdgeKind::Next)
    }

    pub fn triggers(&self) -> bool {
        matches!(self, EdgeKind::Next | EdgeKind::Branch | EdgeKind::Fallback)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EdgeKind::Dependency => "dependency",
            EdgeKind::Next => "next",
            EdgeKind::Branch => "branch",
            EdgeKind::Fallback => "fallback",
        };
        write!(f, "{}", label)
    }
}

/// Structural adjacency over task names. Edge targets may reference tasks not
/// yet registered; such edges are parked and resolved when the target
/// appears. Dependency references, by contrast, must resolve at registration
/// time.
pub struct TaskGraph {
    graph: DiGraph<String, EdgeKind>,
    indices: HashMap<String, NodeIndex>,
    // target name -> (source name, kind) for edges whose target is not registered yet
    pending: HashMap<String, Vec<(String, EdgeKind)>>,
}

impl TaskGraph {
    /// Build the graph from the full task set. Pure function of the specs;
    /// safe to re-run at any time.
    pub fn build(specs: &IndexMap<String, Arc<TaskSpec>>) -> Result<Self> {
        let mut built = Self {
            graph: DiGraph::new(),
            indices: HashMap::new(),
            pending: HashMap::new(),
        };

        // Register every node first so tasks of the same set may reference
        // each other regardless of declaration order.
        for name in specs.keys() {
            built.add_node(name);
        }
        for spec in specs.values() {
            built.wire(spec)?;
        }

        built.warn_on_join_cycles();
        Ok(built)
    }

    /// Incrementally extend the graph with one new task: register its node,
    /// wire its edges, and resolve any parked edges that were waiting for it.
    /// The rest of the graph is left untouched.
    pub fn extend(&mut self, spec: &TaskSpec) -> Result<()> {
        let idx = self.add_node(&spec.name);

        if let Some(parked) = self.pending.remove(&spec.name) {
            for (source, kind) in parked {
                let source_idx = self.indices[&source];
                self.graph.add_edge(source_idx, idx, kind);
            }
        }

        self.wire(spec)
    }

    fn add_node(&mut self, name: &str) -> NodeIndex {
        match self.indices.get(name) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_node(name.to_string());
                self.indices.insert(name.to_string(), idx);
                idx
            }
        }
    }

    fn wire(&mut self, spec: &TaskSpec) -> Result<()> {
        let task_idx = self.indices[&spec.name];

        for dependency in &spec.dependencies {
            if dependency == &spec.name {
                return Err(EngineError::SelfDependency {
                    task: spec.name.clone(),
                });
            }
            match self.indices.get(dependency) {
                Some(&dep_idx) => {
                    self.graph.add_edge(dep_idx, task_idx, EdgeKind::Dependency);
                }
                None => {
                    return Err(EngineError::UnknownDependency {
                        task: spec.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        for target in &spec.next {
            self.add_outgoing(&spec.name, target, EdgeKind::Next);
        }
        for branch in &spec.branches {
            for target in branch.targets() {
                self.add_outgoing(&spec.name, target, EdgeKind::Branch);
            }
        }
        for target in &spec.default_targets {
            self.add_outgoing(&spec.name, target, EdgeKind::Fallback);
        }

        Ok(())
    }

    fn add_outgoing(&mut self, source: &str, target: &str, kind: EdgeKind) {
        let source_idx = self.indices[source];
        match self.indices.get(target) {
            Some(&target_idx) => {
                self.graph.add_edge(source_idx, target_idx, kind);
            }
            None => {
                // Target not registered yet; resolve when it appears.
                self.pending
                    .entry(target.to_string())
                    .or_default()
                    .push((source.to_string(), kind));
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Tasks that must be Completed before `name` may start: declared
    /// dependencies plus sources of incoming unconditional edges.
    pub fn required_of(&self, name: &str) -> HashSet<String> {
        let Some(&idx) = self.indices.get(name) else {
            return HashSet::new();
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .filter(|edge| edge.weight().joins())
            .map(|edge| self.graph[edge.source()].clone())
            .collect()
    }

    /// Whether `name` is the target of any trigger-carrying edge. Tasks that
    /// are not (their in-edges are all dependency declarations, or they have
    /// none) need no trigger signal to become eligible.
    pub fn is_trigger_gated(&self, name: &str) -> bool {
        let Some(&idx) = self.indices.get(name) else {
            return false;
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .any(|edge| edge.weight().triggers())
    }

    /// Tasks that declared `name` as a dependency. Re-evaluated on `name`'s
    /// completion, since dependency edges carry no trigger of their own.
    pub fn dependency_dependents(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.indices.get(name) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|edge| *edge.weight() == EdgeKind::Dependency)
            .map(|edge| self.graph[edge.target()].clone())
            .collect()
    }

    /// Tasks whose AND-join includes `name` (declared dependency or
    /// unconditional successor). Used to surface stalls when `name` fails.
    pub fn join_dependents(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.indices.get(name) else {
            return Vec::new();
        };
        let mut dependents: Vec<String> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|edge| edge.weight().joins())
            .map(|edge| self.graph[edge.target()].clone())
            .collect();
        dependents.sort();
        dependents.dedup();
        dependents
    }

    /// Tasks with no incoming edges of any kind; dispatched at workflow start.
    pub fn roots(&self) -> Vec<String> {
        self.indices
            .iter()
            .filter(|&(_, &idx)| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Full required-predecessor mapping, for introspection snapshots.
    pub fn required_map(&self) -> HashMap<String, HashSet<String>> {
        self.indices
            .keys()
            .map(|name| (name.clone(), self.required_of(name)))
            .collect()
    }

    pub(crate) fn inner(&self) -> &DiGraph<String, EdgeKind> {
        &self.graph
    }

    // A cycle among join edges can never make progress; the run stalls on it
    // exactly as it would on a permanently failed predecessor.
    fn warn_on_join_cycles(&self) {
        let joins = EdgeFiltered::from_fn(&self.graph, |edge| edge.weight().joins());
        if algo::is_cyclic_directed(&joins) {
            warn!("workflow graph contains a dependency cycle; the tasks on it will never start");
        }
    }
}
