// ABOUTME: Trigger and eligibility state machine for a live workflow run
// ABOUTME: Tracks name sets, trigger flags, edge propagation, and completion detection

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{EngineError, Result};
use super::graph::TaskGraph;
use super::log::{EventKind, RunLog};
use crate::workflow::{TaskResults, TaskSpec, TaskState, WorkflowStatus};

pub(crate) enum AddOutcome {
    /// Registered; `dispatch` is true when the task is already eligible and
    /// has been claimed for immediate execution.
    Added { dispatch: bool },
    /// A task of that name already exists; rejection logged, nothing changed.
    Duplicate,
}

/// All mutable state of a run. Methods are plain state transitions: no I/O,
/// no user code, no awaiting. The executor holds this behind a mutex and
/// keeps every transition atomic with respect to the others.
pub(crate) struct RunState {
    pub specs: IndexMap<String, Arc<TaskSpec>>,
    pub graph: TaskGraph,
    pub states: IndexMap<String, TaskState>,
    pub results: TaskResults,
    pub status: WorkflowStatus,
    pub log: RunLog,
    /// Names that have received at least one trigger signal. May contain
    /// names with no registered task yet; the signal is remembered until the
    /// task appears.
    triggered: HashSet<String>,
    /// Names claimed for dispatch. Guards against re-entrant triggers.
    started: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
}

impl RunState {
    pub fn new(tasks: Vec<TaskSpec>) -> Result<Self> {
        let mut specs: IndexMap<String, Arc<TaskSpec>> = IndexMap::with_capacity(tasks.len());
        let mut log = RunLog::default();

        for task in tasks {
            if specs.contains_key(task.name()) {
                // First registration wins; the duplicate is dropped, not an error.
                log.record_task(
                    task.name(),
                    EventKind::TaskAlreadyExists,
                    None,
                    TaskState::Pending,
                    format!("task '{}' already exists; registration ignored", task.name()),
                );
                continue;
            }
            specs.insert(task.name().to_string(), Arc::new(task));
        }

        let graph = TaskGraph::build(&specs)?;
        let states = specs.keys().map(|n| (n.clone(), TaskState::Pending)).collect();

        Ok(Self {
            specs,
            graph,
            states,
            results: TaskResults::new(),
            status: WorkflowStatus::Pending,
            log,
            triggered: HashSet::new(),
            started: HashSet::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            skipped: HashSet::new(),
        })
    }

    /// The eligibility gate: a pending, unclaimed task may start once it has
    /// been triggered (or needs no trigger, having no trigger-carrying
    /// in-edges) and every required predecessor is Completed.
    fn is_eligible(&self, name: &str) -> bool {
        if self.started.contains(name) {
            return false;
        }
        if self.states.get(name) != Some(&TaskState::Pending) {
            return false;
        }
        let gate = self.triggered.contains(name) || !self.graph.is_trigger_gated(name);
        gate && self
            .graph
            .required_of(name)
            .iter()
            .all(|p| self.completed.contains(p))
    }

    /// Claim every eligible candidate for dispatch, at most once each.
    fn claim(&mut self, candidates: impl IntoIterator<Item = String>) -> Vec<String> {
        if self.status != WorkflowStatus::Running {
            return Vec::new();
        }
        let mut claimed = Vec::new();
        for name in candidates {
            if claimed.contains(&name) || !self.is_eligible(&name) {
                continue;
            }
            self.started.insert(name.clone());
            claimed.push(name);
        }
        claimed
    }

    /// Transition the workflow to Running, rebuild the graph from the current
    /// task set, and claim the roots. Returns the tasks to dispatch and
    /// whether the workflow is already complete (empty task set).
    pub fn begin(&mut self, workflow: &str) -> Result<(Vec<String>, bool)> {
        if self.status != WorkflowStatus::Pending {
            return Err(EngineError::AlreadyStarted {
                workflow: workflow.to_string(),
            });
        }

        self.graph = TaskGraph::build(&self.specs)?;
        self.status = WorkflowStatus::Running;
        self.log.record_workflow(
            EventKind::StartedWorkflow,
            self.status,
            format!("workflow '{}' started with {} task(s)", workflow, self.specs.len()),
        );

        let candidates: Vec<String> = self.specs.keys().cloned().collect();
        let to_start = self.claim(candidates);
        let done = self.check_completion();
        Ok((to_start, done))
    }

    pub fn record_running(&mut self, name: &str) {
        self.states.insert(name.to_string(), TaskState::Running);
        self.log.record_task(
            name,
            EventKind::TaskStarted,
            Some(1),
            TaskState::Running,
            format!("task '{}' started", name),
        );
        debug!(task = %name, "task started");
    }

    /// Record a successful attempt: the result becomes visible to predicates
    /// and the returned snapshot is exactly the mapping as of that moment.
    pub fn record_completion(&mut self, name: &str, value: Value, attempt: u32) -> TaskResults {
        self.results.insert(name.to_string(), value);
        self.states.insert(name.to_string(), TaskState::Completed);
        self.completed.insert(name.to_string());
        self.log.record_task(
            name,
            EventKind::TaskCompleted,
            Some(attempt),
            TaskState::Completed,
            format!("task '{}' completed on attempt {}", name, attempt),
        );
        debug!(task = %name, attempt, "task completed");
        self.results.clone()
    }

    /// Deliver trigger signals from `source` to `targets`, then re-evaluate
    /// every task whose gate may have opened: the targets themselves plus the
    /// tasks that declared `source` as a dependency. Signals to
    /// already-started tasks are no-ops; signals to unregistered names are
    /// remembered.
    pub fn apply_triggers(&mut self, source: &str, targets: &[String]) -> Vec<String> {
        for target in targets {
            self.triggered.insert(target.clone());
        }

        let mut candidates: Vec<String> = targets.to_vec();
        candidates.extend(self.graph.dependency_dependents(source));
        self.claim(candidates)
    }

    /// One failed attempt out of possibly several; the task keeps Running.
    pub fn record_attempt_failure(&mut self, name: &str, attempt: u32, detail: &str) {
        self.log.record_task(
            name,
            EventKind::TaskFailed,
            Some(attempt),
            TaskState::Running,
            detail,
        );
        debug!(task = %name, attempt, detail, "task attempt failed");
    }

    /// All attempts exhausted. Dependents blocked on this task will never
    /// start; that stall is deliberate and surfaced here, not cascaded.
    pub fn record_failure(&mut self, name: &str, detail: &str) -> bool {
        self.states.insert(name.to_string(), TaskState::Failed);
        self.failed.insert(name.to_string());
        self.log.record_task(
            name,
            EventKind::TaskFailed,
            None,
            TaskState::Failed,
            detail,
        );

        let blocked = self.graph.join_dependents(name);
        if blocked.is_empty() {
            warn!(task = %name, detail, "task failed permanently");
        } else {
            warn!(
                task = %name,
                detail,
                ?blocked,
                "task failed permanently; join-dependent tasks can no longer start"
            );
        }

        self.check_completion()
    }

    /// Run-if gate closed: terminal without running. Fires no hooks and no
    /// outgoing edges, so unconditional successors stay blocked exactly as if
    /// the task had never started.
    pub fn record_skip(&mut self, name: &str, detail: &str) -> bool {
        self.states.insert(name.to_string(), TaskState::Skipped);
        self.skipped.insert(name.to_string());
        self.log.record_task(
            name,
            EventKind::TaskSkipped,
            None,
            TaskState::Skipped,
            detail,
        );
        debug!(task = %name, detail, "task skipped");

        self.check_completion()
    }

    /// The workflow completes when every known task is terminal. Tasks left
    /// Pending behind a failed join keep the workflow Running indefinitely.
    pub fn check_completion(&mut self) -> bool {
        if self.status != WorkflowStatus::Running {
            return false;
        }
        let terminal = self.completed.len() + self.failed.len() + self.skipped.len();
        if terminal < self.specs.len() {
            return false;
        }

        self.status = WorkflowStatus::Completed;
        self.log.record_workflow(
            EventKind::WorkflowCompleted,
            self.status,
            format!(
                "workflow completed: {} succeeded, {} failed, {} skipped",
                self.completed.len(),
                self.failed.len(),
                self.skipped.len()
            ),
        );
        true
    }

    /// Register one task into the live run and extend the graph around it,
    /// without disturbing any in-flight state.
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<AddOutcome> {
        let name = spec.name().to_string();

        if self.specs.contains_key(&name) {
            let state = self.states.get(&name).copied().unwrap_or(TaskState::Pending);
            self.log.record_task(
                &name,
                EventKind::TaskAlreadyExists,
                None,
                state,
                format!("task '{}' already exists; add_task ignored", name),
            );
            debug!(task = %name, "add_task ignored: name already registered");
            return Ok(AddOutcome::Duplicate);
        }

        // Validate before touching any state so a configuration error leaves
        // no half-registered task behind.
        for dependency in &spec.dependencies {
            if dependency == &name {
                return Err(EngineError::SelfDependency { task: name });
            }
            if !self.specs.contains_key(dependency) {
                return Err(EngineError::UnknownDependency {
                    task: name,
                    dependency: dependency.clone(),
                });
            }
        }

        self.graph.extend(&spec)?;
        self.specs.insert(name.clone(), Arc::new(spec));
        self.states.insert(name.clone(), TaskState::Pending);
        self.log.record_task(
            &name,
            EventKind::TaskAdded,
            None,
            TaskState::Pending,
            format!("task '{}' added to live workflow", name),
        );

        let dispatch = !self.claim([name]).is_empty();
        Ok(AddOutcome::Added { dispatch })
    }

    pub fn dependency_map(&self) -> HashMap<String, HashSet<String>> {
        self.graph.required_map()
    }
}
