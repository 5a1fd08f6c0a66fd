// ABOUTME: Runtime context handed to task actions and lifecycle hooks
// ABOUTME: Carries read-only result snapshots and a handle back into the engine

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::error::{EngineError, Result};
use super::executor::EngineInner;
use super::log::RunLog;
use crate::workflow::{TaskResults, TaskSpec, TaskState, WorkflowStatus};

/// Per-attempt context passed to a task action. `results` is a snapshot taken
/// when the attempt begins and must be treated as read-only; mutation of the
/// live run goes through `workflow`.
#[derive(Clone)]
pub struct TaskContext {
    pub workflow_name: String,
    pub run_id: Uuid,
    pub task: String,
    pub attempt: u32,
    pub results: TaskResults,
    pub workflow: WorkflowHandle,
}

/// Event passed to lifecycle hooks. `error` is populated for `on_error`
/// invocations only.
#[derive(Clone)]
pub struct HookEvent {
    pub workflow_name: String,
    pub task: String,
    pub attempt: u32,
    pub state: TaskState,
    pub error: Option<String>,
    pub workflow: WorkflowHandle,
}

/// Cheap, cloneable reference into a live engine, safe to use from inside any
/// action or hook. Holds a weak reference so specs that capture a handle
/// cannot keep the engine alive on their own; operations on a handle that
/// outlived its engine return [`EngineError::Closed`].
#[derive(Clone)]
pub struct WorkflowHandle {
    inner: Weak<EngineInner>,
}

impl WorkflowHandle {
    pub(crate) fn new(inner: &Arc<EngineInner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    fn upgrade(&self) -> Result<Arc<EngineInner>> {
        self.inner.upgrade().ok_or(EngineError::Closed)
    }

    /// Insert a task into the live run. See [`WorkflowEngine::add_task`].
    ///
    /// [`WorkflowEngine::add_task`]: super::executor::WorkflowEngine::add_task
    pub fn add_task(&self, spec: TaskSpec) -> Result<()> {
        self.upgrade()?.add_task(spec)
    }

    pub fn results(&self) -> Result<TaskResults> {
        Ok(self.upgrade()?.results())
    }

    pub fn status(&self) -> Result<WorkflowStatus> {
        Ok(self.upgrade()?.status())
    }

    pub fn task_state(&self, name: &str) -> Result<Option<TaskState>> {
        Ok(self.upgrade()?.task_state(name))
    }

    pub fn log(&self) -> Result<RunLog> {
        Ok(self.upgrade()?.log())
    }

    pub fn dependency_map(&self) -> Result<HashMap<String, HashSet<String>>> {
        Ok(self.upgrade()?.dependency_map())
    }
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle").finish_non_exhaustive()
    }
}
