// ABOUTME: Execution pipeline and public workflow engine API
// ABOUTME: Dispatches eligible tasks, enforces retry/timeout policy, invokes hooks

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::context::{HookEvent, TaskContext, WorkflowHandle};
use super::describe;
use super::error::Result;
use super::log::RunLog;
use super::scheduler::{AddOutcome, RunState};
use crate::workflow::{TaskHook, TaskResults, TaskSpec, TaskState, WorkflowStatus};

#[derive(Default, Clone)]
pub(crate) struct WorkflowHooks {
    pub on_task_start: Option<TaskHook>,
    pub on_task_complete: Option<TaskHook>,
    pub on_task_error: Option<TaskHook>,
}

pub(crate) struct EngineInner {
    name: String,
    run_id: Uuid,
    verbose: bool,
    hooks: WorkflowHooks,
    limiter: Option<Arc<Semaphore>>,
    state: Mutex<RunState>,
    settled: Notify,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().expect("run state mutex poisoned")
    }

    // The verbosity flag promotes lifecycle events from debug to info.
    fn emit(&self, detail: &str) {
        if self.verbose {
            info!(workflow = %self.name, run_id = %self.run_id, "{}", detail);
        } else {
            debug!(workflow = %self.name, run_id = %self.run_id, "{}", detail);
        }
    }

    fn dispatch(self: &Arc<Self>, name: String) {
        let inner = Arc::clone(self);
        tokio::spawn(run_task(inner, name));
    }

    pub(crate) fn add_task(self: &Arc<Self>, spec: TaskSpec) -> Result<()> {
        let name = spec.name().to_string();
        let outcome = self.lock().add_task(spec)?;

        match outcome {
            AddOutcome::Duplicate => {
                self.emit(&format!("task '{}' already exists; add ignored", name));
            }
            AddOutcome::Added { dispatch } => {
                self.emit(&format!("task '{}' added", name));
                if dispatch {
                    self.dispatch(name);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn results(&self) -> TaskResults {
        self.lock().results.clone()
    }

    pub(crate) fn status(&self) -> WorkflowStatus {
        self.lock().status
    }

    pub(crate) fn task_state(&self, name: &str) -> Option<TaskState> {
        self.lock().states.get(name).copied()
    }

    pub(crate) fn log(&self) -> RunLog {
        self.lock().log.clone()
    }

    pub(crate) fn dependency_map(&self) -> HashMap<String, HashSet<String>> {
        self.lock().dependency_map()
    }

    fn fire_start_hooks(&self, spec: &TaskSpec, event: &HookEvent) {
        if let Some(hook) = &spec.hooks.on_start {
            hook(event);
        }
        if let Some(hook) = &self.hooks.on_task_start {
            hook(event);
        }
    }

    fn fire_complete_hooks(&self, spec: &TaskSpec, event: &HookEvent) {
        if let Some(hook) = &spec.hooks.on_complete {
            hook(event);
        }
        if let Some(hook) = &self.hooks.on_task_complete {
            hook(event);
        }
    }

    fn fire_error_hooks(&self, spec: &TaskSpec, event: &HookEvent) {
        if let Some(hook) = &spec.hooks.on_error {
            hook(event);
        }
        if let Some(hook) = &self.hooks.on_task_error {
            hook(event);
        }
    }
}

/// One full execution cycle for a task whose eligibility gate has opened:
/// run-if check, hooks, retry loop with per-attempt timeout, terminal state
/// recording, trigger propagation. Nothing raised by the action escapes this
/// function; failure is recorded, not propagated.
async fn run_task(inner: Arc<EngineInner>, name: String) {
    let _permit = match &inner.limiter {
        Some(limiter) => Some(
            Arc::clone(limiter)
                .acquire_owned()
                .await
                .expect("concurrency limiter closed"),
        ),
        None => None,
    };

    let handle = WorkflowHandle::new(&inner);
    let (spec, gate_snapshot) = {
        let state = inner.lock();
        let spec = state
            .specs
            .get(&name)
            .cloned()
            .expect("dispatched task missing from registry");
        (spec, state.results.clone())
    };

    if let Some(run_if) = &spec.run_if {
        if !run_if(&gate_snapshot) {
            let done = inner
                .lock()
                .record_skip(&name, &format!("task '{}' skipped: run_if predicate was false", name));
            inner.emit(&format!("task '{}' skipped", name));
            if done {
                inner.settled.notify_waiters();
            }
            return;
        }
    }

    inner.lock().record_running(&name);
    inner.emit(&format!("task '{}' started", name));

    let start_event = HookEvent {
        workflow_name: inner.name.clone(),
        task: name.clone(),
        attempt: 1,
        state: TaskState::Running,
        error: None,
        workflow: handle.clone(),
    };
    inner.fire_start_hooks(&spec, &start_event);

    let policy = spec.retry.clone();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let results = inner.lock().results.clone();
        let ctx = TaskContext {
            workflow_name: inner.name.clone(),
            run_id: inner.run_id,
            task: name.clone(),
            attempt,
            results,
            workflow: handle.clone(),
        };

        let outcome = match spec.timeout {
            Some(limit) => match timeout(limit, spec.action.call(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("attempt timed out after {:?}", limit)),
            },
            None => spec.action.call(ctx).await,
        };

        match outcome {
            Ok(value) => {
                finish_completed(&inner, &spec, &name, value, attempt, &handle);
                return;
            }
            Err(error) => {
                let detail = format!(
                    "attempt {}/{} failed: {:#}",
                    attempt, policy.max_attempts, error
                );
                let error_event = HookEvent {
                    workflow_name: inner.name.clone(),
                    task: name.clone(),
                    attempt,
                    state: TaskState::Running,
                    error: Some(format!("{:#}", error)),
                    workflow: handle.clone(),
                };
                inner.fire_error_hooks(&spec, &error_event);
                inner.lock().record_attempt_failure(&name, attempt, &detail);
                inner.emit(&format!("task '{}' {}", name, detail));

                if attempt >= policy.max_attempts {
                    let done = inner.lock().record_failure(
                        &name,
                        &format!("task '{}' failed permanently after {} attempt(s)", name, attempt),
                    );
                    inner.emit(&format!("task '{}' failed permanently", name));
                    if done {
                        inner.settled.notify_waiters();
                    }
                    return;
                }

                sleep(policy.delay_for(attempt - 1)).await;
            }
        }
    }
}

fn finish_completed(
    inner: &Arc<EngineInner>,
    spec: &TaskSpec,
    name: &str,
    value: serde_json::Value,
    attempt: u32,
    handle: &WorkflowHandle,
) {
    // The snapshot returned here is the results mapping as it stood
    // immediately after this task's own result was recorded; branch
    // predicates are evaluated against it.
    let results_after = inner.lock().record_completion(name, value, attempt);
    inner.emit(&format!("task '{}' completed", name));

    let complete_event = HookEvent {
        workflow_name: inner.name.clone(),
        task: name.to_string(),
        attempt,
        state: TaskState::Completed,
        error: None,
        workflow: handle.clone(),
    };
    inner.fire_complete_hooks(spec, &complete_event);

    let mut targets: Vec<String> = spec.next.clone();
    let mut matched = false;
    for branch in &spec.branches {
        if (branch.predicate)(&results_after) {
            matched = true;
            targets.extend(branch.targets().iter().cloned());
        }
    }
    if !matched {
        targets.extend(spec.default_targets.iter().cloned());
    }

    let (to_start, done) = {
        let mut state = inner.lock();
        let to_start = state.apply_triggers(name, &targets);
        let done = state.check_completion();
        (to_start, done)
    };

    for next in to_start {
        inner.dispatch(next);
    }
    if done {
        inner.emit("workflow completed");
        inner.settled.notify_waiters();
    }
}

pub struct WorkflowBuilder {
    name: String,
    tasks: Vec<TaskSpec>,
    hooks: WorkflowHooks,
    verbose: bool,
    concurrency_limit: Option<usize>,
}

impl WorkflowBuilder {
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    pub fn tasks(mut self, specs: impl IntoIterator<Item = TaskSpec>) -> Self {
        self.tasks.extend(specs);
        self
    }

    pub fn on_task_start<H>(mut self, hook: H) -> Self
    where
        H: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.on_task_start = Some(Arc::new(hook));
        self
    }

    pub fn on_task_complete<H>(mut self, hook: H) -> Self
    where
        H: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.on_task_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_task_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.on_task_error = Some(Arc::new(hook));
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Optional cap on concurrently running tasks. The default is
    /// uncapped fan-out: every eligible task is dispatched at once.
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit.max(1));
        self
    }

    pub fn build(self) -> Result<WorkflowEngine> {
        let state = RunState::new(self.tasks)?;

        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                name: self.name,
                run_id: Uuid::new_v4(),
                verbose: self.verbose,
                hooks: self.hooks,
                limiter: self
                    .concurrency_limit
                    .map(|limit| Arc::new(Semaphore::new(limit))),
                state: Mutex::new(state),
                settled: Notify::new(),
            }),
        })
    }
}

/// A live workflow run. Construction validates the task set; [`start`]
/// dispatches the roots; completion propagates reactively from there until
/// every known task is terminal.
///
/// [`start`]: WorkflowEngine::start
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            tasks: Vec::new(),
            hooks: WorkflowHooks::default(),
            verbose: false,
            concurrency_limit: None,
        }
    }

    pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Result<Self> {
        Self::builder(name).tasks(tasks).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// Begin scheduling. This is the non-blocking variant: the workflow is
    /// marked Running, every task with no incoming edges is dispatched, and
    /// the call returns immediately; scheduling is reactive from then on.
    /// Await [`join`] to block until the workflow settles.
    ///
    /// Must be called from within a tokio runtime. Calling it a second time
    /// is a configuration error.
    ///
    /// [`join`]: WorkflowEngine::join
    #[instrument(skip(self), fields(workflow = %self.inner.name, run_id = %self.inner.run_id))]
    pub fn start(&self) -> Result<()> {
        let (to_start, done) = self.inner.lock().begin(&self.inner.name)?;
        self.inner
            .emit(&format!("workflow '{}' started", self.inner.name));

        for name in to_start {
            self.inner.dispatch(name);
        }
        if done {
            self.inner.settled.notify_waiters();
        }
        Ok(())
    }

    /// Resolve once the workflow reaches a terminal status. A workflow
    /// stalled on a permanently failed predecessor never settles; callers
    /// needing liveness should wrap this in their own timeout.
    pub async fn join(&self) {
        loop {
            // Register interest before checking the status, so a settlement
            // between the check and the await cannot be missed.
            let mut notified = std::pin::pin!(self.inner.settled.notified());
            notified.as_mut().enable();
            if self.status().is_terminal() {
                return;
            }
            notified.await;
        }
    }

    /// Insert a task into the live run. Rejected with a logged
    /// `TaskAlreadyExists` event (not an error) when the name is taken;
    /// fails synchronously when a declared dependency is unknown. When the
    /// new task's predecessors are already completed and no trigger is
    /// pending against it, it starts immediately. Safe to call from inside
    /// any action or hook.
    pub fn add_task(&self, spec: TaskSpec) -> Result<()> {
        self.inner.add_task(spec)
    }

    /// Read-only snapshot of accumulated results of completed tasks.
    pub fn results(&self) -> TaskResults {
        self.inner.results()
    }

    /// Snapshot of the structured event log.
    pub fn log(&self) -> RunLog {
        self.inner.log()
    }

    /// Snapshot of the required-predecessor mapping.
    pub fn dependency_map(&self) -> HashMap<String, HashSet<String>> {
        self.inner.dependency_map()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.inner.status()
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.inner.task_state(name)
    }

    /// A cheap handle usable from outside the engine's own callbacks.
    pub fn handle(&self) -> WorkflowHandle {
        WorkflowHandle::new(&self.inner)
    }

    /// Human-oriented text rendering of the graph and current states. Not
    /// for control decisions.
    pub fn describe(&self) -> String {
        let state = self.inner.lock();
        describe::render_text(&self.inner.name, &state)
    }

    /// Graphviz DOT rendering of the routing graph. Not for control
    /// decisions.
    pub fn visualize(&self) -> String {
        let state = self.inner.lock();
        describe::render_dot(&state)
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("name", &self.inner.name)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}
