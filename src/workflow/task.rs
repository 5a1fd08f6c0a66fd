// ABOUTME: Task specification structures and routing metadata
// ABOUTME: Defines actions, dependencies, branch predicates, retry policies, and hooks

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::context::{HookEvent, TaskContext};

/// Accumulated results of the run so far, keyed by task name. Only tasks that
/// reached `Completed` appear in it. Predicates and actions receive a snapshot
/// and must treat it as read-only.
pub type TaskResults = IndexMap<String, Value>;

/// Predicate over the accumulated results, used by `branches` and `run_if`.
pub type ResultPredicate = Arc<dyn Fn(&TaskResults) -> bool + Send + Sync>;

/// Synchronous lifecycle callback. Task-scoped hooks fire before their
/// workflow-scoped counterparts.
pub type TaskHook = Arc<dyn Fn(&HookEvent) + Send + Sync>;

/// The unit of work behind a task. Implemented for any
/// `Fn(TaskContext) -> impl Future<Output = anyhow::Result<Value>>` closure,
/// so most callers never implement it by hand.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn call(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> TaskAction for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self)(ctx).await
    }
}

/// A conditional edge set: when `predicate` is true against the accumulated
/// results, every task in `targets` receives a trigger signal. Branches are
/// evaluated in declaration order and independently; more than one may fire.
#[derive(Clone)]
pub struct Branch {
    pub(crate) predicate: ResultPredicate,
    pub(crate) targets: Vec<String>,
}

impl Branch {
    pub fn new<P>(predicate: P, targets: impl IntoIterator<Item = impl Into<String>>) -> Self
    where
        P: Fn(&TaskResults) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the first re-attempt.
    pub delay: Duration,
    /// Multiplier applied to `delay` for each subsequent re-attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on any single inter-attempt delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Retry with the same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff_multiplier: 1.0,
            max_delay: Some(delay),
        }
    }

    /// Retry with exponentially growing delays.
    pub fn exponential_backoff(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: initial_delay,
            backoff_multiplier: multiplier,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay preceding re-attempt number `attempt + 2` (0-indexed over the
    /// inter-attempt gaps).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms =
            (self.delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32)) as u64;
        let delay = Duration::from_millis(delay_ms);

        match self.max_delay {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }
}

#[derive(Default, Clone)]
pub(crate) struct TaskHooks {
    pub on_start: Option<TaskHook>,
    pub on_complete: Option<TaskHook>,
    pub on_error: Option<TaskHook>,
}

/// Description of one unit of work plus its routing metadata. Built once,
/// handed to the engine, and never mutated afterwards; all run-time state
/// lives in the scheduler.
#[derive(Clone)]
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) action: Arc<dyn TaskAction>,
    pub(crate) dependencies: Vec<String>,
    pub(crate) next: Vec<String>,
    pub(crate) branches: Vec<Branch>,
    pub(crate) default_targets: Vec<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: RetryPolicy,
    pub(crate) run_if: Option<ResultPredicate>,
    pub(crate) hooks: TaskHooks,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::with_action(name, action)
    }

    /// Construct from any [`TaskAction`] implementation; [`new`] is the
    /// closure-friendly shorthand.
    ///
    /// [`new`]: TaskSpec::new
    pub fn with_action(name: impl Into<String>, action: impl TaskAction + 'static) -> Self {
        Self {
            name: name.into(),
            action: Arc::new(action),
            dependencies: Vec::new(),
            next: Vec::new(),
            branches: Vec::new(),
            default_targets: Vec::new(),
            timeout: None,
            retry: RetryPolicy::default(),
            run_if: None,
            hooks: TaskHooks::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks that must reach `Completed` before this one may be attempted
    /// (AND semantics; combined with incoming unconditional edges).
    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Tasks unconditionally triggered when this one completes.
    pub fn next(mut self, targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.next.extend(targets.into_iter().map(Into::into));
        self
    }

    /// Conditional edge evaluated in declaration order on completion.
    pub fn branch<P>(
        mut self,
        predicate: P,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self
    where
        P: Fn(&TaskResults) -> bool + Send + Sync + 'static,
    {
        self.branches.push(Branch::new(predicate, targets));
        self
    }

    /// Tasks triggered on completion only when no branch predicate matched.
    pub fn default_targets(mut self, targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.default_targets
            .extend(targets.into_iter().map(Into::into));
        self
    }

    /// Bound on a single attempt. At expiry the attempt future is dropped
    /// (cancelled at its next await point) and the attempt counts as failed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// When present and false at dispatch time, the task is Skipped without
    /// running. A skipped task fires no hooks and no outgoing edges.
    pub fn run_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&TaskResults) -> bool + Send + Sync + 'static,
    {
        self.run_if = Some(Arc::new(predicate));
        self
    }

    pub fn on_start<H>(mut self, hook: H) -> Self
    where
        H: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_complete<H>(mut self, hook: H) -> Self
    where
        H: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.on_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("next", &self.next)
            .field("branches", &self.branches.len())
            .field("default_targets", &self.default_targets)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

// Default value functions
fn default_max_attempts() -> u32 {
    1
}

fn default_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}
