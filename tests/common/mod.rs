// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides probe-backed task specs for observing scheduling behavior

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use signalbox::{TaskContext, TaskSpec, WorkflowEngine};

/// Route engine tracing to the test writer; safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared event recorder; tasks and hooks push labels into it so tests can
/// assert on ordering and counts.
#[derive(Clone, Default)]
pub struct Probe {
    events: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, label: impl Into<String>) {
        self.events
            .lock()
            .expect("probe mutex poisoned")
            .push(label.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("probe mutex poisoned").clone()
    }

    pub fn count_of(&self, label: &str) -> usize {
        self.events().iter().filter(|e| *e == label).count()
    }

    /// Position of the first occurrence of `label`, if any.
    pub fn position_of(&self, label: &str) -> Option<usize> {
        self.events().iter().position(|e| e == label)
    }
}

/// A task that records its own execution and completes with its name as the
/// result value.
pub fn recording_task(name: &str, probe: &Probe) -> TaskSpec {
    let probe = probe.clone();
    let label = name.to_string();
    TaskSpec::new(name, move |_ctx: TaskContext| {
        let probe = probe.clone();
        let label = label.clone();
        async move {
            probe.push(label.clone());
            Ok(json!(label))
        }
    })
}

/// Like `recording_task`, but sleeps first so completion-order assertions
/// have something to bite on.
pub fn slow_task(name: &str, probe: &Probe, delay: Duration) -> TaskSpec {
    let probe = probe.clone();
    let label = name.to_string();
    TaskSpec::new(name, move |_ctx: TaskContext| {
        let probe = probe.clone();
        let label = label.clone();
        async move {
            tokio::time::sleep(delay).await;
            probe.push(label.clone());
            Ok(json!(label))
        }
    })
}

/// A task that completes with a fixed value.
pub fn value_task(name: &str, value: serde_json::Value) -> TaskSpec {
    TaskSpec::new(name, move |_ctx: TaskContext| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

/// A task that fails on its first `failures` attempts and succeeds after.
/// The counter records how many attempts actually ran.
pub fn flaky_task(name: &str, failures: u32, attempts: Arc<AtomicU32>) -> TaskSpec {
    let label = name.to_string();
    TaskSpec::new(name, move |_ctx: TaskContext| {
        let attempts = attempts.clone();
        let label = label.clone();
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= failures {
                anyhow::bail!("induced failure on attempt {}", attempt)
            }
            Ok(json!(label))
        }
    })
}

/// A task that always fails.
pub fn failing_task(name: &str) -> TaskSpec {
    TaskSpec::new(name, move |_ctx: TaskContext| async move {
        anyhow::bail!("induced failure")
    })
}

/// A task whose action never resolves; only a timeout gets it unstuck.
pub fn stuck_task(name: &str) -> TaskSpec {
    TaskSpec::new(name, move |_ctx: TaskContext| async move {
        std::future::pending::<()>().await;
        Ok(json!(null))
    })
}

/// Await workflow settlement, panicking if it takes longer than `limit`.
pub async fn join_within(engine: &WorkflowEngine, limit: Duration) {
    tokio::time::timeout(limit, engine.join())
        .await
        .expect("workflow did not settle in time");
}

/// Assert the workflow is still unsettled after `wait`.
pub async fn assert_stalled(engine: &WorkflowEngine, wait: Duration) {
    assert!(
        tokio::time::timeout(wait, engine.join()).await.is_err(),
        "workflow settled but a stall was expected"
    );
}
