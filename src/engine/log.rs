// ABOUTME: Append-only structured record of task and workflow lifecycle events
// ABOUTME: One ordered sequence per task name plus one workflow-level sequence

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskSkipped,
    TaskAdded,
    TaskAlreadyExists,
    StartedWorkflow,
    WorkflowCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Attempt number, for events tied to one attempt of the pipeline.
    pub attempt: Option<u32>,
    /// Task or workflow status at the time the event was recorded.
    pub status: String,
    pub detail: String,
}

impl LogEntry {
    fn new(kind: EventKind, attempt: Option<u32>, status: String, detail: String) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            attempt,
            status,
            detail,
        }
    }
}

/// The run log is owned and written by the engine; callers read snapshots of
/// it. Entries are never removed or rewritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    tasks: IndexMap<String, Vec<LogEntry>>,
    workflow: Vec<LogEntry>,
}

impl RunLog {
    pub(crate) fn record_task(
        &mut self,
        task: &str,
        kind: EventKind,
        attempt: Option<u32>,
        status: impl ToString,
        detail: impl Into<String>,
    ) {
        self.tasks
            .entry(task.to_string())
            .or_default()
            .push(LogEntry::new(kind, attempt, status.to_string(), detail.into()));
    }

    pub(crate) fn record_workflow(
        &mut self,
        kind: EventKind,
        status: impl ToString,
        detail: impl Into<String>,
    ) {
        self.workflow
            .push(LogEntry::new(kind, None, status.to_string(), detail.into()));
    }

    /// Events recorded for one task, in order. Empty for unknown names.
    pub fn task_events(&self, task: &str) -> &[LogEntry] {
        self.tasks.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Workflow-level events, in order.
    pub fn workflow_events(&self) -> &[LogEntry] {
        &self.workflow
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.workflow.is_empty() && self.tasks.values().all(Vec::is_empty)
    }
}
