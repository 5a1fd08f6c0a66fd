// ABOUTME: Main library module for the signalbox workflow engine
// ABOUTME: Exports the task model and the trigger-driven scheduling engine

pub mod engine;
pub mod workflow;

// Re-export commonly used types
pub use engine::{
    EngineError, EventKind, HookEvent, LogEntry, RunLog, TaskContext, WorkflowBuilder,
    WorkflowEngine, WorkflowHandle,
};
pub use workflow::{Branch, RetryPolicy, TaskResults, TaskSpec, TaskState, WorkflowStatus};

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
