// ABOUTME: Error types for engine configuration and lifecycle operations
// ABOUTME: Attempt-level failures are recorded in the run log, never raised here

use thiserror::Error;

/// Configuration and lifecycle errors reported synchronously to callers.
/// Failures inside task actions never surface through this type; they are
/// retried per policy and recorded in the run log.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{task}' depends on itself")]
    SelfDependency { task: String },

    #[error("workflow '{workflow}' has already been started")]
    AlreadyStarted { workflow: String },

    #[error("workflow handle is no longer attached to a live engine")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
