// Task Errors
// Failure taxonomy recorded in a task's error aggregate

use thiserror::Error;

/// Errors a task records while validating or running.
///
/// Context (position, structure) lives on the aggregate entry, not here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Store unresolved or no valid action; the task never runs
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A validation check failed
    #[error("Invalid task: {0}")]
    Validation(String),

    /// The advisory position lock could not be taken; the position is skipped
    #[error("Could not lock position {position}")]
    ResourceLock { position: String },

    /// A stage collaborator failed for one position/structure
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    /// The optional dataset extraction collaborator is not installed
    #[error("Dataset extraction module is not available: cannot run {operation}")]
    ExtractionModuleMissing { operation: String },

    /// A unit panicked inside the executor
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
