use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic dependency: {from} -> {to}")]
    CyclicDependency { from: String, to: String },

    #[error("Flow block mismatch at {task}: {reason}")]
    FlowBlockMismatch { task: String, reason: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Execution report for {task} dropped: {reason}")]
    ExecutionReport { task: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(crate::core::JobId),

    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

impl Error {
    pub(crate) fn mismatch(task: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::FlowBlockMismatch {
            task: task.to_string(),
            reason: reason.into(),
        }
    }

    /// Report errors are recoverable: the caller logs and drops them.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ExecutionReport { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
