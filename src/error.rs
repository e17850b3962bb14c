//! Error types for Tributary

use crate::models::TaskState;
use thiserror::Error;

/// Broad classification used by the scheduler and the CLI to decide how to
/// react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed workflow definition or configuration. Fatal for that workflow.
    Validation,
    /// Store or runtime unavailable. Retried on the next scheduler tick.
    Infrastructure,
    /// Rejected control-surface request (unknown run, illegal transition).
    Control,
}

/// Tributary error types
#[derive(Error, Debug)]
pub enum TributaryError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// YAML size exceeded limit
    #[error("Workflow YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Task count exceeded limit
    #[error("Task count {count} exceeds limit of {limit}")]
    TaskCountExceeded { count: usize, limit: usize },

    /// Task name validation error
    #[error("Task name '{name}' exceeds {max} characters")]
    TaskNameTooLong { name: String, max: usize },

    /// Invalid task name format
    #[error("Invalid task name '{name}': only alphanumeric, underscore, and dash allowed")]
    InvalidTaskName { name: String },

    #[error("Duplicate task name '{0}'")]
    DuplicateTask(String),

    /// DAG errors
    #[error("Cycle detected in DAG: {0}")]
    CycleDetected(String),

    /// Edge pointing at a task that does not exist
    #[error("Task '{task}' depends on non-existent task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    #[error("Task '{task}' references unknown unit '{unit}'")]
    UnknownUnit { task: String, unit: String },

    #[error("Task '{task}' has invalid params for unit '{unit}': {reason}")]
    InvalidParams {
        task: String,
        unit: String,
        reason: String,
    },

    #[error("Invalid schedule '{0}'")]
    InvalidSchedule(String),

    /// Command validation errors
    #[error("Command exceeds {limit} bytes")]
    CommandTooLong { limit: usize },

    /// Argument validation errors
    #[error("Argument count {count} exceeds limit of {limit}")]
    ArgCountExceeded { count: usize, limit: usize },

    #[error("Argument exceeds {limit} bytes")]
    ArgTooLong { limit: usize },

    /// Path validation errors
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path traversal attempt
    #[error("Path traversal detected in: {0}")]
    PathTraversal(String),

    /// Generic validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Orchestrator configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Store or runtime failure that is expected to clear up on its own
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal transition for task '{task}': {from} -> {to}")]
    IllegalTransition {
        task: String,
        from: TaskState,
        to: TaskState,
    },

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl TributaryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TributaryError::YamlParse(_)
            | TributaryError::YamlSizeExceeded(_)
            | TributaryError::TaskCountExceeded { .. }
            | TributaryError::TaskNameTooLong { .. }
            | TributaryError::InvalidTaskName { .. }
            | TributaryError::DuplicateTask(_)
            | TributaryError::CycleDetected(_)
            | TributaryError::MissingDependency { .. }
            | TributaryError::UnknownUnit { .. }
            | TributaryError::InvalidParams { .. }
            | TributaryError::InvalidSchedule(_)
            | TributaryError::CommandTooLong { .. }
            | TributaryError::ArgCountExceeded { .. }
            | TributaryError::ArgTooLong { .. }
            | TributaryError::InvalidPath(_)
            | TributaryError::PathTraversal(_)
            | TributaryError::Validation(_)
            | TributaryError::Config(_) => ErrorCategory::Validation,
            TributaryError::NotFound(_) | TributaryError::IllegalTransition { .. } => {
                ErrorCategory::Control
            }
            TributaryError::Database(_)
            | TributaryError::Io(_)
            | TributaryError::Json(_)
            | TributaryError::Metrics(_)
            | TributaryError::Infrastructure(_)
            | TributaryError::Other(_) => ErrorCategory::Infrastructure,
        }
    }

    /// True for errors that block a workflow from being loaded or scheduled
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }
}

/// Result type alias using TributaryError
pub type Result<T> = std::result::Result<T, TributaryError>;
