//! Unified engine error type.
//!
//! Every public operation on [`crate::TaskController`] returns
//! `Result<T, ReviewError>`.  Structural failures (unknown id, illegal
//! transition, bad config) surface here synchronously; row-level failures never
//! do, they are recorded on the row itself.

use thiserror::Error;

use crate::runtime::types::TaskStatus;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ReviewError> = std::result::Result<T, E>;

/// All errors that can occur while driving or inspecting a review task.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// The caller supplied an out-of-range config value or an unusable table.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    /// `pause` was requested for a task that is not running.
    #[error("task {task_id} is not running (status: {status})")]
    NotRunning { task_id: String, status: TaskStatus },

    /// The requested lifecycle operation is incompatible with the task's state.
    #[error("task {task_id} cannot {action} (status: {status}): {reason}")]
    InvalidTransition {
        task_id: String,
        action: &'static str,
        status: TaskStatus,
        reason: String,
    },

    /// The source table could not be read or is malformed.
    #[error("source table error: {0}")]
    Source(String),

    /// Propagated from the SQLite store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedded migrations failed to apply.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Artifact directory or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A persisted JSON column could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReviewError {
    pub fn not_found(task_id: impl Into<String>) -> Self {
        ReviewError::NotFound {
            task_id: task_id.into(),
        }
    }

    /// Returns `true` for errors caused by the caller's input rather than by
    /// the engine or its storage.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ReviewError::Validation(_)
                | ReviewError::NotFound { .. }
                | ReviewError::NotRunning { .. }
                | ReviewError::InvalidTransition { .. }
                | ReviewError::Source(_)
        )
    }
}

impl From<validator::ValidationErrors> for ReviewError {
    fn from(e: validator::ValidationErrors) -> Self {
        ReviewError::Validation(e.to_string())
    }
}
