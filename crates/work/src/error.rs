//! Stage-level error type.

use thiserror::Error;

/// Failure reported by a [`WorkExecutor`](crate::WorkExecutor).
///
/// The engine treats every execution failure the same way: it is retried up
/// to the stage's configured retry count, then becomes a terminal failure.
/// The reason is free-form and only used for reporting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("stage execution failed: {reason}")]
pub struct StageExecutionError {
    reason: String,
}

impl StageExecutionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    /// The executor-supplied failure reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
