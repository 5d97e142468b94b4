//! Engine-level error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::run::StageStatus;

/// Errors produced by the pipeline engine (definition + execution).
///
/// Everything except `IllegalTransition` and `RunAborted` is a definition-time
/// error: it aborts pipeline construction and is never retried. Stage
/// execution failures are not errors at this level; they are recorded on the
/// run and surface through its status.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Definition errors ------

    /// A stage ID was registered twice.
    #[error("duplicate stage ID: '{0}'")]
    DuplicateStage(String),

    /// A lookup or edge references a stage ID that was never registered.
    #[error("unknown stage '{stage_id}' ({role})")]
    UnknownStage {
        stage_id: String,
        role: &'static str,
    },

    /// The dependency edges would not form a DAG.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// Stage IDs along the cycle, or the stages that can never become
        /// ready when the cycle was found during ordering.
        path: Vec<String>,
    },

    /// A pipeline setting is out of range.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The definition file could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The definition file is not valid JSON for a pipeline.
    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(#[from] serde_json::Error),

    // ------ Execution errors ------

    /// A stage status change that the state machine does not allow.
    #[error("stage '{stage_id}' cannot move from {from} to {to}")]
    IllegalTransition {
        stage_id: String,
        from: StageStatus,
        to: StageStatus,
    },

    /// The pipeline already has its maximum number of runs in flight.
    #[error("pipeline '{pipeline}' already has {limit} active run(s)")]
    TooManyActiveRuns {
        pipeline: String,
        limit: usize,
    },

    /// The task coordinating a run stopped before the run finished.
    #[error("run aborted: {0}")]
    RunAborted(String),
}
