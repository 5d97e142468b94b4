//! The `WorkExecutor` trait — the contract between the engine and whatever
//! actually runs a stage's work.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{StageExecutionError, Work};

/// Identifies the stage attempt being executed.
///
/// Defined here (in the work crate) so both the engine and executor
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// ID of the run this attempt belongs to.
    pub run_id: Uuid,
    /// Name of the pipeline being run.
    pub pipeline: String,
    /// ID of the stage being executed.
    pub stage_id: String,
    /// 1-based attempt number (retries increment it).
    pub attempt: u32,
}

/// Executes a unit of work and reports success or failure.
///
/// Implementations must not assume anything about scheduling: the engine may
/// call `execute` concurrently for different stages, and again for the same
/// stage when it is retried.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, work: &Work, ctx: &StageContext) -> Result<(), StageExecutionError>;
}
