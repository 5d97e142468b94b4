//! `DryRunExecutor` — logs each unit of work instead of running it.

use async_trait::async_trait;
use tracing::info;

use crate::{StageContext, StageExecutionError, Work, WorkExecutor};

/// Succeeds immediately after logging what would have been executed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

#[async_trait]
impl WorkExecutor for DryRunExecutor {
    async fn execute(&self, work: &Work, ctx: &StageContext) -> Result<(), StageExecutionError> {
        info!(
            stage = %ctx.stage_id,
            kind = %work.kind(),
            "dry run: {}",
            work.summary()
        );
        Ok(())
    }
}
