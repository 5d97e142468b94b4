//! `WorkDispatcher` — routes work to the executor registered for its kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{StageContext, StageExecutionError, Work, WorkExecutor, WorkKind};

/// Maps [`WorkKind`] to an executor. Work of an unregistered kind fails.
#[derive(Default, Clone)]
pub struct WorkDispatcher {
    routes: HashMap<WorkKind, Arc<dyn WorkExecutor>>,
}

impl WorkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `kind` to `executor`, replacing any previous route.
    pub fn route(mut self, kind: WorkKind, executor: Arc<dyn WorkExecutor>) -> Self {
        self.routes.insert(kind, executor);
        self
    }

    pub fn handles(&self, kind: WorkKind) -> bool {
        self.routes.contains_key(&kind)
    }
}

#[async_trait]
impl WorkExecutor for WorkDispatcher {
    async fn execute(&self, work: &Work, ctx: &StageContext) -> Result<(), StageExecutionError> {
        let executor = self.routes.get(&work.kind()).ok_or_else(|| {
            StageExecutionError::new(format!("no executor configured for {} work", work.kind()))
        })?;
        executor.execute(work, ctx).await
    }
}
