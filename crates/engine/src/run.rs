//! Run state machine — per-stage status for one execution of a pipeline.
//!
//! ```text
//! pending ──start──▶ running ──succeed──▶ succeeded
//!                     │   ▲
//!                fail │   │ start
//!                     ▼   │
//!                   retrying        (while attempts <= max_retries)
//!
//! running ──fail (retries exhausted)──▶ failed ──▶ downstream closure: skipped
//! ```
//!
//! A stage may only start once every upstream stage has succeeded. A [`Run`]
//! is mutated by a single coordinator; observers get a [`RunSnapshot`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use work::StageExecutionError;

use crate::{EngineError, Pipeline};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Running   => write!(f, "running"),
            Self::Retrying  => write!(f, "retrying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
            Self::Skipped   => write!(f, "skipped"),
        }
    }
}

/// Overall status, derived from the stage statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Running   => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-stage state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage_id: String,
    pub status: StageStatus,
    /// Attempts started so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What the coordinator should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The stage is `retrying`; start it again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The stage is terminally `failed`; these stages were skipped.
    Terminal { skipped: Vec<String> },
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution instance of a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct Run {
    id: Uuid,
    pipeline: Arc<Pipeline>,
    states: Vec<StageState>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a run with every stage `pending`.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let states = pipeline
            .graph()
            .registry()
            .ids()
            .map(|id| StageState {
                stage_id: id.to_owned(),
                status: StageStatus::Pending,
                attempts: 0,
                last_error: None,
                started_at: None,
                finished_at: None,
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            pipeline,
            states,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// States in registration order.
    pub fn stages(&self) -> &[StageState] {
        &self.states
    }

    pub fn stage(&self, id: &str) -> Result<&StageState, EngineError> {
        let pos = self.position(id)?;
        Ok(&self.states[pos])
    }

    fn position(&self, id: &str) -> Result<usize, EngineError> {
        self.pipeline.graph().registry().position(id)
    }

    /// Overall status.
    ///
    /// `pending` until a stage starts, `running` while any stage is not
    /// terminal, then `failed` if any stage failed and `succeeded` otherwise.
    pub fn status(&self) -> RunStatus {
        if self.states.iter().all(|s| s.status == StageStatus::Pending) && !self.states.is_empty() {
            return RunStatus::Pending;
        }
        if !self.is_finished() {
            return RunStatus::Running;
        }
        if self.states.iter().any(|s| s.status == StageStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    /// True once every stage is terminal.
    pub fn is_finished(&self) -> bool {
        self.states.iter().all(|s| s.status.is_terminal())
    }

    /// Pending stages whose upstream stages have all succeeded, in
    /// registration order.
    pub fn ready_stages(&self) -> Vec<&str> {
        self.ready_positions()
            .into_iter()
            .map(|i| self.states[i].stage_id.as_str())
            .collect()
    }

    pub(crate) fn ready_positions(&self) -> Vec<usize> {
        (0..self.states.len())
            .filter(|&i| {
                self.states[i].status == StageStatus::Pending && self.upstream_succeeded(i)
            })
            .collect()
    }

    fn upstream_succeeded(&self, position: usize) -> bool {
        self.pipeline
            .graph()
            .upstream_positions(position)
            .iter()
            .all(|&u| self.states[u].status == StageStatus::Succeeded)
    }

    /// `pending|retrying → running`; returns the attempt number.
    ///
    /// # Errors
    /// [`EngineError::IllegalTransition`] from any other status, or while an
    /// upstream stage has not succeeded.
    pub fn start(&mut self, id: &str) -> Result<u32, EngineError> {
        let pos = self.position(id)?;
        self.start_at(pos)
    }

    pub(crate) fn start_at(&mut self, position: usize) -> Result<u32, EngineError> {
        let from = self.states[position].status;
        let startable = matches!(from, StageStatus::Pending | StageStatus::Retrying);
        if !startable || !self.upstream_succeeded(position) {
            return Err(self.illegal(position, StageStatus::Running));
        }

        let state = &mut self.states[position];
        state.status = StageStatus::Running;
        state.attempts += 1;
        state.started_at.get_or_insert_with(Utc::now);
        Ok(state.attempts)
    }

    /// `running → succeeded`.
    pub fn succeed(&mut self, id: &str) -> Result<(), EngineError> {
        let pos = self.position(id)?;
        self.succeed_at(pos)
    }

    pub(crate) fn succeed_at(&mut self, position: usize) -> Result<(), EngineError> {
        self.require_running(position, StageStatus::Succeeded)?;
        let state = &mut self.states[position];
        state.status = StageStatus::Succeeded;
        state.last_error = None;
        state.finished_at = Some(Utc::now());
        self.mark_finished();
        Ok(())
    }

    /// `running → retrying` while retries remain, otherwise `running →
    /// failed` and every pending stage downstream becomes `skipped`.
    pub fn fail(
        &mut self,
        id: &str,
        error: &StageExecutionError,
    ) -> Result<FailureOutcome, EngineError> {
        let pos = self.position(id)?;
        self.fail_at(pos, error)
    }

    pub(crate) fn fail_at(
        &mut self,
        position: usize,
        error: &StageExecutionError,
    ) -> Result<FailureOutcome, EngineError> {
        self.require_running(position, StageStatus::Failed)?;

        let retry = self.pipeline.graph().registry().at(position).retry;
        let state = &mut self.states[position];
        state.last_error = Some(error.reason().to_owned());

        if state.attempts <= retry.max_retries {
            state.status = StageStatus::Retrying;
            return Ok(FailureOutcome::Retry {
                attempt: state.attempts,
                delay: retry.retry_delay,
            });
        }

        state.status = StageStatus::Failed;
        state.finished_at = Some(Utc::now());

        let now = Utc::now();
        let mut skipped = Vec::new();
        for d in self.pipeline.graph().descendants(position) {
            let state = &mut self.states[d];
            if state.status == StageStatus::Pending {
                state.status = StageStatus::Skipped;
                state.finished_at = Some(now);
                skipped.push(state.stage_id.clone());
            }
        }

        self.mark_finished();
        Ok(FailureOutcome::Terminal { skipped })
    }

    fn require_running(&self, position: usize, to: StageStatus) -> Result<(), EngineError> {
        if self.states[position].status == StageStatus::Running {
            Ok(())
        } else {
            Err(self.illegal(position, to))
        }
    }

    fn illegal(&self, position: usize, to: StageStatus) -> EngineError {
        let state = &self.states[position];
        EngineError::IllegalTransition {
            stage_id: state.stage_id.clone(),
            from: state.status,
            to,
        }
    }

    fn mark_finished(&mut self) {
        if self.finished_at.is_none() && self.is_finished() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            pipeline: self.pipeline.name().to_owned(),
            status: self.status(),
            stages: self.states.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

// ---------------------------------------------------------------------------
// RunSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of a run, published to observers and returned when
/// the run completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub stages: Vec<StageState>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn stage(&self, id: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.stage_id == id)
    }

    /// IDs of stages currently in `status`, in registration order.
    pub fn stages_with(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.stage_id.as_str())
            .collect()
    }
}
