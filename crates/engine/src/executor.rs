//! Pipeline execution engine.
//!
//! `PipelineExecutor` is the central orchestrator. For each submitted run it
//! spawns one coordinator task which:
//! 1. Creates a [`Run`] with every stage `pending`.
//! 2. Dispatches ready stages to the [`WorkExecutor`], never more than the
//!    concurrency cap at once (stages due a retry go first, then ready stages
//!    in registration order).
//! 3. Applies each result to the run: success unlocks dependents, failure
//!    schedules a retry after the stage's delay or, once retries are
//!    exhausted, fails the stage and skips everything downstream of it.
//! 4. Publishes a [`RunSnapshot`] after every change and returns the final
//!    snapshot when nothing is left to dispatch.
//!
//! Only the coordinator mutates the run, so no locking is needed around it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use work::{StageContext, StageExecutionError, WorkExecutor};

use crate::run::{FailureOutcome, Run, RunSnapshot, RunStatus};
use crate::{EngineError, Pipeline};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Overrides every pipeline's own `max_concurrency` when set.
    pub max_concurrency: Option<usize>,
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Handle to a submitted run.
pub struct RunHandle {
    id: Uuid,
    status: watch::Receiver<RunSnapshot>,
    task: JoinHandle<RunSnapshot>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest published run status.
    pub fn status(&self) -> RunStatus {
        self.status.borrow().status
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.status.borrow().clone()
    }

    /// Wait for the run to finish and return its final snapshot.
    ///
    /// # Errors
    /// [`EngineError::RunAborted`] if the coordinator task panicked or was
    /// cancelled.
    pub async fn wait(self) -> Result<RunSnapshot, EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::RunAborted(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Active-run accounting
// ---------------------------------------------------------------------------

type ActiveRuns = Arc<Mutex<HashMap<String, usize>>>;

/// Holds one of a pipeline's `max_active_runs` slots until dropped.
struct ActiveRunSlot {
    runs: ActiveRuns,
    pipeline: String,
}

impl ActiveRunSlot {
    fn acquire(runs: &ActiveRuns, pipeline: &str, limit: usize) -> Result<Self, EngineError> {
        let mut active = runs.lock().unwrap_or_else(PoisonError::into_inner);
        let count = active.entry(pipeline.to_owned()).or_insert(0);
        if *count >= limit {
            return Err(EngineError::TooManyActiveRuns {
                pipeline: pipeline.to_owned(),
                limit,
            });
        }
        *count += 1;
        Ok(Self {
            runs: Arc::clone(runs),
            pipeline: pipeline.to_owned(),
        })
    }
}

impl Drop for ActiveRunSlot {
    fn drop(&mut self) {
        let mut active = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = active.get_mut(&self.pipeline) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.pipeline);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

/// Runs pipelines against a [`WorkExecutor`].
///
/// Construct one per process and share it; the active-run limit of each
/// pipeline is enforced per executor instance.
pub struct PipelineExecutor {
    executor: Arc<dyn WorkExecutor>,
    config: ExecutorConfig,
    active_runs: ActiveRuns,
}

impl PipelineExecutor {
    /// Create a new executor.
    pub fn new(executor: Arc<dyn WorkExecutor>, config: ExecutorConfig) -> Self {
        Self {
            executor,
            config,
            active_runs: Arc::default(),
        }
    }

    /// Start a run of `pipeline` on the current Tokio runtime.
    ///
    /// # Errors
    /// - [`EngineError::TooManyActiveRuns`] if the pipeline already has
    ///   `max_active_runs` runs in flight.
    /// - [`EngineError::InvalidConfig`] if the concurrency override is zero.
    pub fn submit(&self, pipeline: Arc<Pipeline>) -> Result<RunHandle, EngineError> {
        let settings = pipeline.settings();
        let cap = self.config.max_concurrency.unwrap_or(settings.max_concurrency);
        if cap == 0 {
            return Err(EngineError::InvalidConfig("max_concurrency must be at least 1".into()));
        }

        let slot =
            ActiveRunSlot::acquire(&self.active_runs, pipeline.name(), settings.max_active_runs)?;

        let run = Run::new(pipeline);
        let id = run.id();
        let (tx, rx) = watch::channel(run.snapshot());
        let executor = Arc::clone(&self.executor);

        let task = tokio::spawn(async move {
            let _slot = slot;
            drive(run, executor, cap, tx).await
        });

        Ok(RunHandle { id, status: rx, task })
    }

    /// Submit `pipeline` and wait for the run to finish.
    pub async fn run(&self, pipeline: Arc<Pipeline>) -> Result<RunSnapshot, EngineError> {
        self.submit(pipeline)?.wait().await
    }
}

// ---------------------------------------------------------------------------
// Internal: the coordinator loop.
// ---------------------------------------------------------------------------

enum Event {
    /// An attempt finished.
    Finished {
        position: usize,
        result: Result<(), StageExecutionError>,
    },
    /// A retrying stage's delay has elapsed.
    RetryDue(usize),
}

#[instrument(skip_all, fields(run_id = %run.id(), pipeline = %run.pipeline().name()))]
async fn drive(
    mut run: Run,
    executor: Arc<dyn WorkExecutor>,
    cap: usize,
    status: watch::Sender<RunSnapshot>,
) -> RunSnapshot {
    let pipeline = Arc::clone(run.pipeline());
    let registry = pipeline.graph().registry();

    let mut tasks: JoinSet<Event> = JoinSet::new();
    let mut in_flight = 0usize;
    let mut retry_due: VecDeque<usize> = VecDeque::new();

    info!(stages = registry.len(), max_concurrency = cap, "run started");

    loop {
        // ------------------------------------------------------------------
        // Dispatch as much as the cap allows.
        // ------------------------------------------------------------------
        while in_flight < cap {
            let next = retry_due
                .pop_front()
                .or_else(|| run.ready_positions().first().copied());
            let Some(position) = next else { break };

            let attempt = match run.start_at(position) {
                Ok(attempt) => attempt,
                Err(e) => {
                    error!("cannot start stage: {e}");
                    break;
                }
            };

            let stage = registry.at(position);
            info!(stage = %stage.id, attempt, "stage started: {}", stage.work.summary());

            let ctx = StageContext {
                run_id: run.id(),
                pipeline: pipeline.name().to_owned(),
                stage_id: stage.id.clone(),
                attempt,
            };
            let work = stage.work.clone();
            let executor = Arc::clone(&executor);

            in_flight += 1;
            tasks.spawn(async move {
                // A panicking executor fails the attempt instead of the run.
                let result = tokio::spawn(async move { executor.execute(&work, &ctx).await })
                    .await
                    .unwrap_or_else(|e| {
                        Err(StageExecutionError::new(format!("executor panicked: {e}")))
                    });
                Event::Finished { position, result }
            });
        }

        status.send_replace(run.snapshot());

        // ------------------------------------------------------------------
        // Wait for the next attempt or retry timer.
        // ------------------------------------------------------------------
        let Some(joined) = tasks.join_next().await else { break };

        match joined {
            Ok(Event::Finished { position, result }) => {
                in_flight -= 1;
                let stage = registry.at(position);

                match result {
                    Ok(()) => match run.succeed_at(position) {
                        Ok(()) => info!(stage = %stage.id, "stage succeeded"),
                        Err(e) => error!("{e}"),
                    },
                    Err(err) => match run.fail_at(position, &err) {
                        Ok(FailureOutcome::Retry { attempt, delay }) => {
                            warn!(
                                stage = %stage.id,
                                attempt,
                                max_retries = stage.retry.max_retries,
                                "stage failed, retrying in {:?}: {}",
                                delay,
                                err.reason()
                            );
                            tasks.spawn(async move {
                                tokio::time::sleep(delay).await;
                                Event::RetryDue(position)
                            });
                        }
                        Ok(FailureOutcome::Terminal { skipped }) => {
                            error!(stage = %stage.id, "stage failed: {}", err.reason());
                            if !skipped.is_empty() {
                                warn!(stage = %stage.id, ?skipped, "skipping downstream stages");
                            }
                        }
                        Err(e) => error!("{e}"),
                    },
                }
            }
            Ok(Event::RetryDue(position)) => retry_due.push_back(position),
            Err(e) => error!("coordinator task failed: {e}"),
        }
    }

    let snapshot = run.snapshot();
    if !run.is_finished() {
        warn!(
            pending = ?snapshot.stages_with(crate::StageStatus::Pending),
            "run ended with undispatched stages"
        );
    }
    status.send_replace(snapshot.clone());

    match snapshot.status {
        RunStatus::Failed => error!(
            failed = ?snapshot.stages_with(crate::StageStatus::Failed),
            skipped = ?snapshot.stages_with(crate::StageStatus::Skipped),
            "run failed"
        ),
        other => info!(status = %other, "run finished"),
    }

    snapshot
}
