//! `MockExecutor` — a test double for `WorkExecutor`.
//!
//! Behaviour is scripted per stage ID; stages without a script succeed.
//! Every call is recorded so tests can assert execution order, attempt
//! counts, and how many stages were running at once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{StageContext, StageExecutionError, Work, WorkExecutor};

/// Behaviour injected into `MockExecutor` for a given stage.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Always succeed.
    Succeed,
    /// Always fail with the given reason.
    Fail(String),
    /// Fail the first `n` attempts, then succeed.
    FailTimes(u32, String),
}

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub stage_id: String,
    pub attempt: u32,
}

/// A mock executor that records every call it receives and returns a
/// programmer-specified result.
#[derive(Default)]
pub struct MockExecutor {
    behaviours: HashMap<String, MockBehaviour>,
    latency: Option<Duration>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockExecutor {
    /// Create a mock where every stage succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour of one stage.
    pub fn with_behaviour(mut self, stage_id: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.behaviours.insert(stage_id.into(), behaviour);
        self
    }

    /// Make `stage_id` fail on every attempt.
    pub fn failing(self, stage_id: impl Into<String>, msg: impl Into<String>) -> Self {
        self.with_behaviour(stage_id, MockBehaviour::Fail(msg.into()))
    }

    /// Make `stage_id` fail its first `times` attempts.
    pub fn flaky(self, stage_id: impl Into<String>, times: u32, msg: impl Into<String>) -> Self {
        self.with_behaviour(stage_id, MockBehaviour::FailTimes(times, msg.into()))
    }

    /// Sleep for `latency` inside every call (uses the Tokio clock).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// All calls in the order they started.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Stage IDs in the order they were first executed.
    pub fn execution_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for call in self.calls() {
            if !order.contains(&call.stage_id) {
                order.push(call.stage_id);
            }
        }
        order
    }

    /// Number of times `stage_id` was executed.
    pub fn call_count(&self, stage_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage_id == stage_id)
            .count()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkExecutor for MockExecutor {
    async fn execute(&self, _work: &Work, ctx: &StageContext) -> Result<(), StageExecutionError> {
        self.calls.lock().unwrap().push(MockCall {
            stage_id: ctx.stage_id.clone(),
            attempt: ctx.attempt,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.behaviours.get(&ctx.stage_id) {
            None | Some(MockBehaviour::Succeed) => Ok(()),
            Some(MockBehaviour::Fail(msg)) => Err(StageExecutionError::new(msg.clone())),
            Some(MockBehaviour::FailTimes(times, msg)) => {
                if ctx.attempt <= *times {
                    Err(StageExecutionError::new(msg.clone()))
                } else {
                    Ok(())
                }
            }
        }
    }
}
