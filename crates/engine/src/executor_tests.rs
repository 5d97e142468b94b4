//! Scheduler tests for `PipelineExecutor`.
//!
//! Every test drives a real run through `MockExecutor` on a paused Tokio
//! clock, so five-minute retry delays and executor latency elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use work::mock::{MockCall, MockExecutor};
use work::{StageContext, StageExecutionError, Work, WorkExecutor};

use crate::{
    EngineError, ExecutorConfig, Pipeline, PipelineExecutor, RetryPolicy, RunStatus, StageStatus,
};

/// Build a pipeline from IDs and edges; every stage gets `retry`.
fn pipeline(ids: &[&str], edges: &[(&str, &str)], retry: RetryPolicy) -> Arc<Pipeline> {
    let mut builder = Pipeline::builder("test");
    builder.default_retry(retry);
    for id in ids {
        builder.stage(*id, Work::sql(format!("-- {id}"))).unwrap();
    }
    for (up, down) in edges {
        builder.edge(up, down).unwrap();
    }
    Arc::new(builder.build().unwrap())
}

fn five_minute_retries(n: u32) -> RetryPolicy {
    RetryPolicy::new(n, Duration::from_secs(300))
}

fn executor_for(mock: &Arc<MockExecutor>) -> PipelineExecutor {
    PipelineExecutor::new(mock.clone(), ExecutorConfig::default())
}

fn position(order: &[String], id: &str) -> usize {
    order.iter().position(|s| s == id).unwrap_or_else(|| panic!("{id} never ran"))
}

// ============================================================
// Successful runs
// ============================================================

#[tokio::test(start_paused = true)]
async fn diamond_runs_every_stage_once_in_dependency_order() {
    let p = pipeline(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        five_minute_retries(2),
    );
    let mock = Arc::new(MockExecutor::new().with_latency(Duration::from_millis(10)));

    let snapshot = executor_for(&mock).run(p).await.expect("run should complete");

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.stages_with(StageStatus::Succeeded), vec!["a", "b", "c", "d"]);

    let order = mock.execution_order();
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("d"));
    for id in ["a", "b", "c", "d"] {
        assert_eq!(mock.call_count(id), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn every_edge_is_respected_in_a_wide_pipeline() {
    let edges = [
        ("dim_lga", "dim_suburb"),
        ("dim_listings", "dim_host"),
        ("dim_listings", "dim_date"),
        ("dim_suburb", "fact_listings"),
        ("dim_host", "fact_listings"),
        ("dim_date", "fact_listings"),
        ("fact_listings", "dm_listing_neighbourhood"),
        ("fact_listings", "dm_property_type"),
        ("fact_listings", "dm_host_neighbourhood"),
    ];
    let p = pipeline(
        &[
            "dim_lga",
            "dim_listings",
            "dim_suburb",
            "dim_host",
            "dim_date",
            "fact_listings",
            "dm_listing_neighbourhood",
            "dm_property_type",
            "dm_host_neighbourhood",
        ],
        &edges,
        five_minute_retries(2),
    );
    let mock = Arc::new(MockExecutor::new().with_latency(Duration::from_millis(5)));

    let snapshot = executor_for(&mock).run(p).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    let order = mock.execution_order();
    assert_eq!(order.len(), 9);
    for (up, down) in edges {
        assert!(position(&order, up) < position(&order, down), "{up} ran after {down}");
    }
}

// ============================================================
// Retries and failures
// ============================================================

#[tokio::test(start_paused = true)]
async fn flaky_stage_is_retried_until_it_succeeds() {
    let p = pipeline(&["a", "b"], &[("a", "b")], five_minute_retries(2));
    let mock = Arc::new(MockExecutor::new().flaky("a", 2, "warehouse suspended"));

    let started = tokio::time::Instant::now();
    let snapshot = executor_for(&mock).run(p).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    let a = snapshot.stage("a").unwrap();
    assert_eq!(a.attempts, 3);
    assert!(a.last_error.is_none());
    assert_eq!(
        mock.calls(),
        vec![
            MockCall { stage_id: "a".into(), attempt: 1 },
            MockCall { stage_id: "a".into(), attempt: 2 },
            MockCall { stage_id: "a".into(), attempt: 3 },
            MockCall { stage_id: "b".into(), attempt: 1 },
        ]
    );
    // Two retry delays of five minutes each.
    assert!(started.elapsed() >= Duration::from_secs(600));
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_skips_its_branch_and_lets_others_finish() {
    // A → B → D, A → C; B always fails.
    let p = pipeline(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("b", "d"), ("a", "c")],
        five_minute_retries(2),
    );
    let mock = Arc::new(MockExecutor::new().failing("b", "relation does not exist"));

    let snapshot = executor_for(&mock).run(p).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.stages_with(StageStatus::Succeeded), vec!["a", "c"]);
    assert_eq!(snapshot.stages_with(StageStatus::Failed), vec!["b"]);
    assert_eq!(snapshot.stages_with(StageStatus::Skipped), vec!["d"]);

    let b = snapshot.stage("b").unwrap();
    assert_eq!(b.attempts, 3, "one attempt plus two retries");
    assert_eq!(b.last_error.as_deref(), Some("relation does not exist"));
    assert_eq!(mock.call_count("d"), 0);
}

#[tokio::test(start_paused = true)]
async fn root_failure_skips_its_whole_closure() {
    // A → B → D, A → C; A always fails, so nothing downstream may start.
    let p = pipeline(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("b", "d"), ("a", "c")],
        five_minute_retries(2),
    );
    let mock = Arc::new(MockExecutor::new().failing("a", "stage file missing"));

    let snapshot = executor_for(&mock).run(p).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.stages_with(StageStatus::Failed), vec!["a"]);
    assert_eq!(snapshot.stages_with(StageStatus::Skipped), vec!["b", "c", "d"]);
    assert_eq!(mock.call_count("a"), 3);
    assert_eq!(mock.execution_order(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn independent_root_finishes_despite_failure_elsewhere() {
    // x → y is unrelated to the failing f → g branch.
    let p = pipeline(
        &["f", "g", "x", "y"],
        &[("f", "g"), ("x", "y")],
        RetryPolicy::none(),
    );
    let mock = Arc::new(
        MockExecutor::new()
            .failing("f", "boom")
            .with_latency(Duration::from_millis(50)),
    );

    let snapshot = executor_for(&mock).run(p).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.stages_with(StageStatus::Succeeded), vec!["x", "y"]);
    assert_eq!(snapshot.stages_with(StageStatus::Skipped), vec!["g"]);
    assert_eq!(mock.call_count("f"), 1);
}

struct PanickingExecutor;

#[async_trait]
impl WorkExecutor for PanickingExecutor {
    async fn execute(&self, _work: &Work, ctx: &StageContext) -> Result<(), StageExecutionError> {
        if ctx.stage_id == "explodes" {
            panic!("executor bug");
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_executor_fails_the_stage_not_the_run() {
    let p = pipeline(
        &["explodes", "after", "other"],
        &[("explodes", "after")],
        RetryPolicy::none(),
    );
    let exec = PipelineExecutor::new(Arc::new(PanickingExecutor), ExecutorConfig::default());

    let snapshot = exec.run(p).await.expect("coordinator survives executor panics");

    assert_eq!(snapshot.status, RunStatus::Failed);
    let stage = snapshot.stage("explodes").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert!(stage.last_error.as_deref().unwrap().contains("panicked"));
    assert_eq!(snapshot.stage("after").unwrap().status, StageStatus::Skipped);
    assert_eq!(snapshot.stage("other").unwrap().status, StageStatus::Succeeded);
}

// ============================================================
// Concurrency and run limits
// ============================================================

#[tokio::test(start_paused = true)]
async fn pipeline_concurrency_cap_is_honoured() {
    let ids = ["s1", "s2", "s3", "s4", "s5", "s6", "s7"];
    let mut builder = Pipeline::builder("wide");
    builder.max_concurrency(3);
    for id in ids {
        builder.stage(id, Work::sql("select 1")).unwrap();
    }
    let p = Arc::new(builder.build().unwrap());
    let mock = Arc::new(MockExecutor::new().with_latency(Duration::from_millis(20)));

    let snapshot = executor_for(&mock).run(p).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(mock.peak_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn executor_override_serialises_in_registration_order() {
    let p = pipeline(&["c", "a", "b"], &[], RetryPolicy::none());
    let mock = Arc::new(MockExecutor::new().with_latency(Duration::from_millis(20)));
    let exec = PipelineExecutor::new(mock.clone(), ExecutorConfig { max_concurrency: Some(1) });

    exec.run(p).await.unwrap();

    assert_eq!(mock.peak_in_flight(), 1);
    assert_eq!(mock.execution_order(), vec!["c", "a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn zero_concurrency_override_is_rejected() {
    let p = pipeline(&["a"], &[], RetryPolicy::none());
    let exec = PipelineExecutor::new(
        Arc::new(MockExecutor::new()),
        ExecutorConfig {
            max_concurrency: Some(0),
        },
    );
    assert!(matches!(exec.submit(p), Err(EngineError::InvalidConfig(_))));
}

#[tokio::test(start_paused = true)]
async fn max_active_runs_is_enforced_until_the_run_finishes() {
    let p = pipeline(&["a"], &[], RetryPolicy::none());
    let mock = Arc::new(MockExecutor::new().with_latency(Duration::from_secs(1)));
    let exec = executor_for(&mock);

    let first = exec.submit(p.clone()).expect("first run is admitted");
    assert!(matches!(
        exec.submit(p.clone()),
        Err(EngineError::TooManyActiveRuns { pipeline: ref name, limit: 1 }) if name == "test"
    ));

    first.wait().await.unwrap();

    let second = exec.submit(p).expect("slot is released after the run");
    assert_eq!(second.wait().await.unwrap().status, RunStatus::Succeeded);
}

// ============================================================
// RunHandle
// ============================================================

#[tokio::test(start_paused = true)]
async fn handle_reports_status_before_and_after_completion() {
    let p = pipeline(&["a", "b"], &[("a", "b")], RetryPolicy::none());
    let mock = Arc::new(MockExecutor::new().with_latency(Duration::from_millis(10)));
    let exec = executor_for(&mock);

    let handle = exec.submit(p).unwrap();
    // The coordinator has not been polled yet on this single-threaded runtime.
    assert_eq!(handle.status(), RunStatus::Pending);
    assert_eq!(handle.snapshot().run_id, handle.id());

    let id = handle.id();
    let snapshot = handle.wait().await.unwrap();
    assert_eq!(snapshot.run_id, id);
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert!(snapshot.finished_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn empty_pipeline_succeeds_immediately() {
    let p = Arc::new(Pipeline::builder("empty").build().unwrap());
    let snapshot = executor_for(&Arc::new(MockExecutor::new())).run(p).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert!(snapshot.stages.is_empty());
}
