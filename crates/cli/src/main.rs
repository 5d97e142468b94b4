//! `warehouse-pipeline` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — check a pipeline definition file.
//! - `plan`     — print the ready sets a run would follow.
//! - `run`      — execute the pipeline and report per-stage results.

mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use engine::{ExecutorConfig, Pipeline, PipelineExecutor, RunSnapshot, RunStatus};
use work::{DryRunExecutor, HttpExecutor, SqlCliExecutor, WorkDispatcher, WorkExecutor, WorkKind};

#[derive(Parser)]
#[command(
    name = "warehouse-pipeline",
    about = "Dependency-ordered warehouse refresh pipelines",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (error, warn, info, debug, trace); `RUST_LOG` overrides it.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a pipeline definition JSON file.
    Validate {
        /// Path to the pipeline JSON file.
        path: PathBuf,
    },
    /// Print the ready sets (groups of stages that may run together).
    Plan {
        /// Path to the pipeline JSON file.
        path: PathBuf,
        /// Print the ready sets as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a pipeline.
    Run {
        /// Path to the pipeline JSON file.
        path: PathBuf,
        #[command(flatten)]
        exec: ExecArgs,
        /// Print the final run snapshot as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct ExecArgs {
    /// Log every stage's work instead of executing it.
    #[arg(long)]
    dry_run: bool,
    /// Override the pipeline's maximum number of concurrently running stages.
    #[arg(long)]
    max_concurrency: Option<usize>,
    /// Warehouse client command line; the SQL script is piped to its stdin and
    /// `{connection}` is replaced with the stage's connection.
    #[arg(long, env = "WAREHOUSE_SQL_CLIENT")]
    sql_client: Option<String>,
    /// Connection used by SQL stages that do not name one.
    #[arg(long, env = "WAREHOUSE_CONNECTION")]
    connection: Option<String>,
    /// Kill a SQL client that runs longer than this.
    #[arg(long)]
    stage_timeout_secs: Option<u64>,
    /// Timeout for HTTP stages.
    #[arg(long, default_value_t = 30)]
    http_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Command::Validate { path } => match load(&path) {
            Ok(pipeline) => {
                let registry = pipeline.graph().registry();
                println!(
                    "✅ Pipeline '{}' is valid: {} stages, {} edges.",
                    pipeline.name(),
                    registry.len(),
                    pipeline.graph().edges().count()
                );
            }
            Err(e) => {
                eprintln!("❌ Validation failed: {e:#}");
                std::process::exit(1);
            }
        },

        Command::Plan { path, json } => {
            let pipeline = load(&path)?;
            let sets = pipeline.graph().ready_sets()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sets)?);
            } else {
                print!("{}", render_plan(pipeline.name(), &sets));
            }
        }

        Command::Run { path, exec, json } => {
            let pipeline = Arc::new(load(&path)?);
            let executor = build_executor(&exec, &pipeline)?;
            let engine = PipelineExecutor::new(
                executor,
                ExecutorConfig {
                    max_concurrency: exec.max_concurrency,
                },
            );

            info!("Running pipeline '{}' from {}", pipeline.name(), path.display());
            let snapshot = engine.run(pipeline).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", render_summary(&snapshot));
            }

            if snapshot.status != RunStatus::Succeeded {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<Pipeline> {
    Pipeline::load(path).with_context(|| format!("cannot load pipeline {}", path.display()))
}

/// Pick the executor for `run`: dry-run, or a dispatcher over the SQL client
/// and HTTP executors that can handle every stage of `pipeline`.
fn build_executor(
    args: &ExecArgs,
    pipeline: &Pipeline,
) -> anyhow::Result<Arc<dyn WorkExecutor>> {
    if args.dry_run {
        return Ok(Arc::new(DryRunExecutor));
    }

    let http = HttpExecutor::new(Duration::from_secs(args.http_timeout_secs))
        .context("cannot build HTTP client")?;
    let mut dispatcher = WorkDispatcher::new().route(WorkKind::HttpCall, Arc::new(http));

    if let Some(command_line) = args.sql_client.as_deref() {
        let Some(mut sql) = SqlCliExecutor::from_command_line(command_line) else {
            bail!("--sql-client must not be empty");
        };
        if let Some(connection) = &args.connection {
            sql = sql.with_default_connection(connection.clone());
        }
        if let Some(secs) = args.stage_timeout_secs {
            sql = sql.with_timeout(Duration::from_secs(secs));
        }
        dispatcher = dispatcher.route(WorkKind::SqlScript, Arc::new(sql));
    }

    ensure_routed(pipeline, &dispatcher)?;
    Ok(Arc::new(dispatcher))
}

/// Fail before the run starts if some stage's work has no executor.
fn ensure_routed(pipeline: &Pipeline, dispatcher: &WorkDispatcher) -> anyhow::Result<()> {
    let unrouted: Vec<String> = pipeline
        .graph()
        .registry()
        .iter()
        .filter(|stage| !dispatcher.handles(stage.work.kind()))
        .map(|stage| format!("{} ({})", stage.id, stage.work.kind()))
        .collect();

    if !unrouted.is_empty() {
        bail!(
            "no executor configured for stage(s) {}; pass --sql-client or --dry-run",
            unrouted.join(", ")
        );
    }
    Ok(())
}

fn render_plan(name: &str, sets: &[Vec<String>]) -> String {
    let mut out = format!("Pipeline '{name}': {} ready set(s)\n", sets.len());
    for (i, set) in sets.iter().enumerate() {
        out.push_str(&format!("  {}. {}\n", i + 1, set.join(", ")));
    }
    out
}

fn render_summary(snapshot: &RunSnapshot) -> String {
    let mut out = format!(
        "Run {} of '{}': {}\n",
        snapshot.run_id, snapshot.pipeline, snapshot.status
    );
    for stage in &snapshot.stages {
        out.push_str(&format!(
            "  {:<45} {:<10} attempts={}",
            stage.stage_id, stage.status, stage.attempts
        ));
        if let Some(err) = &stage.last_error {
            out.push_str(&format!("  error: {err}"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use work::{HttpMethod, Work};

    #[test]
    fn plan_lists_sets_in_order() {
        let sets = vec![
            vec!["dim_lga".to_string(), "dim_listings".to_string()],
            vec!["fact_listings".to_string()],
        ];
        assert_eq!(
            render_plan("listings", &sets),
            "Pipeline 'listings': 2 ready set(s)\n  1. dim_lga, dim_listings\n  2. fact_listings\n"
        );
    }

    #[test]
    fn bundled_pipeline_definition_is_valid() {
        let path =
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../pipelines/listings_warehouse.json");
        let pipeline = load(&path).expect("bundled definition loads");

        assert_eq!(pipeline.graph().registry().len(), 9);
        assert_eq!(pipeline.settings().max_concurrency, 5);
        assert_eq!(
            pipeline.graph().ready_sets().unwrap(),
            vec![
                vec!["refresh_dim_lga", "refresh_dim_listings"],
                vec!["refresh_dim_suburb", "refresh_dim_host", "refresh_dim_date"],
                vec!["refresh_fact_listings"],
                vec![
                    "refresh_datamart_listing_neighbourhood",
                    "refresh_datamart_property_type",
                    "refresh_datamart_host_neighbourhood",
                ],
            ]
        );
    }

    fn sql_and_http_pipeline() -> Pipeline {
        let mut builder = Pipeline::builder("mixed");
        builder.stage("load", Work::sql("select 1")).unwrap();
        builder
            .stage(
                "notify",
                Work::HttpCall {
                    method: HttpMethod::Post,
                    url: "http://localhost/done".into(),
                    body: None,
                },
            )
            .unwrap();
        builder.edge("load", "notify").unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn unrouted_work_is_rejected_before_the_run() {
        let pipeline = sql_and_http_pipeline();
        let dispatcher =
            WorkDispatcher::new().route(WorkKind::HttpCall, Arc::new(DryRunExecutor));

        let err = ensure_routed(&pipeline, &dispatcher).unwrap_err().to_string();
        assert!(err.contains("load (sql_script)"), "{err}");
        assert!(!err.contains("notify"), "{err}");

        let dispatcher = dispatcher.route(WorkKind::SqlScript, Arc::new(DryRunExecutor));
        ensure_routed(&pipeline, &dispatcher).unwrap();
    }

    #[test]
    fn run_without_sql_client_fails_at_setup() {
        let cli = Cli::try_parse_from(["warehouse-pipeline", "run", "pipeline.json"]).unwrap();
        let Command::Run { mut exec, .. } = cli.command else {
            panic!("expected run");
        };
        exec.sql_client = None;

        assert!(build_executor(&exec, &sql_and_http_pipeline()).is_err());

        exec.dry_run = true;
        assert!(build_executor(&exec, &sql_and_http_pipeline()).is_ok());
    }

    #[test]
    fn cli_arguments_parse() {
        let cli = Cli::try_parse_from([
            "warehouse-pipeline",
            "run",
            "pipeline.json",
            "--dry-run",
            "--max-concurrency",
            "2",
        ])
        .unwrap();
        let Command::Run { exec, json, .. } = cli.command else {
            panic!("expected run");
        };
        assert!(exec.dry_run);
        assert!(!json);
        assert_eq!(exec.max_concurrency, Some(2));
    }
}
