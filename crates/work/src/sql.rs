//! `SqlCliExecutor` — runs SQL scripts through a warehouse command-line
//! client (`snowsql`, `psql`, …).
//!
//! The client is spawned once per attempt with the script piped to stdin.
//! A `{connection}` placeholder in the argument list is replaced with the
//! work's connection name, or the executor default.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{StageContext, StageExecutionError, Work, WorkExecutor};

const CONNECTION_PLACEHOLDER: &str = "{connection}";

/// Executes [`Work::SqlScript`] by piping the script into an external client.
#[derive(Debug, Clone)]
pub struct SqlCliExecutor {
    program: String,
    args: Vec<String>,
    default_connection: Option<String>,
    timeout: Option<Duration>,
}

impl SqlCliExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            default_connection: None,
            timeout: None,
        }
    }

    /// Build from a whitespace-separated command line, e.g.
    /// `snowsql -c {connection} -o exit_on_error=true`.
    ///
    /// Returns `None` for a blank command line.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Connection used when the work does not name one.
    pub fn with_default_connection(mut self, connection: impl Into<String>) -> Self {
        self.default_connection = Some(connection.into());
        self
    }

    /// Kill the client and fail the attempt after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn resolve_args(&self, connection: Option<&str>) -> Result<Vec<String>, StageExecutionError> {
        let connection = connection.or(self.default_connection.as_deref());

        self.args
            .iter()
            .map(|arg| {
                if !arg.contains(CONNECTION_PLACEHOLDER) {
                    return Ok(arg.clone());
                }
                connection
                    .map(|c| arg.replace(CONNECTION_PLACEHOLDER, c))
                    .ok_or_else(|| {
                        StageExecutionError::new(
                            "SQL client needs a connection but none was configured",
                        )
                    })
            })
            .collect()
    }

    async fn run_client(&self, args: &[String], sql: &str) -> Result<(), StageExecutionError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StageExecutionError::new(format!("failed to spawn '{}': {e}", self.program))
            })?;

        // Feed stdin from its own task while `wait_with_output` drains stdout
        // and stderr; a client that echoes its input would otherwise block on
        // a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let script = sql.to_owned();
            tokio::spawn(async move {
                stdin.write_all(script.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let output = child.wait_with_output().await.map_err(|e| {
            StageExecutionError::new(format!("failed to wait for '{}': {e}", self.program))
        })?;

        if output.status.success() {
            if let Some(writer) = writer {
                writer
                    .await
                    .map_err(|e| StageExecutionError::new(format!("script writer failed: {e}")))?
                    .map_err(|e| StageExecutionError::new(format!("failed to write script: {e}")))?;
            }
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let last_line = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output on stderr");

        Err(StageExecutionError::new(format!(
            "'{}' exited with {}: {}",
            self.program,
            output.status,
            last_line.trim()
        )))
    }
}

#[async_trait]
impl WorkExecutor for SqlCliExecutor {
    async fn execute(&self, work: &Work, ctx: &StageContext) -> Result<(), StageExecutionError> {
        let Work::SqlScript { connection, sql } = work else {
            return Err(StageExecutionError::new(format!(
                "SQL client cannot execute {} work",
                work.kind()
            )));
        };

        let args = self.resolve_args(connection.as_deref())?;
        debug!(stage = %ctx.stage_id, program = %self.program, ?args, "running SQL client");

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_client(&args, sql))
                .await
                .map_err(|_| {
                    StageExecutionError::new(format!("SQL client timed out after {limit:?}"))
                })?,
            None => self.run_client(&args, sql).await,
        }
    }
}
