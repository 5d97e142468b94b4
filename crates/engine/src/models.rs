//! Core domain models for the pipeline engine.
//!
//! [`Stage`] and [`RetryPolicy`] are the in-memory types the registry holds.
//! The `*Definition` types are the serialised form of a pipeline, read from
//! a JSON definition file and turned into a [`Pipeline`](crate::Pipeline) by
//! [`Pipeline::from_definition`](crate::Pipeline::from_definition).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use work::{HttpMethod, Work};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How often, and how far apart, a failed stage is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: u32,
    /// Fixed delay between a failed attempt and the next one.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self { max_retries, retry_delay }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
        }
    }
}

pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 300;
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
pub const DEFAULT_MAX_ACTIVE_RUNS: usize = 1;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A named unit of work plus its execution metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Unique within a pipeline (referenced by edges).
    pub id: String,
    pub work: Work,
    pub retry: RetryPolicy,
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// `upstream` must succeed before `downstream` may start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub upstream: String,
    pub downstream: String,
}

impl Edge {
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Definition file
// ---------------------------------------------------------------------------

/// A complete pipeline definition as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: usize,
    #[serde(default)]
    pub defaults: StageDefaults,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_max_active_runs() -> usize {
    DEFAULT_MAX_ACTIVE_RUNS
}

/// Values applied to every stage that does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefaults {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Warehouse connection for SQL work that does not name one.
    #[serde(default)]
    pub connection: Option<String>,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            connection: None,
        }
    }
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

/// One stage entry in a definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub id: String,
    pub work: WorkDefinition,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
}

/// Serialised form of [`Work`]; adds `sql_file`, which is read from disk
/// (relative to the definition file) when the pipeline is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WorkDefinition {
    SqlScript {
        #[serde(default)]
        connection: Option<String>,
        sql: String,
    },
    SqlFile {
        #[serde(default)]
        connection: Option<String>,
        path: String,
    },
    HttpCall {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        body: Option<Value>,
    },
}

/// An edge entry; either side may list several stages.
///
/// `{"upstream": ["a", "b"], "downstream": "c"}` expands to `a -> c` and
/// `b -> c`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeDefinition {
    pub upstream: OneOrMany,
    pub downstream: OneOrMany,
}

impl EdgeDefinition {
    /// Every (upstream, downstream) pair this entry stands for.
    pub fn expand(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for up in self.upstream.as_slice() {
            for down in self.downstream.as_slice() {
                edges.push(Edge::new(up.clone(), down.clone()));
            }
        }
        edges
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(id) => std::slice::from_ref(id),
            Self::Many(ids) => ids,
        }
    }
}
