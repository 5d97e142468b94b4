//! `Pipeline` — stages plus their dependency graph, built once and shared
//! read-only with the executor.
//!
//! Construct one with [`Pipeline::builder`] or from a JSON definition file
//! with [`Pipeline::load`]. Every definition error (duplicate stage, unknown
//! stage, cycle) aborts construction.

use std::path::Path;
use std::time::Duration;

use tracing::debug;
use work::Work;

use crate::models::{
    PipelineDefinition, WorkDefinition, DEFAULT_MAX_ACTIVE_RUNS, DEFAULT_MAX_CONCURRENCY,
};
use crate::{DependencyGraph, EngineError, ReadySets, RetryPolicy, Stage};

/// Limits applied when the pipeline is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Maximum number of stages executing at once within a run.
    pub max_concurrency: usize,
    /// Maximum number of simultaneous runs of this pipeline.
    pub max_active_runs: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_active_runs: DEFAULT_MAX_ACTIVE_RUNS,
        }
    }
}

/// A validated pipeline definition.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    owner: Option<String>,
    description: Option<String>,
    graph: DependencyGraph,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Read and validate a JSON definition file.
    ///
    /// `sql_file` paths are resolved relative to the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let definition: PipelineDefinition = serde_json::from_str(&content)?;
        Self::from_definition(&definition, path.parent())
    }

    /// Build from an already parsed definition.
    ///
    /// `base_dir` anchors relative `sql_file` paths; `None` means the current
    /// directory.
    pub fn from_definition(
        definition: &PipelineDefinition,
        base_dir: Option<&Path>,
    ) -> Result<Self, EngineError> {
        let defaults = &definition.defaults;
        let mut builder = Self::builder(&definition.name);
        builder
            .max_concurrency(definition.max_concurrency)
            .max_active_runs(definition.max_active_runs)
            .default_retry(RetryPolicy::new(
                defaults.retries,
                Duration::from_secs(defaults.retry_delay_secs),
            ));
        builder.owner = definition.owner.clone();
        builder.description = definition.description.clone();

        for stage in &definition.stages {
            let work = resolve_work(&stage.work, defaults.connection.as_deref(), base_dir)?;
            let retry = RetryPolicy::new(
                stage.retries.unwrap_or(defaults.retries),
                Duration::from_secs(stage.retry_delay_secs.unwrap_or(defaults.retry_delay_secs)),
            );
            builder.stage_with_retry(&stage.id, work, retry)?;
        }

        for edge in definition.edges.iter().flat_map(|e| e.expand()) {
            builder.edge(&edge.upstream, &edge.downstream)?;
        }

        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    /// Look up a stage by ID.
    pub fn stage(&self, id: &str) -> Result<&Stage, EngineError> {
        self.graph.registry().get(id)
    }

    /// See [`DependencyGraph::topological_order`].
    pub fn topological_order(&self) -> ReadySets<'_> {
        self.graph.topological_order()
    }
}

fn resolve_work(
    definition: &WorkDefinition,
    default_connection: Option<&str>,
    base_dir: Option<&Path>,
) -> Result<Work, EngineError> {
    let connection =
        |own: &Option<String>| own.clone().or_else(|| default_connection.map(str::to_owned));

    Ok(match definition {
        WorkDefinition::SqlScript { connection: own, sql } => Work::SqlScript {
            connection: connection(own),
            sql: sql.clone(),
        },
        WorkDefinition::SqlFile { connection: own, path } => {
            let full = match base_dir {
                Some(dir) => dir.join(path),
                None => Path::new(path).to_path_buf(),
            };
            debug!(path = %full.display(), "loading SQL file");
            let sql = std::fs::read_to_string(&full).map_err(|source| EngineError::Io {
                path: full.clone(),
                source,
            })?;
            Work::SqlScript {
                connection: connection(own),
                sql,
            }
        }
        WorkDefinition::HttpCall { method, url, body } => Work::HttpCall {
            method: *method,
            url: url.clone(),
            body: body.clone(),
        },
    })
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

/// Incrementally declares stages and edges; each call validates immediately.
///
/// ```
/// use engine::Pipeline;
/// use work::Work;
///
/// let mut builder = Pipeline::builder("marts");
/// builder.stage("dims", Work::sql("select 1"))?;
/// builder.stage("facts", Work::sql("select 2"))?;
/// builder.edge("dims", "facts")?;
/// let pipeline = builder.build()?;
/// assert_eq!(pipeline.graph().ready_sets()?, vec![vec!["dims"], vec!["facts"]]);
/// # Ok::<(), engine::EngineError>(())
/// ```
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    owner: Option<String>,
    description: Option<String>,
    graph: DependencyGraph,
    settings: PipelineSettings,
    default_retry: RetryPolicy,
}

impl PipelineBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            description: None,
            graph: DependencyGraph::new(),
            settings: PipelineSettings::default(),
            default_retry: RetryPolicy::default(),
        }
    }

    pub fn owner(&mut self, owner: impl Into<String>) -> &mut Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn max_concurrency(&mut self, n: usize) -> &mut Self {
        self.settings.max_concurrency = n;
        self
    }

    pub fn max_active_runs(&mut self, n: usize) -> &mut Self {
        self.settings.max_active_runs = n;
        self
    }

    /// Retry policy for stages added with [`stage`](Self::stage) from now on.
    pub fn default_retry(&mut self, retry: RetryPolicy) -> &mut Self {
        self.default_retry = retry;
        self
    }

    /// Register a stage with the default retry policy.
    pub fn stage(&mut self, id: impl Into<String>, work: Work) -> Result<&mut Self, EngineError> {
        let retry = self.default_retry;
        self.stage_with_retry(id, work, retry)
    }

    pub fn stage_with_retry(
        &mut self,
        id: impl Into<String>,
        work: Work,
        retry: RetryPolicy,
    ) -> Result<&mut Self, EngineError> {
        self.graph.insert(Stage {
            id: id.into(),
            work,
            retry,
        })?;
        Ok(self)
    }

    /// Declare that `upstream` must succeed before `downstream` starts.
    pub fn edge(&mut self, upstream: &str, downstream: &str) -> Result<&mut Self, EngineError> {
        self.graph.add_edge(upstream, downstream)?;
        Ok(self)
    }

    /// Finish the pipeline.
    ///
    /// # Errors
    /// [`EngineError::InvalidConfig`] if a limit is zero.
    pub fn build(self) -> Result<Pipeline, EngineError> {
        if self.settings.max_concurrency == 0 {
            return Err(EngineError::InvalidConfig("max_concurrency must be at least 1".into()));
        }
        if self.settings.max_active_runs == 0 {
            return Err(EngineError::InvalidConfig("max_active_runs must be at least 1".into()));
        }

        Ok(Pipeline {
            name: self.name,
            owner: self.owner,
            description: self.description,
            graph: self.graph,
            settings: self.settings,
        })
    }
}
