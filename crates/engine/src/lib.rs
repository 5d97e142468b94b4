//! `engine` crate — pipeline domain models, the stage registry, dependency
//! graph validation, the run state machine, and the execution engine.

pub mod models;
pub mod error;
pub mod registry;
pub mod dag;
pub mod pipeline;
pub mod run;
pub mod executor;

pub use models::{Edge, PipelineDefinition, RetryPolicy, Stage};
pub use error::EngineError;
pub use registry::StageRegistry;
pub use dag::{DependencyGraph, ReadySets};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineSettings};
pub use run::{FailureOutcome, Run, RunSnapshot, RunStatus, StageState, StageStatus};
pub use executor::{ExecutorConfig, PipelineExecutor, RunHandle};

#[cfg(test)]
mod executor_tests;
