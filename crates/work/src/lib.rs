//! `work` crate — units of work, the `WorkExecutor` trait, and built-in
//! executors.
//!
//! The engine dispatches every stage attempt through [`WorkExecutor`]; it
//! never inspects the [`Work`] it hands over.

pub mod error;
pub mod work;
pub mod traits;
pub mod mock;
pub mod dry_run;
pub mod sql;
pub mod http;
pub mod dispatch;

pub use error::StageExecutionError;
pub use work::{HttpMethod, Work, WorkKind};
pub use traits::{StageContext, WorkExecutor};
pub use dry_run::DryRunExecutor;
pub use sql::SqlCliExecutor;
pub use http::HttpExecutor;
pub use dispatch::WorkDispatcher;
