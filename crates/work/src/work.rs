//! Units of work a stage can wrap.
//!
//! The engine never looks inside a [`Work`] value; it only hands it to a
//! [`WorkExecutor`](crate::WorkExecutor). Keeping the variants explicit lets
//! executors be routed by kind and replaced by fakes in tests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// An opaque, idempotent transformation executed against an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Work {
    /// A SQL script run by the warehouse.
    SqlScript {
        /// Named warehouse connection; falls back to the executor default.
        #[serde(default)]
        connection: Option<String>,
        sql: String,
    },
    /// A single HTTP request, e.g. to trigger an external refresh.
    HttpCall {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        body: Option<Value>,
    },
}

impl Work {
    /// Convenience constructor for a SQL script without an explicit connection.
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::SqlScript {
            connection: None,
            sql: sql.into(),
        }
    }

    /// The kind of work.
    pub fn kind(&self) -> WorkKind {
        match self {
            Self::SqlScript { .. } => WorkKind::SqlScript,
            Self::HttpCall { .. } => WorkKind::HttpCall,
        }
    }

    /// A short, single-line description suitable for log lines.
    ///
    /// For SQL this is the first statement line that is not a comment.
    pub fn summary(&self) -> String {
        const MAX: usize = 80;

        match self {
            Self::SqlScript { sql, .. } => {
                let line = sql
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty() && !l.starts_with("--"))
                    .unwrap_or("<empty script>");
                if line.chars().count() > MAX {
                    let cut: String = line.chars().take(MAX).collect();
                    format!("{cut}…")
                } else {
                    line.to_owned()
                }
            }
            Self::HttpCall { method, url, .. } => format!("{method} {url}"),
        }
    }
}

/// Discriminant of [`Work`], used for routing and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    SqlScript,
    HttpCall,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SqlScript => write!(f, "sql_script"),
            Self::HttpCall => write!(f, "http_call"),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sql_summary_skips_comments_and_blank_lines() {
        let work = Work::sql(
            "\n-- build the suburb dimension\n\ncreate or replace table dim_suburb as\nselect 1;",
        );
        assert_eq!(work.summary(), "create or replace table dim_suburb as");
    }

    #[test]
    fn long_sql_summary_is_truncated() {
        let work = Work::sql(format!("select {}", "x, ".repeat(60)));
        let summary = work.summary();
        assert!(summary.ends_with('…'));
        assert_eq!(summary.chars().count(), 81);
    }

    #[test]
    fn work_deserialises_from_tagged_json() {
        let work: Work = serde_json::from_value(json!({
            "type": "http_call",
            "method": "POST",
            "url": "http://localhost/refresh"
        }))
        .unwrap();

        assert_eq!(work.kind(), WorkKind::HttpCall);
        assert_eq!(work.summary(), "POST http://localhost/refresh");

        let work: Work =
            serde_json::from_value(json!({ "type": "sql_script", "sql": "select 1" })).unwrap();
        assert_eq!(work, Work::sql("select 1"));
    }
}
