//! `HttpExecutor` — executes [`Work::HttpCall`] with `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tracing::debug;

use crate::{HttpMethod, StageContext, StageExecutionError, Work, WorkExecutor};

/// Sends one HTTP request per attempt; any non-2xx status is a failure.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    /// Build an executor whose requests time out after `timeout`.
    ///
    /// # Errors
    /// Fails if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn to_reqwest(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl WorkExecutor for HttpExecutor {
    async fn execute(&self, work: &Work, ctx: &StageContext) -> Result<(), StageExecutionError> {
        let Work::HttpCall { method, url, body } = work else {
            return Err(StageExecutionError::new(format!(
                "HTTP executor cannot execute {} work",
                work.kind()
            )));
        };

        debug!(stage = %ctx.stage_id, %method, %url, "sending request");

        let mut request = self
            .client
            .request(to_reqwest(*method), url)
            .header("x-pipeline-run", ctx.run_id.to_string());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StageExecutionError::new(format!("{method} {url} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StageExecutionError::new(format!("{method} {url} returned {status}")))
        }
    }
}
