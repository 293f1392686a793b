//! HTTP transport backed by reqwest
//!
//! The default terminal of a pipeline. Connection reuse and pooling stay with
//! the underlying `reqwest::Client`.
//!
//! # Example
//!
//! ```ignore
//! let transport = HttpTransport::new(&Config::from_env()?)?;
//! let pipeline = Pipeline::builder("github")
//!     .primary(Arc::new(transport))
//!     .build()?;
//! ```

use crate::config::Config;
use crate::error::{ConfigError, HandlerError, Result};
use crate::handler::Transport;
use crate::request::{Request, Response};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sends requests over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Build a transport with timeouts and user agent from `config`
    ///
    /// # Errors
    /// Returns `ConfigError::HttpClient` if the HTTP client cannot be created
    pub fn new(config: &Config) -> std::result::Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| ConfigError::HttpClient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout: config.request_timeout,
        })
    }

    /// Wrap an existing client
    ///
    /// `timeout` is only used to label timeout errors; the client's own
    /// settings decide when a request times out.
    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method().clone(), request.url())
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| self.map_error(e))?;

        let mut response = Response::new(status, request.info()).with_body(body);
        response.headers = headers;
        Ok(response)
    }

    fn map_error(&self, err: reqwest::Error) -> HandlerError {
        if err.is_timeout() {
            HandlerError::Timeout(self.timeout)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, request: &mut Request, cancel: &CancellationToken) -> Result<Response> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HandlerError::Cancelled),
            result = self.execute(request) => result,
        };

        match &result {
            Ok(response) => debug!(
                request = %response.request,
                status = %response.status,
                "HTTP exchange complete"
            ),
            Err(HandlerError::Cancelled) => {
                debug!(request = %request.info(), "HTTP exchange cancelled")
            }
            Err(e) => warn!(request = %request.info(), error = %e, "HTTP exchange failed"),
        }

        result
    }
}
