//! Named clients
//!
//! [`ClientFactory::client`] hands out cheap [`Client`] handles. The pipeline
//! behind a name is built on first use and shared by every client of that
//! name afterwards.

use crate::error::{ConfigError, HandlerError, Result};
use crate::metrics::{self, Outcome};
use crate::pipeline::Pipeline;
use crate::registry::Blueprint;
use crate::request::{Request, Response};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Creates clients by logical name
///
/// Cloning is cheap; clones share the pipeline cache.
#[derive(Clone)]
pub struct ClientFactory {
    inner: Arc<FactoryInner>,
}

/// Build slot for one name; holding its lock serializes builds of that name
type Slot = Arc<Mutex<Option<Pipeline>>>;

struct FactoryInner {
    blueprint: Blueprint,
    pipelines: RwLock<HashMap<String, Slot>>,
}

impl ClientFactory {
    pub(crate) fn new(blueprint: Blueprint) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                blueprint,
                pipelines: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Get a client for `name`
    ///
    /// The first call for a name builds its pipeline; a build failure is
    /// returned and nothing is cached, so the next call tries again.
    pub fn client(&self, name: &str) -> std::result::Result<Client, ConfigError> {
        let pipeline = self.pipeline(name)?;
        Ok(Client {
            pipeline,
            timeout: self.inner.blueprint.request_timeout,
        })
    }

    /// Names whose pipelines have been built so far
    pub fn built(&self) -> Vec<String> {
        self.inner
            .pipelines
            .read()
            .iter()
            .filter(|(_, slot)| slot.lock().is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn pipeline(&self, name: &str) -> std::result::Result<Pipeline, ConfigError> {
        let existing = self.inner.pipelines.read().get(name).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => Arc::clone(
                self.inner
                    .pipelines
                    .write()
                    .entry(name.to_string())
                    .or_default(),
            ),
        };

        // Concurrent first calls for one name wait here for a single build
        let mut slot = slot.lock();
        if let Some(pipeline) = slot.as_ref() {
            return Ok(pipeline.clone());
        }

        let built = self.inner.blueprint.build(name).map_err(|e| {
            error!(client = %name, error = %e, "Failed to build client pipeline");
            e
        })?;
        info!(client = %name, chain = ?built.chain(), "Built client pipeline");
        *slot = Some(built.clone());
        Ok(built)
    }
}

/// Handle for sending requests through one named pipeline
#[derive(Clone)]
pub struct Client {
    pipeline: Pipeline,
    timeout: Option<Duration>,
}

impl Client {
    /// The logical client name
    pub fn name(&self) -> &str {
        self.pipeline.name()
    }

    /// Handler names outer-to-inner, followed by the transport name
    pub fn chain(&self) -> Vec<&'static str> {
        self.pipeline.chain()
    }

    /// Send a GET request to `url`
    pub async fn get(&self, url: impl Into<String>) -> Result<Response> {
        self.send(Request::get(url)).await
    }

    /// Send a request
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.send_with_cancel(request, &CancellationToken::new()).await
    }

    /// Send a request, giving up when `cancel` fires
    ///
    /// The configured request timeout bounds the whole call, every policy
    /// attempt included.
    pub async fn send_with_cancel(
        &self,
        mut request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let started = Instant::now();
        let token = cancel.child_token();

        let result = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.pipeline.send(&mut request, &token)).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        Err(HandlerError::Timeout(limit))
                    }
                }
            }
            None => self.pipeline.send(&mut request, &token).await,
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(HandlerError::Cancelled) => Outcome::Cancelled,
            Err(HandlerError::Timeout(_)) => Outcome::Timeout,
            Err(_) => Outcome::Failure,
        };
        metrics::try_record_request(self.name(), outcome, started.elapsed().as_secs_f64());

        result
    }
}
