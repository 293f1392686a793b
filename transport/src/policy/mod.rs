//! Resilience policies around the inner part of a pipeline
//!
//! A [`Policy`] is an opaque strategy: it receives an [`Attempt`] and decides
//! how many times to run it, with which deadlines and delays. The crate only
//! ships small policies; anything richer plugs in through the same trait.
//!
//! [`PolicyHandler`] is the handler that hosts a policy inside a pipeline:
//!
//! ```text
//! outer handlers ──► PolicyHandler ──► policy.execute(attempt)
//!                                          │  attempt.send() ──► inner handlers ──► Transport
//!                                          │  attempt.send() ──► inner handlers ──► Transport
//!                                          ▼
//!                                      one Response or one error
//! ```
//!
//! Retries re-enter at the policy handler's position, never above it.

mod handler;
mod retry;
mod timeout;

pub use handler::PolicyHandler;
pub use retry::RetryPolicy;
pub use timeout::TimeoutPolicy;

use crate::context::ExecutionContext;
use crate::error::{ConfigError, Result};
use crate::request::{Request, RequestInfo, Response};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One run of the inner chain, as handed to a policy
#[async_trait]
pub trait Attempt: Send {
    /// Run the inner chain once
    ///
    /// `cancel` may be the caller's token or one derived from it (a child
    /// token with a deadline). The caller's own token is always observed
    /// as well.
    async fn send(&mut self, cancel: &CancellationToken) -> Result<Response>;
}

/// Resilience strategy wrapping an [`Attempt`]
///
/// Implementations may call `attempt.send` zero or more times. Whatever they
/// return is handed to the caller unchanged. Policies are shared across
/// concurrent requests and must not keep per-request state outside `context`.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Policy name for identification and logging
    fn name(&self) -> &'static str;

    /// Run `attempt` under this policy
    async fn execute(
        &self,
        request: &RequestInfo,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        attempt: &mut dyn Attempt,
    ) -> Result<Response>;
}

/// Policy that sends exactly once
pub struct NoopPolicy;

#[async_trait]
impl Policy for NoopPolicy {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(
        &self,
        _request: &RequestInfo,
        _context: &ExecutionContext,
        cancel: &CancellationToken,
        attempt: &mut dyn Attempt,
    ) -> Result<Response> {
        attempt.send(cancel).await
    }
}

/// Named policies that selectors can pick from
#[derive(Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<dyn Policy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy under `name`, replacing any previous one
    pub fn insert(&mut self, name: impl Into<String>, policy: Arc<dyn Policy>) {
        self.policies.insert(name.into(), policy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Policy>> {
        self.policies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

type SelectFn = dyn Fn(&Request, &PolicyRegistry) -> Option<Arc<dyn Policy>> + Send + Sync;

/// Picks a policy per request
///
/// # Example
///
/// ```ignore
/// let selector = PolicySelector::new("by-method", |request, registry| {
///     if request.method() == Method::GET {
///         registry.get("retry")
///     } else {
///         registry.get("noop")
///     }
/// });
/// ```
#[derive(Clone)]
pub struct PolicySelector {
    name: String,
    select: Arc<SelectFn>,
}

impl PolicySelector {
    pub fn new<F>(name: impl Into<String>, select: F) -> Self
    where
        F: Fn(&Request, &PolicyRegistry) -> Option<Arc<dyn Policy>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            select: Arc::new(select),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn select(&self, request: &Request, registry: &PolicyRegistry) -> Option<Arc<dyn Policy>> {
        (self.select)(request, registry)
    }
}

impl fmt::Debug for PolicySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicySelector")
            .field("name", &self.name)
            .finish()
    }
}

/// Where a [`PolicyHandler`] gets its policy from
#[derive(Clone)]
pub enum PolicySource {
    /// The same policy for every request
    Static(Arc<dyn Policy>),
    /// Chosen per request
    Selector(PolicySelector),
}

impl PolicySource {
    /// Resolve the policy for `request`
    ///
    /// A selector that returns nothing is a configuration error naming it.
    pub fn resolve(
        &self,
        request: &Request,
        registry: &PolicyRegistry,
    ) -> std::result::Result<Arc<dyn Policy>, ConfigError> {
        match self {
            PolicySource::Static(policy) => Ok(policy.clone()),
            PolicySource::Selector(selector) => selector.select(request, registry).ok_or_else(|| {
                ConfigError::NoPolicySelected {
                    selector: selector.name().to_string(),
                }
            }),
        }
    }
}
