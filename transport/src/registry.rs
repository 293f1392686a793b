//! Named client registrations
//!
//! Each logical client name maps to a recipe: a primary transport, an ordered
//! list of handlers and, optionally, a policy handler at its position in that
//! list. Recipes are turned into pipelines lazily by [`ClientFactory`].
//!
//! ```text
//! ClientRegistry ──register("github")──► recipe ──into_factory()──► ClientFactory
//!                                                                     │ client("github")
//!                                                                     ▼
//!                                                                  Pipeline (built once)
//! ```

use crate::client::ClientFactory;
use crate::config::Config;
use crate::error::ConfigError;
use crate::handler::{Handler, Transport};
use crate::http::HttpTransport;
use crate::pipeline::{Pipeline, PipelineFilter};
use crate::policy::{Policy, PolicyHandler, PolicyRegistry, PolicySelector, PolicySource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) type TransportFactory = Arc<dyn Fn() -> Option<Arc<dyn Transport>> + Send + Sync>;
pub(crate) type HandlerFactory = Arc<dyn Fn() -> Option<Box<dyn Handler>> + Send + Sync>;

/// One entry of a recipe's handler list
#[derive(Clone)]
pub(crate) enum Slot {
    Handler(HandlerFactory),
    Policy(PolicySource),
}

/// How to assemble the pipeline for one client name
#[derive(Clone, Default)]
pub(crate) struct Recipe {
    pub(crate) transport: Option<TransportFactory>,
    pub(crate) slots: Vec<Slot>,
}

/// Everything needed to build pipelines, shared by the factory
pub(crate) struct Blueprint {
    pub(crate) recipes: HashMap<String, Recipe>,
    pub(crate) filters: Vec<Arc<dyn PipelineFilter>>,
    pub(crate) policies: Arc<PolicyRegistry>,
    pub(crate) default_transport: Option<Arc<dyn Transport>>,
    pub(crate) request_timeout: Option<Duration>,
}

impl Blueprint {
    /// Build a fresh pipeline for `name`
    ///
    /// Names without a recipe get the default transport, the global filters
    /// and no handlers of their own.
    pub(crate) fn build(&self, name: &str) -> Result<Pipeline, ConfigError> {
        let recipe = self.recipes.get(name);

        let primary = match recipe.and_then(|r| r.transport.as_ref()) {
            Some(factory) => factory(),
            None => self.default_transport.clone(),
        };

        let mut builder = Pipeline::builder(name).maybe_primary(primary);
        if let Some(recipe) = recipe {
            for slot in &recipe.slots {
                let handler = match slot {
                    Slot::Handler(factory) => factory(),
                    Slot::Policy(source) => Some(Box::new(
                        PolicyHandler::from_source(source.clone())
                            .with_registry(Arc::clone(&self.policies)),
                    ) as Box<dyn Handler>),
                };
                builder = builder.maybe_handler(handler);
            }
        } else {
            debug!(client = %name, "no registration, using defaults");
        }
        for filter in &self.filters {
            builder = builder.filter(Arc::clone(filter));
        }

        builder.build()
    }
}

/// Registry of named clients
///
/// Populated at startup, then frozen into a [`ClientFactory`].
///
/// # Example
///
/// ```ignore
/// let mut registry = ClientRegistry::with_http(&config)?;
/// registry
///     .register("github")
///     .handler(|| HeaderHandler::new().header("accept", "application/vnd.github+json"))
///     .policy(Arc::new(RetryPolicy::new(3, Duration::from_millis(200))));
/// let factory = registry.into_factory();
/// let github = factory.client("github")?;
/// ```
#[derive(Default)]
pub struct ClientRegistry {
    recipes: HashMap<String, Recipe>,
    filters: Vec<Arc<dyn PipelineFilter>>,
    policies: Arc<PolicyRegistry>,
    default_transport: Option<Arc<dyn Transport>>,
    request_timeout: Option<Duration>,
}

impl ClientRegistry {
    /// Create an empty registry with no default transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry whose default transport is an [`HttpTransport`]
    /// built from `config`, and whose clients use its request timeout
    pub fn with_http(config: &Config) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(config)?;
        Ok(Self {
            default_transport: Some(Arc::new(transport)),
            request_timeout: Some(config.request_timeout),
            ..Self::default()
        })
    }

    /// Start or continue the registration of `name`
    pub fn register(&mut self, name: impl Into<String>) -> ClientBuilder<'_> {
        let name = name.into();
        info!(client = %name, "Registered client");
        let recipe = self.recipes.entry(name.clone()).or_default();
        ClientBuilder { name, recipe }
    }

    /// Add a filter applied to every pipeline, in registration order
    pub fn filter(&mut self, filter: Arc<dyn PipelineFilter>) -> &mut Self {
        info!(filter = filter.name(), "Registered pipeline filter");
        self.filters.push(filter);
        self
    }

    /// Named policies handed to policy selectors
    pub fn policies(&mut self, policies: Arc<PolicyRegistry>) -> &mut Self {
        self.policies = policies;
        self
    }

    /// Transport used by clients that do not register their own
    pub fn default_transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.default_transport = Some(transport);
        self
    }

    /// Deadline for a whole client call, all attempts included
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Check if a name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.recipes.contains_key(name)
    }

    /// Get the number of registered clients
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Freeze the registry
    pub fn into_factory(self) -> ClientFactory {
        ClientFactory::new(Blueprint {
            recipes: self.recipes,
            filters: self.filters,
            policies: self.policies,
            default_transport: self.default_transport,
            request_timeout: self.request_timeout,
        })
    }
}

/// Registration of one client name
///
/// Handlers and policies are listed outer-to-inner in call order. Factories
/// run once per pipeline build, so every pipeline gets its own handler
/// instances.
pub struct ClientBuilder<'a> {
    name: String,
    recipe: &'a mut Recipe,
}

impl ClientBuilder<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Use one shared transport instance as the primary
    pub fn transport(self, transport: Arc<dyn Transport>) -> Self {
        self.transport_factory(move || Some(Arc::clone(&transport)))
    }

    /// Produce the primary transport per build
    ///
    /// A factory returning `None` makes the build fail with
    /// [`ConfigError::MissingPrimaryHandler`].
    pub fn transport_factory<F>(self, factory: F) -> Self
    where
        F: Fn() -> Option<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.recipe.transport = Some(Arc::new(factory));
        self
    }

    /// Append a handler built by `factory`
    pub fn handler<F, H>(self, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.handler_factory(move || Some(Box::new(factory()) as Box<dyn Handler>))
    }

    /// Append a handler slot whose factory may produce nothing
    ///
    /// A factory returning `None` makes the build fail with
    /// [`ConfigError::MissingHandler`] naming this slot's position.
    pub fn handler_factory<F>(self, factory: F) -> Self
    where
        F: Fn() -> Option<Box<dyn Handler>> + Send + Sync + 'static,
    {
        self.recipe.slots.push(Slot::Handler(Arc::new(factory)));
        self
    }

    /// Append a policy handler using the same policy for every request
    pub fn policy(self, policy: Arc<dyn Policy>) -> Self {
        self.recipe.slots.push(Slot::Policy(PolicySource::Static(policy)));
        self
    }

    /// Append a policy handler choosing its policy per request
    pub fn policy_selector(self, selector: PolicySelector) -> Self {
        self.recipe.slots.push(Slot::Policy(PolicySource::Selector(selector)));
        self
    }
}
