//! Pipeline - assembles handlers around a terminal transport
//!
//! The [`PipelineBuilder`] validates an ordered list of handlers and a
//! primary transport, lets registered [`PipelineFilter`]s append late-bound
//! handlers, validates again and produces an immutable [`Pipeline`].
//!
//! # Example
//!
//! ```ignore
//! use lanka_transport::{HeaderHandler, HttpTransport, LoggingHandler, Pipeline};
//!
//! let pipeline = Pipeline::builder("github")
//!     .primary(Arc::new(HttpTransport::new(&config)?))
//!     .handler(LoggingHandler::new("github"))
//!     .handler(HeaderHandler::new().header("accept", "application/json"))
//!     .build()?;
//!
//! let response = pipeline.send(&mut Request::get(url), &CancellationToken::new()).await?;
//! ```
//!
//! # Composition order
//!
//! Handlers are given outer-to-inner: the first handler added sees the
//! request first and the response last.

use crate::error::{ConfigError, Result};
use crate::handler::{Handler, LoggingHandler, Next, Transport};
use crate::request::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Late-bound customization applied to every pipeline a registry builds
///
/// Filters run after the builder's own list has been validated. Whatever
/// they add is validated again before linking.
pub trait PipelineFilter: Send + Sync {
    /// Filter name for identification and logging
    fn name(&self) -> &'static str;

    /// Adjust the handler stack of the pipeline called `pipeline`
    fn configure(&self, pipeline: &str, stack: &mut HandlerStack);
}

/// Handler list handed to [`PipelineFilter`]s
pub struct HandlerStack {
    slots: Vec<Option<Box<dyn Handler>>>,
}

impl HandlerStack {
    /// Add a handler that runs before all current handlers
    pub fn push_outer(&mut self, handler: Box<dyn Handler>) {
        self.slots.insert(0, Some(handler));
    }

    /// Add a handler that runs after all current handlers
    pub fn push_inner(&mut self, handler: Box<dyn Handler>) {
        self.slots.push(Some(handler));
    }

    /// Add the output of a handler factory at the inner end
    ///
    /// An empty slot fails the build.
    pub fn push_inner_slot(&mut self, handler: Option<Box<dyn Handler>>) {
        self.slots.push(handler);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Names of the handlers currently in the stack, outer-to-inner
    pub fn names(&self) -> Vec<Option<&'static str>> {
        self.slots
            .iter()
            .map(|slot| slot.as_ref().map(|h| h.name()))
            .collect()
    }
}

/// Builder for a [`Pipeline`]
///
/// Handlers are moved into the builder, so one handler instance can only
/// ever be part of a single pipeline:
///
/// ```compile_fail
/// use lanka_transport::{HeaderHandler, Pipeline};
///
/// let shared = HeaderHandler::new();
/// let _a = Pipeline::builder("a").handler(shared);
/// let _b = Pipeline::builder("b").handler(shared); // use of moved value
/// ```
pub struct PipelineBuilder {
    name: String,
    primary: Option<Arc<dyn Transport>>,
    slots: Vec<Option<Box<dyn Handler>>>,
    filters: Vec<Arc<dyn PipelineFilter>>,
}

impl PipelineBuilder {
    /// Start building the pipeline called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary: None,
            slots: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Set the terminal transport
    pub fn primary(mut self, transport: Arc<dyn Transport>) -> Self {
        self.primary = Some(transport);
        self
    }

    /// Set the terminal transport from a factory that may produce nothing
    pub fn maybe_primary(mut self, transport: Option<Arc<dyn Transport>>) -> Self {
        self.primary = transport;
        self
    }

    /// Add a handler at the inner end of the list
    pub fn handler<H: Handler + 'static>(self, handler: H) -> Self {
        self.boxed_handler(Box::new(handler))
    }

    /// Add a boxed handler at the inner end of the list
    pub fn boxed_handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.slots.push(Some(handler));
        self
    }

    /// Add the output of a handler factory
    ///
    /// An empty slot fails [`build`](Self::build) with
    /// [`ConfigError::MissingHandler`] naming its position.
    pub fn maybe_handler(mut self, handler: Option<Box<dyn Handler>>) -> Self {
        self.slots.push(handler);
        self
    }

    /// Register a filter to run after validation
    pub fn filter(mut self, filter: Arc<dyn PipelineFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Validate and assemble the pipeline
    ///
    /// Fails without linking anything if the primary transport is missing or
    /// any handler slot is empty, before or after filters ran.
    pub fn build(self) -> std::result::Result<Pipeline, ConfigError> {
        let primary = self
            .primary
            .ok_or_else(|| ConfigError::MissingPrimaryHandler {
                pipeline: self.name.clone(),
            })?;
        validate(&self.name, &self.slots)?;

        let mut stack = HandlerStack { slots: self.slots };
        for filter in &self.filters {
            filter.configure(&self.name, &mut stack);
            debug!(
                pipeline = %self.name,
                filter = filter.name(),
                handlers = stack.len(),
                "applied pipeline filter"
            );
        }
        validate(&self.name, &stack.slots)?;

        let handlers: Vec<Box<dyn Handler>> = stack.slots.into_iter().flatten().collect();

        let pipeline = Pipeline {
            name: self.name,
            handlers: handlers.into(),
            transport: primary,
        };
        debug!(pipeline = %pipeline.name, chain = ?pipeline.chain(), "pipeline built");
        Ok(pipeline)
    }
}

fn validate(
    pipeline: &str,
    slots: &[Option<Box<dyn Handler>>],
) -> std::result::Result<(), ConfigError> {
    match slots.iter().position(Option::is_none) {
        Some(position) => Err(ConfigError::MissingHandler {
            pipeline: pipeline.to_string(),
            position,
        }),
        None => Ok(()),
    }
}

/// An immutable chain of handlers ending in a transport
///
/// Cloning is cheap and clones share the same handlers, so one pipeline can
/// serve any number of concurrent sends.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    handlers: Arc<[Box<dyn Handler>]>,
    transport: Arc<dyn Transport>,
}

impl Pipeline {
    /// Start building a pipeline
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of handlers, excluding the transport
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler names outer-to-inner, followed by the transport name
    pub fn chain(&self) -> Vec<&'static str> {
        self.handlers
            .iter()
            .map(|h| h.name())
            .chain(std::iter::once(self.transport.name()))
            .collect()
    }

    /// Send a request through every handler and the transport
    pub async fn send(&self, request: &mut Request, cancel: &CancellationToken) -> Result<Response> {
        Next::new(&self.handlers, self.transport.as_ref())
            .run(request, cancel)
            .await
    }

    /// The composed entry point
    ///
    /// With no handlers this is the primary transport itself.
    pub fn into_transport(self) -> Arc<dyn Transport> {
        if self.handlers.is_empty() {
            self.transport
        } else {
            Arc::new(self)
        }
    }
}

#[async_trait]
impl Transport for Pipeline {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    async fn send(&self, request: &mut Request, cancel: &CancellationToken) -> Result<Response> {
        Pipeline::send(self, request, cancel).await
    }
}

/// Filter that makes [`LoggingHandler`] the outermost handler of every pipeline
pub struct LoggingFilter;

impl PipelineFilter for LoggingFilter {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn configure(&self, pipeline: &str, stack: &mut HandlerStack) {
        stack.push_outer(Box::new(LoggingHandler::new(pipeline)));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::{HeaderHandler, handler_fn};
    use parking_lot::Mutex;
    use reqwest::StatusCode;

    /// Transport that records when it runs
    struct RecordingTransport {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, request: &mut Request, _: &CancellationToken) -> Result<Response> {
            self.log.lock().push("T-invoked".to_string());
            Ok(Response::new(StatusCode::ACCEPTED, request.info()).with_body("from-terminal"))
        }
    }

    fn recording(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Box<dyn Handler> {
        Box::new(handler_fn(label, move |request, cancel, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(format!("{label}-enter"));
                let result = next.run(request, cancel).await;
                log.lock().push(format!("{label}-exit"));
                result
            })
        }))
    }

    struct Named(&'static str);

    #[async_trait]
    impl Handler for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn send(
            &self,
            request: &mut Request,
            cancel: &CancellationToken,
            next: Next<'_>,
        ) -> Result<Response> {
            next.run(request, cancel).await
        }
    }

    fn terminal() -> Arc<dyn Transport> {
        Arc::new(RecordingTransport {
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    #[test]
    fn test_chain_matches_supplied_order() {
        let pipeline = Pipeline::builder("orders")
            .primary(terminal())
            .handler(Named("a"))
            .handler(Named("b"))
            .handler(Named("c"))
            .build()
            .unwrap();

        assert_eq!(pipeline.chain(), vec!["a", "b", "c", "recording"]);
        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.name(), "orders");
    }

    #[test]
    fn test_empty_handler_list_returns_primary() {
        let primary = terminal();
        let pipeline = Pipeline::builder("bare")
            .primary(primary.clone())
            .build()
            .unwrap();
        assert!(pipeline.is_empty());

        let entry = pipeline.into_transport();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&entry), Arc::as_ptr(&primary)));
    }

    #[test]
    fn test_missing_primary_fails() {
        let err = Pipeline::builder("orders")
            .handler(Named("a"))
            .build()
            .err()
            .expect("build should fail");
        assert_eq!(
            err,
            ConfigError::MissingPrimaryHandler {
                pipeline: "orders".to_string()
            }
        );
    }

    #[test]
    fn test_missing_handler_names_position() {
        let err = Pipeline::builder("orders")
            .primary(terminal())
            .handler(Named("a"))
            .maybe_handler(None)
            .handler(Named("c"))
            .build()
            .err()
            .expect("build should fail");
        assert_eq!(
            err,
            ConfigError::MissingHandler {
                pipeline: "orders".to_string(),
                position: 1
            }
        );
    }

    #[test]
    fn test_filter_runs_after_validation() {
        let pipeline = Pipeline::builder("orders")
            .primary(terminal())
            .handler(Named("a"))
            .filter(Arc::new(LoggingFilter))
            .build()
            .unwrap();

        assert_eq!(pipeline.chain(), vec!["logging", "a", "recording"]);
    }

    struct EmptySlotFilter;

    impl PipelineFilter for EmptySlotFilter {
        fn name(&self) -> &'static str {
            "empty-slot"
        }

        fn configure(&self, _pipeline: &str, stack: &mut HandlerStack) {
            stack.push_inner(Box::new(Named("late")));
            stack.push_inner_slot(None);
        }
    }

    struct ShapeRecorder {
        seen: Arc<Mutex<Vec<Option<&'static str>>>>,
    }

    impl PipelineFilter for ShapeRecorder {
        fn name(&self) -> &'static str {
            "shape-recorder"
        }

        fn configure(&self, _pipeline: &str, stack: &mut HandlerStack) {
            stack.push_outer(Box::new(Named("first")));
            *self.seen.lock() = stack.names();
        }
    }

    #[test]
    fn test_filter_sees_handler_names_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        Pipeline::builder("orders")
            .primary(terminal())
            .handler(Named("a"))
            .handler(Named("b"))
            .filter(Arc::new(ShapeRecorder {
                seen: Arc::clone(&seen),
            }))
            .build()
            .unwrap();

        assert_eq!(*seen.lock(), vec![Some("first"), Some("a"), Some("b")]);
    }

    #[test]
    fn test_filter_cannot_bypass_validation() {
        let err = Pipeline::builder("orders")
            .primary(terminal())
            .handler(Named("a"))
            .filter(Arc::new(EmptySlotFilter))
            .build()
            .err()
            .expect("build should fail");
        assert_eq!(
            err,
            ConfigError::MissingHandler {
                pipeline: "orders".to_string(),
                position: 2
            }
        );
    }

    #[tokio::test]
    async fn test_nested_call_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder("ordered")
            .primary(Arc::new(RecordingTransport { log: log.clone() }))
            .boxed_handler(recording("A", log.clone()))
            .boxed_handler(recording("B", log.clone()))
            .build()
            .unwrap();

        let mut req = Request::get("http://localhost/x");
        let resp = pipeline
            .send(&mut req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::ACCEPTED);
        assert_eq!(resp.text(), Some("from-terminal"));
        assert_eq!(resp.request.id, req.id());
        assert_eq!(
            *log.lock(),
            vec!["A-enter", "B-enter", "T-invoked", "B-exit", "A-exit"]
        );
    }

    #[tokio::test]
    async fn test_pipelines_nest() {
        let inner = Pipeline::builder("inner")
            .primary(terminal())
            .handler(HeaderHandler::new().header("x-inner", "1"))
            .build()
            .unwrap();
        let outer = Pipeline::builder("outer")
            .primary(inner.into_transport())
            .handler(Named("outer"))
            .build()
            .unwrap();

        assert_eq!(outer.chain(), vec!["outer", "pipeline"]);

        let mut req = Request::get("http://localhost");
        outer
            .send(&mut req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(req.headers().get("x-inner").unwrap(), "1");
    }
}
