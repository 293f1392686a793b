//! Handler system for LANKA
//!
//! Handlers wrap the terminal transport with cross-cutting behaviour. Each
//! handler receives the request, the cancellation token and a [`Next`] that
//! runs the rest of the chain.
//!
//! # Request Flow
//!
//! ```text
//! Pipeline::send ──► H0 ──► H1 ──► ... ──► Hn ──► Transport
//!                    │                              │
//!                    ◄──────── Response ◄───────────┘
//! ```
//!
//! A handler may:
//! - edit the request before calling `next.run()`
//! - short-circuit by returning without calling `next.run()`
//! - inspect or replace the response on the way out
//!
//! # Example
//!
//! ```ignore
//! struct Tagging;
//!
//! #[async_trait]
//! impl Handler for Tagging {
//!     fn name(&self) -> &'static str { "tagging" }
//!
//!     async fn send(
//!         &self,
//!         request: &mut Request,
//!         cancel: &CancellationToken,
//!         next: Next<'_>,
//!     ) -> Result<Response> {
//!         request.insert_header("x-tag", "1");
//!         next.run(request, cancel).await
//!     }
//! }
//! ```

use crate::error::Result;
use crate::request::{Request, Response};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Boxed future returned by closure handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Decorating handler
///
/// Handlers hold no reference to their inner handler. The pipeline supplies
/// the remaining chain on every call through [`Next`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handler name for identification and logging
    fn name(&self) -> &'static str;

    /// Handle a request, usually by delegating to `next`
    async fn send(
        &self,
        request: &mut Request,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<Response>;
}

/// Terminal handler that performs the actual exchange
///
/// Implementations must observe `cancel` and return
/// [`HandlerError::Cancelled`](crate::HandlerError::Cancelled) promptly once
/// it fires.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for identification and logging
    fn name(&self) -> &'static str;

    /// Send the request and produce a response
    async fn send(&self, request: &mut Request, cancel: &CancellationToken) -> Result<Response>;
}

/// The remaining handlers plus the terminal transport
///
/// `Next` is `Copy`, so a handler that needs to run the inner chain more
/// than once (a policy retrying) can keep a copy for each attempt.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    handlers: &'a [Box<dyn Handler>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    pub(crate) fn new(handlers: &'a [Box<dyn Handler>], transport: &'a dyn Transport) -> Self {
        Self {
            handlers,
            transport,
        }
    }

    /// Continue the chain, eventually calling the transport
    pub async fn run(self, request: &mut Request, cancel: &CancellationToken) -> Result<Response> {
        match self.handlers.split_first() {
            Some((head, tail)) => {
                let next = Next::new(tail, self.transport);
                head.send(request, cancel, next).await
            }
            None => self.transport.send(request, cancel).await,
        }
    }

    /// Number of handlers left before the transport
    pub fn remaining(&self) -> usize {
        self.handlers.len()
    }
}

/// Wrapper that implements `Handler` for a closure returning a boxed future
struct HandlerFn<F> {
    name: &'static str,
    f: F,
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Request, &'a CancellationToken, Next<'a>) -> BoxFuture<'a, Result<Response>>
        + Send
        + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn send(
        &self,
        request: &mut Request,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<Response> {
        (self.f)(request, cancel, next).await
    }
}

/// Create a handler from a closure
///
/// The closure must return a `Box::pin(async move { ... })` future.
///
/// # Example
///
/// ```ignore
/// let timing = handler_fn("timing", |request, cancel, next| {
///     Box::pin(async move {
///         let started = Instant::now();
///         let result = next.run(request, cancel).await;
///         println!("took {:?}", started.elapsed());
///         result
///     })
/// });
/// ```
#[must_use]
pub fn handler_fn<F>(name: &'static str, f: F) -> impl Handler
where
    F: for<'a> Fn(&'a mut Request, &'a CancellationToken, Next<'a>) -> BoxFuture<'a, Result<Response>>
        + Send
        + Sync,
{
    HandlerFn { name, f }
}

/// Adds default headers to every request
///
/// Headers already present on the request are left alone.
pub struct HeaderHandler {
    headers: HeaderMap,
}

impl HeaderHandler {
    pub fn new() -> Self {
        Self {
            headers: HeaderMap::new(),
        }
    }

    /// Add a default header
    ///
    /// Invalid names or values are skipped with a warning.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = name, "ignoring invalid default header"),
        }
        self
    }
}

impl Default for HeaderHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for HeaderHandler {
    fn name(&self) -> &'static str {
        "headers"
    }

    async fn send(
        &self,
        request: &mut Request,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<Response> {
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        next.run(request, cancel).await
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Logs every request passing through it with its outcome and duration
pub struct LoggingHandler {
    client: String,
}

impl LoggingHandler {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
        }
    }
}

#[async_trait]
impl Handler for LoggingHandler {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn send(
        &self,
        request: &mut Request,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<Response> {
        let info = request.info();
        let started = Instant::now();
        info!(client = %self.client, request = %info, "sending request");

        let result = next.run(request, cancel).await;

        let elapsed_ms = millis(started.elapsed());
        match &result {
            Ok(response) => info!(
                client = %self.client,
                request = %info,
                status = %response.status,
                elapsed_ms,
                "received response"
            ),
            Err(e) => warn!(
                client = %self.client,
                request = %info,
                error = %e,
                elapsed_ms,
                "request failed"
            ),
        }
        result
    }
}
