//! LANKA - named outbound request pipelines
//!
//! Consumers ask a [`ClientFactory`] for a client by logical name and send
//! requests through it without knowing how its pipeline is assembled. Each
//! pipeline is an immutable chain of decorating handlers ending in a
//! transport, with an optional policy handler that runs the inner part of
//! the chain under a resilience policy.
//!
//! # Architecture
//!
//! ```text
//! Client ──► outer handlers ──► PolicyHandler ──► inner handlers ──► Transport
//!                                   │    ▲
//!                                   ▼    │ attempts
//!                               Policy (retry, timeout, ...)
//! ```
//!
//! Handlers, transports and policies are all pluggable via traits.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod request;
pub mod telemetry;

pub use client::{Client, ClientFactory};
pub use config::{Config, LogFormat};
pub use context::{ContextLease, ContextScope, ExecutionContext, RETRY_ATTEMPT_KEY};
pub use error::{ConfigError, HandlerError, Result};
pub use handler::{Handler, HeaderHandler, LoggingHandler, Next, Transport, handler_fn};
pub use http::HttpTransport;
pub use pipeline::{HandlerStack, LoggingFilter, Pipeline, PipelineBuilder, PipelineFilter};
pub use policy::{
    Attempt, NoopPolicy, Policy, PolicyHandler, PolicyRegistry, PolicySelector, PolicySource,
    RetryPolicy, TimeoutPolicy,
};
pub use registry::{ClientBuilder, ClientRegistry};
pub use request::{Request, RequestInfo, Response};
