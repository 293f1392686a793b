//! Request and Response types for LANKA
//!
//! A [`Request`] flows by mutable reference through every handler in a
//! pipeline. It carries one execution-context slot that policies use to pass
//! bookkeeping to inner handlers without widening the handler interface.
//!
//! ```text
//! Client ──► &mut Request ──► H0 ──► H1 ──► ... ──► Transport
//!                                                        │
//! Client ◄── Response { request: RequestInfo } ◄─────────┘
//! ```

use crate::context::ExecutionContext;
use crate::error::HandlerError;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// An outbound request
///
/// # Example
///
/// ```
/// use lanka_transport::Request;
///
/// let req = Request::get("https://api.example.com/users")
///     .with_header("accept", "application/json");
/// assert_eq!(req.url(), "https://api.example.com/users");
/// assert!(req.context().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: String,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    context: Option<ExecutionContext>,
}

impl Request {
    /// Create a request with an auto-generated ID
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            context: None,
        }
    }

    /// Shorthand for a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Shorthand for a POST request
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Add a header
    ///
    /// Invalid header names or values are skipped with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, HandlerError> {
        let body = serde_json::to_vec(value).map_err(|e| HandlerError::Other(Box::new(e)))?;
        self.body = Some(Bytes::from(body));
        self.insert_header("content-type", "application/json");
        Ok(self)
    }

    /// Attach an execution context before sending
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Insert or replace a header in place
    ///
    /// Returns `false` if the name or value is not a valid header.
    pub fn insert_header(&mut self, name: &str, value: &str) -> bool {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
                true
            }
            _ => {
                tracing::warn!(request_id = %self.id, header = name, "skipping invalid header");
                false
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The attached execution context, if any
    ///
    /// `None` means no context is attached, which is distinct from an
    /// attached but empty context.
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    /// Attach a context, replacing any previous one
    pub fn set_context(&mut self, context: ExecutionContext) {
        self.context = Some(context);
    }

    /// Detach and return the context
    pub fn clear_context(&mut self) -> Option<ExecutionContext> {
        self.context.take()
    }

    /// Summary used as the back-reference on responses
    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

/// Identifies the request that produced a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: String,
    pub method: Method,
    pub url: String,
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.method, self.url, self.id)
    }
}

/// The result of handling a request
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The request that produced this response
    pub request: RequestInfo,
}

impl Response {
    /// Create an empty response for `request`
    pub fn new(status: StatusCode, request: RequestInfo) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request,
        }
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as a string slice (if valid UTF-8)
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body).map_err(|e| HandlerError::Other(Box::new(e)))
    }
}
