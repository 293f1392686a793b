//! Execution context for policy bookkeeping
//!
//! An [`ExecutionContext`] is a per-execution bag of values (retry counters,
//! correlation keys) that rides on the request's context slot, so handlers
//! that know nothing about policies can still pass it along.
//!
//! [`ContextScope`] decides who owns the context for one execution:
//!
//! ```text
//! request.context() == None  ──► create, attach   ──► Owned    ──► drop clears slot
//! request.context() == Some  ──► reuse as-is      ──► Borrowed ──► drop leaves slot
//! ```
//!
//! Cleanup happens in `Drop`, so it runs on success, on error, when the
//! enclosing future is dropped by cancellation, and during unwinding.

use crate::request::Request;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Context key under which [`RetryPolicy`](crate::policy::RetryPolicy)
/// records the current attempt number (`u32`, starting at 0)
pub const RETRY_ATTEMPT_KEY: &str = "lanka.retry_attempt";

type Value = Arc<dyn Any + Send + Sync>;

struct Inner {
    operation_key: String,
    values: Mutex<HashMap<String, Value>>,
}

/// Shared, mutable key/value state for one in-flight execution
///
/// Clones share the same underlying map; use [`same_as`](Self::same_as) to
/// compare identity.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl ExecutionContext {
    /// Create an empty context with a fresh operation key
    pub fn new() -> Self {
        Self::with_operation_key(ulid::Ulid::new().to_string())
    }

    /// Create an empty context with the given operation key
    pub fn with_operation_key(key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                operation_key: key.into(),
                values: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Correlation key for this execution
    pub fn operation_key(&self) -> &str {
        &self.inner.operation_key
    }

    /// Store a value, replacing any previous value under `key`
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.values.lock().insert(key.into(), Arc::new(value));
    }

    /// Fetch a value if present and of type `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.values.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Remove a value, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.inner.values.lock().remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.values.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.values.lock().is_empty()
    }

    /// Whether both handles refer to the same context instance
    pub fn same_as(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.inner.values.lock().keys().cloned().collect();
        f.debug_struct("ExecutionContext")
            .field("operation_key", &self.inner.operation_key)
            .field("keys", &keys)
            .finish()
    }
}

/// Who is responsible for removing the context from the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextLease {
    /// Created by this scope; cleared when the scope ends
    Owned,
    /// Supplied by the caller; never cleared by this scope
    Borrowed,
}

/// Holds a request for the duration of one policy execution
///
/// The scope exclusively borrows the request. Access it through
/// [`request`](Self::request) and [`request_mut`](Self::request_mut).
pub struct ContextScope<'r> {
    request: &'r mut Request,
    context: ExecutionContext,
    lease: ContextLease,
}

impl<'r> ContextScope<'r> {
    /// Reuse the request's context or create and attach a new one
    pub fn enter(request: &'r mut Request) -> Self {
        match request.context().cloned() {
            Some(context) => Self {
                request,
                context,
                lease: ContextLease::Borrowed,
            },
            None => {
                let context = ExecutionContext::new();
                request.set_context(context.clone());
                Self {
                    request,
                    context,
                    lease: ContextLease::Owned,
                }
            }
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn lease(&self) -> ContextLease {
        self.lease
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        self.request
    }

    /// Re-attach this scope's context to the request
    ///
    /// Inner handlers may have replaced or cleared the slot during a
    /// previous attempt.
    pub fn attach(&mut self) {
        self.request.set_context(self.context.clone());
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        match self.lease {
            ContextLease::Owned => {
                self.request.clear_context();
            }
            // Inner handlers may have replaced or cleared the caller's context
            ContextLease::Borrowed => {
                let intact = self
                    .request
                    .context()
                    .is_some_and(|current| current.same_as(&self.context));
                if !intact {
                    self.attach();
                }
            }
        }
    }
}
