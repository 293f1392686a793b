//! Per-attempt deadline

use super::{Attempt, Policy};
use crate::context::ExecutionContext;
use crate::error::{HandlerError, Result};
use crate::handler::millis;
use crate::request::{RequestInfo, Response};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Single attempt bounded by a deadline
///
/// The attempt runs under a child of the caller's token. When the deadline
/// passes the child is cancelled and the policy fails with
/// [`HandlerError::Timeout`], which other policies may treat as transient.
pub struct TimeoutPolicy {
    timeout: Duration,
}

impl TimeoutPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Policy for TimeoutPolicy {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn execute(
        &self,
        request: &RequestInfo,
        _context: &ExecutionContext,
        cancel: &CancellationToken,
        attempt: &mut dyn Attempt,
    ) -> Result<Response> {
        let result = send_with_deadline(attempt, cancel, self.timeout).await;
        if let Err(HandlerError::Timeout(limit)) = &result {
            warn!(request = %request, timeout_ms = millis(*limit), "attempt timed out");
        }
        result
    }
}

/// Run one attempt under a child token that is cancelled after `limit`
pub(crate) async fn send_with_deadline(
    attempt: &mut dyn Attempt,
    cancel: &CancellationToken,
    limit: Duration,
) -> Result<Response> {
    let child = cancel.child_token();
    match tokio::time::timeout(limit, attempt.send(&child)).await {
        Ok(result) => result,
        Err(_) => {
            child.cancel();
            Err(HandlerError::Timeout(limit))
        }
    }
}
