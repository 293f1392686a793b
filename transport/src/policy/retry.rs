//! Retry with a fixed delay
//!
//! Deliberately small: a fixed number of retries, a fixed pause between
//! attempts and a classifier deciding which failures are worth another try.

use super::timeout::send_with_deadline;
use super::{Attempt, Policy};
use crate::context::{ExecutionContext, RETRY_ATTEMPT_KEY};
use crate::error::{HandlerError, Result};
use crate::request::{RequestInfo, Response};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Classifier = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Retry failed attempts a fixed number of times
///
/// By default only transient errors ([`HandlerError::is_transient`]) are
/// retried. [`retry_server_errors`](Self::retry_server_errors) also retries
/// 5xx and 408 responses; when retries run out the last such response is
/// returned as-is.
///
/// The current retry number is written to the execution context under
/// [`RETRY_ATTEMPT_KEY`] before each attempt.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
    attempt_timeout: Option<Duration>,
    retry_server_errors: bool,
    classifier: Classifier,
}

impl RetryPolicy {
    /// Retry up to `max_retries` times, pausing `delay` between attempts
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            attempt_timeout: None,
            retry_server_errors: false,
            classifier: Arc::new(HandlerError::is_transient),
        }
    }

    /// Replace the error classifier
    pub fn retry_if<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Bound each attempt by its own deadline
    ///
    /// A timed-out attempt fails with [`HandlerError::Timeout`] and is
    /// retried like any other transient error.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Also retry 5xx and 408 responses
    pub fn retry_server_errors(mut self) -> Self {
        self.retry_server_errors = true;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn should_retry_status(&self, status: StatusCode) -> bool {
        self.retry_server_errors
            && (status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn execute(
        &self,
        request: &RequestInfo,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        attempt: &mut dyn Attempt,
    ) -> Result<Response> {
        let mut retry: u32 = 0;
        loop {
            context.insert(RETRY_ATTEMPT_KEY, retry);

            let result = match self.attempt_timeout {
                Some(limit) => send_with_deadline(attempt, cancel, limit).await,
                None => attempt.send(cancel).await,
            };

            let exhausted = retry >= self.max_retries || cancel.is_cancelled();
            match result {
                Ok(response) if self.should_retry_status(response.status) && !exhausted => {
                    warn!(
                        request = %request,
                        attempt = retry + 1,
                        status = %response.status,
                        "retrying after server error"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if (self.classifier)(&e) && !exhausted => {
                    warn!(
                        request = %request,
                        attempt = retry + 1,
                        error = %e,
                        "retrying after failure"
                    );
                }
                Err(e) => {
                    if exhausted && retry > 0 {
                        debug!(request = %request, retries = retry, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }

            retry += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
                _ = sleep(self.delay) => {}
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::Request;
    use std::collections::VecDeque;

    /// Attempt that replays a script of outcomes
    struct Scripted {
        outcomes: VecDeque<Result<StatusCode>>,
        calls: u32,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<StatusCode>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl Attempt for Scripted {
        async fn send(&mut self, cancel: &CancellationToken) -> Result<Response> {
            self.calls += 1;
            match self.outcomes.pop_front() {
                Some(Ok(status)) => Ok(Response::new(status, Request::get("http://x").info())),
                Some(Err(e)) => Err(e),
                None => {
                    cancel.cancelled().await;
                    Err(HandlerError::Cancelled)
                }
            }
        }
    }

    async fn run(policy: &RetryPolicy, attempt: &mut Scripted) -> (Result<Response>, ExecutionContext) {
        let context = ExecutionContext::new();
        let info = Request::get("http://x").info();
        let result = policy
            .execute(&info, &context, &CancellationToken::new(), attempt)
            .await;
        (result, context)
    }

    fn connection_error() -> Result<StatusCode> {
        Err(HandlerError::Connection("refused".into()))
    }

    #[tokio::test]
    async fn test_fail_once_then_succeed() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut attempt = Scripted::new(vec![connection_error(), Ok(StatusCode::OK)]);

        let (result, context) = run(&policy, &mut attempt).await;

        assert!(result.unwrap().is_success());
        assert_eq!(attempt.calls, 2);
        assert_eq!(*context.get::<u32>(RETRY_ATTEMPT_KEY).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let mut attempt = Scripted::new(vec![
            connection_error(),
            connection_error(),
            connection_error(),
            Ok(StatusCode::OK),
        ]);

        let (result, _) = run(&policy, &mut attempt).await;

        assert!(matches!(result, Err(HandlerError::Connection(_))));
        assert_eq!(attempt.calls, policy.max_retries() + 1);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut attempt = Scripted::new(vec![Err(HandlerError::Cancelled), Ok(StatusCode::OK)]);

        let (result, _) = run(&policy, &mut attempt).await;

        assert!(matches!(result, Err(HandlerError::Cancelled)));
        assert_eq!(attempt.calls, 1);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1))
            .retry_if(|e| matches!(e, HandlerError::Send(_)));
        let mut attempt = Scripted::new(vec![
            Err(HandlerError::Send("reset".into())),
            connection_error(),
            Ok(StatusCode::OK),
        ]);

        let (result, _) = run(&policy, &mut attempt).await;

        assert!(matches!(result, Err(HandlerError::Connection(_))));
        assert_eq!(attempt.calls, 2);
    }

    #[tokio::test]
    async fn test_server_errors_return_last_response_when_exhausted() {
        let policy = RetryPolicy::new(1, Duration::from_millis(1)).retry_server_errors();
        let mut attempt = Scripted::new(vec![
            Ok(StatusCode::SERVICE_UNAVAILABLE),
            Ok(StatusCode::BAD_GATEWAY),
            Ok(StatusCode::OK),
        ]);

        let (result, _) = run(&policy, &mut attempt).await;

        assert_eq!(result.unwrap().status, StatusCode::BAD_GATEWAY);
        assert_eq!(attempt.calls, 2);
    }

    #[tokio::test]
    async fn test_server_errors_pass_through_by_default() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut attempt = Scripted::new(vec![Ok(StatusCode::INTERNAL_SERVER_ERROR)]);

        let (result, _) = run(&policy, &mut attempt).await;

        assert_eq!(result.unwrap().status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(attempt.calls, 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried() {
        let policy = RetryPolicy::new(1, Duration::from_millis(1))
            .attempt_timeout(Duration::from_millis(10));
        // Script runs out on the first call, so that attempt hangs until its deadline
        let mut attempt = Scripted::new(vec![]);

        let (result, context) = run(&policy, &mut attempt).await;

        assert!(matches!(result, Err(HandlerError::Timeout(_))));
        assert_eq!(attempt.calls, 2);
        assert_eq!(*context.get::<u32>(RETRY_ATTEMPT_KEY).unwrap(), 1);
    }
}
