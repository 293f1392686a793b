//! Handler that runs the inner chain through a policy

use super::{Attempt, Policy, PolicyRegistry, PolicySelector, PolicySource};
use crate::context::ContextScope;
use crate::error::{HandlerError, Result};
use crate::handler::{Handler, Next};
use crate::metrics;
use crate::request::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Hosts a [`Policy`] at its position in a pipeline
///
/// Per request it:
/// 1. reuses the request's execution context, or creates one it owns
/// 2. resolves the policy (static, or through a selector)
/// 3. runs the policy, which drives zero or more attempts of the inner chain
/// 4. removes the context again if it created it, on every exit path
///
/// A selector returning no policy fails with
/// [`ConfigError::NoPolicySelected`](crate::ConfigError::NoPolicySelected)
/// before any attempt.
pub struct PolicyHandler {
    source: PolicySource,
    registry: Arc<PolicyRegistry>,
}

impl PolicyHandler {
    /// Use the same policy for every request
    pub fn new(policy: Arc<dyn Policy>) -> Self {
        Self::from_source(PolicySource::Static(policy))
    }

    /// Choose the policy per request
    pub fn selected(selector: PolicySelector) -> Self {
        Self::from_source(PolicySource::Selector(selector))
    }

    pub fn from_source(source: PolicySource) -> Self {
        Self {
            source,
            registry: Arc::new(PolicyRegistry::new()),
        }
    }

    /// Registry passed to the selector
    pub fn with_registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn source(&self) -> &PolicySource {
        &self.source
    }
}

/// The send function handed to the policy
///
/// Borrows the scope for the whole execution so every attempt sees the same
/// request and context.
struct ChainAttempt<'s, 'r> {
    scope: &'s mut ContextScope<'r>,
    next: Next<'s>,
    caller: &'s CancellationToken,
    count: u32,
}

#[async_trait]
impl<'s, 'r> Attempt for ChainAttempt<'s, 'r> {
    async fn send(&mut self, cancel: &CancellationToken) -> Result<Response> {
        self.count += 1;
        let caller = self.caller;
        let next = self.next;

        self.scope.attach();
        let request = self.scope.request_mut();

        tokio::select! {
            biased;
            _ = caller.cancelled() => Err(HandlerError::Cancelled),
            _ = cancel.cancelled() => Err(HandlerError::Cancelled),
            result = next.run(request, cancel) => result,
        }
    }
}

#[async_trait]
impl Handler for PolicyHandler {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn send(
        &self,
        request: &mut Request,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<Response> {
        let mut scope = ContextScope::enter(request);

        let policy = match self.source.resolve(scope.request(), &self.registry) {
            Ok(policy) => policy,
            Err(e) => {
                error!(request = %scope.request().info(), error = %e, "no policy for request");
                return Err(e.into());
            }
        };

        let info = scope.request().info();
        let context = scope.context().clone();
        let lease = scope.lease();

        let mut attempt = ChainAttempt {
            scope: &mut scope,
            next,
            caller: cancel,
            count: 0,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HandlerError::Cancelled),
            result = policy.execute(&info, &context, cancel, &mut attempt) => result,
        };

        metrics::try_record_attempts(policy.name(), attempt.count);
        debug!(
            request = %info,
            policy = policy.name(),
            operation_key = context.operation_key(),
            attempts = attempt.count,
            lease = ?lease,
            ok = result.is_ok(),
            "policy execution finished"
        );

        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::{ExecutionContext, RETRY_ATTEMPT_KEY};
    use crate::error::ConfigError;
    use crate::handler::Transport;
    use crate::pipeline::Pipeline;
    use crate::policy::{NoopPolicy, RetryPolicy, TimeoutPolicy};
    use crate::request::RequestInfo;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Transport that fails a configurable number of times then succeeds
    struct FailNTimes {
        failures: u32,
        calls: AtomicU32,
        seen_context: Mutex<Vec<bool>>,
    }

    impl FailNTimes {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                seen_context: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FailNTimes {
        fn name(&self) -> &'static str {
            "fail_n_times"
        }

        async fn send(&self, request: &mut Request, _: &CancellationToken) -> Result<Response> {
            self.seen_context.lock().push(request.context().is_some());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(HandlerError::Connection("simulated failure".into()))
            } else {
                Ok(Response::new(StatusCode::OK, request.info()))
            }
        }
    }

    /// Transport that never answers until cancelled
    struct Hanging;

    #[async_trait]
    impl Transport for Hanging {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn send(&self, _: &mut Request, cancel: &CancellationToken) -> Result<Response> {
            cancel.cancelled().await;
            Err(HandlerError::Cancelled)
        }
    }

    fn pipeline(handler: PolicyHandler, transport: Arc<dyn Transport>) -> Pipeline {
        Pipeline::builder("policy-test")
            .primary(transport)
            .handler(handler)
            .build()
            .unwrap()
    }

    fn fast_retry(max_retries: u32) -> Arc<dyn Policy> {
        Arc::new(RetryPolicy::new(max_retries, Duration::from_millis(1)))
    }

    #[test]
    fn test_constructors_pick_source() {
        let fixed = PolicyHandler::new(Arc::new(NoopPolicy));
        assert!(matches!(fixed.source(), PolicySource::Static(p) if p.name() == "noop"));

        let chosen = PolicyHandler::selected(PolicySelector::new("by-host", |_, _| None));
        assert!(matches!(chosen.source(), PolicySource::Selector(s) if s.name() == "by-host"));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_one_failure() {
        let transport = FailNTimes::new(1);
        let pipeline = pipeline(PolicyHandler::new(fast_retry(3)), transport.clone());

        let mut req = Request::get("http://localhost");
        let resp = pipeline
            .send(&mut req, &CancellationToken::new())
            .await
            .unwrap();

        assert!(resp.is_success());
        assert_eq!(transport.calls(), 2);
        // Context was attached on every attempt
        assert_eq!(*transport.seen_context.lock(), vec![true, true]);
    }

    #[tokio::test]
    async fn test_owned_context_removed_after_success() {
        let transport = FailNTimes::new(0);
        let pipeline = pipeline(PolicyHandler::new(Arc::new(NoopPolicy)), transport.clone());

        let mut req = Request::get("http://localhost");
        pipeline
            .send(&mut req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*transport.seen_context.lock(), vec![true]);
        assert!(req.context().is_none());
    }

    #[tokio::test]
    async fn test_owned_context_removed_after_failure() {
        let transport = FailNTimes::new(10);
        let pipeline = pipeline(PolicyHandler::new(fast_retry(1)), transport.clone());

        let mut req = Request::get("http://localhost");
        let result = pipeline.send(&mut req, &CancellationToken::new()).await;

        assert!(matches!(result, Err(HandlerError::Connection(_))));
        assert_eq!(transport.calls(), 2);
        assert!(req.context().is_none());
    }

    #[tokio::test]
    async fn test_caller_context_kept_on_success_and_failure() {
        let supplied = ExecutionContext::with_operation_key("caller-op");

        let ok = pipeline(PolicyHandler::new(fast_retry(2)), FailNTimes::new(1));
        let mut req = Request::get("http://localhost").with_context(supplied.clone());
        ok.send(&mut req, &CancellationToken::new()).await.unwrap();
        assert!(req.context().unwrap().same_as(&supplied));
        // The retry policy wrote its bookkeeping into the caller's context
        assert_eq!(*supplied.get::<u32>(RETRY_ATTEMPT_KEY).unwrap(), 1);

        let failing = pipeline(PolicyHandler::new(fast_retry(0)), FailNTimes::new(5));
        let mut req = Request::get("http://localhost").with_context(supplied.clone());
        assert!(failing.send(&mut req, &CancellationToken::new()).await.is_err());
        assert!(req.context().unwrap().same_as(&supplied));
    }

    #[tokio::test]
    async fn test_caller_context_survives_inner_handler_clearing_it() {
        let supplied = ExecutionContext::with_operation_key("caller-op");
        let pipeline = Pipeline::builder("policy-test")
            .primary(FailNTimes::new(0))
            .handler(PolicyHandler::new(Arc::new(NoopPolicy)))
            .handler(crate::handler::handler_fn("clearing", |request, cancel, next| {
                request.clear_context();
                Box::pin(async move { next.run(request, cancel).await })
            }))
            .build()
            .unwrap();

        let mut req = Request::get("http://localhost").with_context(supplied.clone());
        pipeline
            .send(&mut req, &CancellationToken::new())
            .await
            .unwrap();

        assert!(req.context().unwrap().same_as(&supplied));
    }

    #[tokio::test]
    async fn test_selector_without_policy_sends_nothing() {
        let transport = FailNTimes::new(0);
        let handler = PolicyHandler::selected(PolicySelector::new("nothing", |_, _| None));
        let pipeline = pipeline(handler, transport.clone());

        let mut req = Request::get("http://localhost");
        let err = pipeline
            .send(&mut req, &CancellationToken::new())
            .await
            .err()
            .expect("should fail");

        assert!(matches!(
            err,
            HandlerError::Config(ConfigError::NoPolicySelected { ref selector }) if selector == "nothing"
        ));
        assert_eq!(transport.calls(), 0);
        assert!(req.context().is_none());
    }

    #[tokio::test]
    async fn test_selector_picks_from_registry() {
        let mut registry = PolicyRegistry::new();
        registry.insert("retry", fast_retry(2));
        registry.insert("noop", Arc::new(NoopPolicy));

        let handler = PolicyHandler::selected(PolicySelector::new("by-header", |request, registry| {
            if request.headers().contains_key("x-idempotent") {
                registry.get("retry")
            } else {
                registry.get("noop")
            }
        }))
        .with_registry(Arc::new(registry));

        let transport = FailNTimes::new(1);
        let pipeline = pipeline(handler, transport.clone());

        let mut plain = Request::post("http://localhost");
        assert!(pipeline.send(&mut plain, &CancellationToken::new()).await.is_err());

        let mut idempotent = Request::post("http://localhost").with_header("x-idempotent", "1");
        assert!(pipeline.send(&mut idempotent, &CancellationToken::new()).await.is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_caller_cancellation_during_retry_delay() {
        let transport = FailNTimes::new(10);
        let policy: Arc<dyn Policy> = Arc::new(RetryPolicy::new(5, Duration::from_secs(30)));
        let pipeline = pipeline(PolicyHandler::new(policy), transport.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut req = Request::get("http://localhost");
        let result = pipeline.send(&mut req, &cancel).await;

        assert!(matches!(result, Err(HandlerError::Cancelled)));
        assert_eq!(transport.calls(), 1);
        assert!(req.context().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_attempt() {
        let transport = FailNTimes::new(0);
        let pipeline = pipeline(PolicyHandler::new(Arc::new(NoopPolicy)), transport.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut req = Request::get("http://localhost");
        let result = pipeline.send(&mut req, &cancel).await;

        assert!(matches!(result, Err(HandlerError::Cancelled)));
        assert_eq!(transport.calls(), 0);
        assert!(req.context().is_none());
    }

    #[tokio::test]
    async fn test_policy_timeout_cancels_attempt() {
        let policy: Arc<dyn Policy> = Arc::new(TimeoutPolicy::new(Duration::from_millis(20)));
        let pipeline = pipeline(PolicyHandler::new(policy), Arc::new(Hanging));

        let mut req = Request::get("http://localhost");
        let result = pipeline.send(&mut req, &CancellationToken::new()).await;

        assert!(matches!(result, Err(HandlerError::Timeout(_))));
        assert!(req.context().is_none());
    }

    /// Policy that returns a canned response without sending
    struct CachedPolicy;

    #[async_trait]
    impl Policy for CachedPolicy {
        fn name(&self) -> &'static str {
            "cached"
        }

        async fn execute(
            &self,
            request: &RequestInfo,
            _context: &ExecutionContext,
            _cancel: &CancellationToken,
            _attempt: &mut dyn Attempt,
        ) -> Result<Response> {
            Ok(Response::new(StatusCode::NOT_MODIFIED, request.clone()))
        }
    }

    #[tokio::test]
    async fn test_policy_may_skip_sending() {
        let transport = FailNTimes::new(0);
        let pipeline = pipeline(PolicyHandler::new(Arc::new(CachedPolicy)), transport.clone());

        let mut req = Request::get("http://localhost");
        let resp = pipeline
            .send(&mut req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::NOT_MODIFIED);
        assert_eq!(transport.calls(), 0);
        assert!(req.context().is_none());
    }
}
