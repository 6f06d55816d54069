//! Resilience layers: retry and caller deadline
//!
//! What this module provides
//! - `RetryLayer`: drives the inner backend service through a
//!   [`RetryExecutor`], re-issuing the same `CompletionRequest` per attempt
//! - `TimeoutLayer`: optional deadline around everything beneath it
//!
//! Composition
//! - `ServiceBuilder::new().layer(TimeoutLayer::new(limit)).layer(RetryLayer::new(exec, 3)).service(backend)`
//! - With the timeout outside the retry, the deadline bounds all attempts and
//!   their backoff together
//!
//! Errors cross these layers as `BoxError` carrying a `GatewayError`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tower::{BoxError, Layer, Service, ServiceExt};

use crate::error::GatewayError;
use crate::provider::CompletionRequest;
use crate::retry::RetryExecutor;

// ===== Retry =====

#[derive(Debug, Clone)]
pub struct RetryLayer {
    executor: Arc<RetryExecutor>,
    max_attempts: usize,
}

impl RetryLayer {
    pub fn new(executor: RetryExecutor, max_attempts: usize) -> Self {
        Self {
            executor: Arc::new(executor),
            max_attempts,
        }
    }
}

pub struct Retry<S> {
    inner: Arc<Mutex<S>>,
    executor: Arc<RetryExecutor>,
    max_attempts: usize,
}

impl<S> Clone for Retry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner: Arc::new(Mutex::new(inner)),
            executor: self.executor.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

impl<S> Service<CompletionRequest> for Retry<S>
where
    S: Service<CompletionRequest, Response = String, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = String;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CompletionRequest) -> Self::Future {
        let inner = self.inner.clone();
        let executor = self.executor.clone();
        let max_attempts = self.max_attempts;
        Box::pin(async move {
            let cancel = req.cancel.clone();
            executor
                .execute_until_cancelled(max_attempts, &cancel, |_| {
                    let inner = inner.clone();
                    let req = req.clone();
                    async move {
                        // Only readiness and dispatch hold the lock, not the call itself.
                        let fut = {
                            let mut guard = inner.lock().await;
                            ServiceExt::ready(&mut *guard)
                                .await
                                .map_err(GatewayError::from_boxed)?
                                .call(req)
                        };
                        fut.await.map_err(GatewayError::from_boxed)
                    }
                })
                .await
                .map_err(BoxError::from)
        })
    }
}

// ===== Timeout =====

#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    limit: Option<Duration>,
}

impl TimeoutLayer {
    /// `None` passes calls through untouched.
    pub fn new(limit: Option<Duration>) -> Self {
        Self { limit }
    }
}

#[derive(Clone)]
pub struct Timeout<S> {
    inner: S,
    limit: Option<Duration>,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            limit: self.limit,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let limit = self.limit;
        Box::pin(async move {
            match limit {
                None => fut.await,
                Some(dur) => match timeout(dur, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(GatewayError::DeadlineExceeded(dur).into()),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retry::Backoff;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;
    use tower::service_fn;

    fn executor() -> (RetryExecutor, ManualClock) {
        let clock = ManualClock::default();
        (
            RetryExecutor::new(
                Backoff::linear(Duration::from_millis(1)),
                Arc::new(clock.clone()),
            ),
            clock,
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("prompt", CancellationToken::new())
    }

    #[tokio::test]
    async fn test_retry_layer_eventually_succeeds() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let svc = service_fn(move |req: CompletionRequest| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err::<String, BoxError>(GatewayError::Backend("e".into()).into())
                } else {
                    Ok(req.prompt)
                }
            }
        });
        let (executor, clock) = executor();
        let svc = RetryLayer::new(executor, 5).layer(svc);
        let out = svc.oneshot(request()).await.unwrap();
        assert_eq!(out, "prompt");
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_layer_stops_at_max_attempts() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let svc = service_fn(move |_req: CompletionRequest| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move { Err::<String, BoxError>(GatewayError::Backend(format!("boom {n}")).into()) }
        });
        let (executor, _clock) = executor();
        let err = RetryLayer::new(executor, 3)
            .layer(svc)
            .oneshot(request())
            .await
            .unwrap_err();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        match GatewayError::from_boxed(err) {
            GatewayError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("boom 2"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreign_errors_are_retried_as_backend_failures() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let svc = service_fn(move |_req: CompletionRequest| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Err::<String, BoxError>("connection reset".into()) }
        });
        let (executor, _clock) = executor();
        let _ = RetryLayer::new(executor, 2).layer(svc).oneshot(request()).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_triggers_deadline_error() {
        let svc = service_fn(|_req: CompletionRequest| async move {
            sleep(Duration::from_millis(50)).await;
            Ok::<String, BoxError>("late".into())
        });
        let err = TimeoutLayer::new(Some(Duration::from_millis(5)))
            .layer(svc)
            .oneshot(request())
            .await
            .unwrap_err();
        assert!(matches!(
            GatewayError::from_boxed(err),
            GatewayError::DeadlineExceeded(_)
        ));
    }

    #[tokio::test]
    async fn test_no_timeout_passes_through() {
        let svc = service_fn(|req: CompletionRequest| async move { Ok::<_, BoxError>(req.prompt) });
        let out = TimeoutLayer::new(None)
            .layer(svc)
            .oneshot(request())
            .await
            .unwrap();
        assert_eq!(out, "prompt");
    }
}
