//! Observability: call statistics and tracing spans
//!
//! What this module provides
//! - `ExecutionStats { calls, failures, total_duration }`, shared by every caller
//!   of one `InstrumentedExecutor`
//! - `InstrumentedExecutor::run(fut)`: times a call and records it
//! - `InstrumentLayer`: the same around any Tower service, plus an `info_span`
//!   named after the wrapped operation
//!
//! Implementation strategy
//! - One `Mutex` guards all counters and each call is recorded in a single
//!   critical section, so a snapshot never shows a call without its duration
//! - Responses and errors are forwarded untouched

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tower::{Layer, Service};
use tracing::{debug, info_span, Instrument};

use crate::clock::Clock;

/// Aggregate counters for one executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub calls: u64,
    pub failures: u64,
    pub total_duration: Duration,
}

impl ExecutionStats {
    /// Mean call duration; `None` until at least one call has finished.
    pub fn average(&self) -> Option<Duration> {
        if self.calls == 0 {
            return None;
        }
        let nanos = self.total_duration.as_nanos() / u128::from(self.calls);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    /// Fraction of calls that succeeded; `None` when there were no calls.
    pub fn success_rate(&self) -> Option<f64> {
        if self.calls == 0 {
            return None;
        }
        Some((self.calls - self.failures) as f64 / self.calls as f64)
    }

    pub fn successes(&self) -> u64 {
        self.calls - self.failures
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentedExecutor {
    stats: Arc<Mutex<ExecutionStats>>,
    clock: Arc<dyn Clock>,
}

impl InstrumentedExecutor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            stats: Arc::new(Mutex::new(ExecutionStats::default())),
            clock,
        }
    }

    /// Await `fut`, recording its duration and outcome.
    pub async fn run<Fut, T, E>(&self, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = self.clock.now();
        let result = fut.await;
        let elapsed = self.clock.now().saturating_duration_since(started);
        self.record(elapsed, result.is_ok());
        debug!(?elapsed, ok = result.is_ok(), "call recorded");
        result
    }

    /// Consistent snapshot of the counters.
    pub fn stats(&self) -> ExecutionStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = ExecutionStats::default();
    }

    /// Layer that instruments a service, labelling its span with `operation`.
    pub fn layer(&self, operation: &'static str) -> InstrumentLayer {
        InstrumentLayer {
            executor: self.clone(),
            operation,
        }
    }

    fn record(&self, elapsed: Duration, ok: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.calls += 1;
        if !ok {
            stats.failures += 1;
        }
        stats.total_duration += elapsed;
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentLayer {
    executor: InstrumentedExecutor,
    operation: &'static str,
}

#[derive(Debug, Clone)]
pub struct Instrumented<S> {
    inner: S,
    executor: InstrumentedExecutor,
    operation: &'static str,
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = Instrumented<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Instrumented {
            inner,
            executor: self.executor.clone(),
            operation: self.operation,
        }
    }
}

impl<S, Req> Service<Req> for Instrumented<S>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let span = info_span!("call", operation = self.operation);
        let fut = self.inner.call(req);
        let executor = self.executor.clone();
        Box::pin(async move { executor.run(fut).await }.instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use tower::{service_fn, BoxError, ServiceExt};

    #[test]
    fn test_empty_stats_have_no_average() {
        let stats = ExecutionStats::default();
        assert_eq!(stats.average(), None);
        assert_eq!(stats.success_rate(), None);
    }

    #[tokio::test]
    async fn test_run_records_duration_and_outcome() {
        let clock = ManualClock::default();
        let executor = InstrumentedExecutor::new(Arc::new(clock.clone()));

        let tick = clock.clone();
        let ok: Result<u32, &str> = executor
            .run(async move {
                tick.advance(Duration::from_millis(30));
                Ok(7)
            })
            .await;
        assert_eq!(ok, Ok(7));

        let tick = clock.clone();
        let err: Result<u32, &str> = executor
            .run(async move {
                tick.advance(Duration::from_millis(10));
                Err("nope")
            })
            .await;
        assert_eq!(err, Err("nope"));

        let stats = executor.stats();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_duration, Duration::from_millis(40));
        assert_eq!(stats.average(), Some(Duration::from_millis(20)));
        assert_eq!(stats.success_rate(), Some(0.5));

        executor.reset();
        assert_eq!(executor.stats(), ExecutionStats::default());
    }

    #[tokio::test]
    async fn test_layer_forwards_errors_unchanged() {
        let executor = InstrumentedExecutor::new(SystemClock::shared());
        let svc = service_fn(|n: u32| async move {
            if n == 0 {
                Err::<u32, BoxError>("zero".into())
            } else {
                Ok(n * 2)
            }
        });
        let mut svc = executor.layer("double").layer(svc);
        assert_eq!(svc.ready().await.unwrap().call(4).await.unwrap(), 8);
        let err = svc.ready().await.unwrap().call(0).await.unwrap_err();
        assert_eq!(err.to_string(), "zero");

        let stats = executor.stats();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_all_counted() {
        let executor = InstrumentedExecutor::new(SystemClock::shared());
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move {
                    executor
                        .run(async {
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            Ok::<_, ()>(())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let stats = executor.stats();
        assert_eq!(stats.calls, 32);
        assert!(stats.total_duration >= Duration::from_millis(2 * 32));
        assert!(stats.average().unwrap() >= Duration::from_millis(2));
    }
}
