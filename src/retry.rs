//! Retry with backoff
//!
//! Runs a single-shot operation up to `max_attempts` times. Attempts are
//! numbered from 0; the delay after a failed attempt `i` comes from
//! [`Backoff::delay_for_attempt`], linear (`(i + 1) * base`) by default. When
//! every attempt fails the *last* error is surfaced inside
//! [`GatewayError::RetriesExhausted`].
//!
//! Only [`ErrorKind::Backend`](crate::error::ErrorKind::Backend) failures are
//! retried. Cancellation and validation errors are returned unchanged on the
//! attempt that produced them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{sleep_or_cancel, Clock};
use crate::config::RetryConfig;
use crate::error::{GatewayError, Result};

/// Delay policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `(attempt + 1) * base`
    Linear { base: Duration },
    /// The same delay every time
    Fixed { delay: Duration },
    /// `initial * factor^attempt`, capped at `max`
    Exponential {
        initial: Duration,
        factor: f32,
        max: Duration,
    },
}

impl Backoff {
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn exponential(initial: Duration, factor: f32, max: Duration) -> Self {
        Backoff::Exponential {
            initial,
            factor,
            max,
        }
    }

    /// Reject exponential settings that would shrink, flip sign or never grow
    /// past `max`.
    pub fn validate(&self) -> Result<()> {
        if let Backoff::Exponential {
            initial,
            factor,
            max,
        } = *self
        {
            if !factor.is_finite() || factor < 1.0 {
                return Err(GatewayError::Config(format!(
                    "retry.backoff.factor must be a finite number >= 1.0, got {factor}"
                )));
            }
            if initial > max {
                return Err(GatewayError::Config(
                    "retry.backoff.initial must not exceed retry.backoff.max".into(),
                ));
            }
        }
        Ok(())
    }

    /// Delay to wait after attempt `attempt` (0-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match *self {
            Backoff::Linear { base } => {
                base.saturating_mul(u32::try_from(attempt + 1).unwrap_or(u32::MAX))
            }
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                initial,
                factor,
                max,
            } => {
                let mult = factor.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
                let secs = initial.as_secs_f64() * f64::from(mult);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::linear(Duration::from_secs(1))
    }
}

/// Record of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    pub index: usize,
    /// Display form of the failure, `None` when the attempt succeeded.
    pub error: Option<String>,
    /// Backoff slept after this attempt, if any.
    pub delay_before_next: Option<Duration>,
}

/// Outcome of [`RetryExecutor::execute_traced`] with the per-attempt history.
#[derive(Debug)]
pub struct RetryTrace<T> {
    pub result: Result<T>,
    pub attempts: Vec<RetryAttempt>,
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    backoff: Backoff,
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    pub fn new(backoff: Backoff, clock: Arc<dyn Clock>) -> Self {
        Self { backoff, clock }
    }

    pub fn from_config(config: &RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.backoff, clock)
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `operation` until it succeeds or `max_attempts` attempts have failed.
    ///
    /// `operation` receives the attempt index.
    pub async fn execute<F, Fut, T>(&self, max_attempts: usize, operation: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_traced(max_attempts, None, operation)
            .await
            .result
    }

    /// Like [`execute`](Self::execute), but backoff sleeps end early with
    /// [`GatewayError::Cancelled`] once `cancel` fires.
    pub async fn execute_until_cancelled<F, Fut, T>(
        &self,
        max_attempts: usize,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_traced(max_attempts, Some(cancel), operation)
            .await
            .result
    }

    /// Run with retries and keep the history of every attempt.
    pub async fn execute_traced<F, Fut, T>(
        &self,
        max_attempts: usize,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> RetryTrace<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = Vec::with_capacity(max_attempts);
        if max_attempts == 0 {
            return RetryTrace {
                result: Err(GatewayError::Config(
                    "max_attempts must be at least 1".into(),
                )),
                attempts,
            };
        }

        // Never cancelled; stands in when the caller passes no token.
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let mut last_error = None;

        for index in 0..max_attempts {
            match operation(index).await {
                Ok(value) => {
                    if index > 0 {
                        debug!(attempt = index, "operation succeeded after retry");
                    }
                    attempts.push(RetryAttempt {
                        index,
                        error: None,
                        delay_before_next: None,
                    });
                    return RetryTrace {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(error) if !error.kind().is_retryable() => {
                    debug!(attempt = index, %error, "non-retryable error");
                    attempts.push(RetryAttempt {
                        index,
                        error: Some(error.to_string()),
                        delay_before_next: None,
                    });
                    return RetryTrace {
                        result: Err(error),
                        attempts,
                    };
                }
                Err(error) => {
                    let is_last = index + 1 == max_attempts;
                    let delay = (!is_last).then(|| self.backoff.delay_for_attempt(index));
                    warn!(
                        attempt = index + 1,
                        max_attempts,
                        %error,
                        retry_in = ?delay,
                        "attempt failed"
                    );
                    attempts.push(RetryAttempt {
                        index,
                        error: Some(error.to_string()),
                        delay_before_next: delay,
                    });
                    last_error = Some(error);

                    if let Some(delay) = delay {
                        if let Err(cancelled) =
                            sleep_or_cancel(self.clock.as_ref(), delay, cancel).await
                        {
                            return RetryTrace {
                                result: Err(cancelled),
                                attempts,
                            };
                        }
                    }
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| GatewayError::Backend("no attempt recorded".into()));
        warn!(max_attempts, last_error = %source, "retries exhausted");
        RetryTrace {
            result: Err(GatewayError::RetriesExhausted {
                attempts: max_attempts,
                source: Box::new(source),
            }),
            attempts,
        }
    }
}
