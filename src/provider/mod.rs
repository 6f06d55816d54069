//! Completion backend abstraction
//!
//! What this module provides
//! - `CompletionBackend`: the opaque `complete(prompt, cancel)` collaborator
//! - `MockBackend`: canned replies, simulated latency and failure injection
//! - `BackendService`: adapts any backend to
//!   `Service<CompletionRequest, Response = String, Error = BoxError>` so the
//!   resilience and observability layers can wrap it
//!
//! Cancellation
//! - `BackendService` races the backend call against the request's token, so a
//!   backend that ignores its token still gets abandoned promptly

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service};
use tracing::debug;

use crate::clock::{sleep_or_cancel, Clock};
use crate::error::{GatewayError, Result};

/// Anything that turns a prompt into completed text.
#[async_trait]
pub trait CompletionBackend: Send + Sync + 'static {
    /// Produce a completion, giving up with [`GatewayError::Cancelled`] once
    /// `cancel` fires.
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;

    fn name(&self) -> &str {
        "backend"
    }
}

/// One backend call as it travels through the service stack.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub cancel: CancellationToken,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            prompt: prompt.into(),
            cancel,
        }
    }
}

/// Tower adapter over a shared [`CompletionBackend`].
#[derive(Clone)]
pub struct BackendService {
    backend: Arc<dyn CompletionBackend>,
}

impl BackendService {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }
}

impl Service<CompletionRequest> for BackendService {
    type Response = String;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<String, BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CompletionRequest) -> Self::Future {
        let backend = self.backend.clone();
        Box::pin(async move {
            let result = tokio::select! {
                biased;
                _ = req.cancel.cancelled() => Err(GatewayError::Cancelled),
                out = backend.complete(&req.prompt, &req.cancel) => out,
            };
            debug!(backend = backend.name(), ok = result.is_ok(), "backend call finished");
            result.map_err(BoxError::from)
        })
    }
}

const PROJECT_PLAN: &str = r#"{"project":{"name":"TaskManagerAPI","language":"rust","template":"axum","package_manager":"cargo","license":"MIT"},"tree":[{"path":"src/main.rs","purpose":"Application entry point"},{"path":"src/handlers.rs","purpose":"HTTP request handlers"}]}"#;

const REASONING: &str = "**Step 1: Analysis**\nBreak down the problem\n**Step 2: Design**\nCreate solution architecture\n**Step 3: Implementation**\nBuild the solution";

const STAKEHOLDERS: &str = "## Project Stakeholders\n\n### Primary Stakeholders\n- **Product Owner**: Defines requirements and priorities\n- **Development Team**: Implements the solution\n- **End Users**: Use the system\n\n### Secondary Stakeholders\n- **DevOps Team**: Manages deployment\n- **QA Team**: Ensures quality";

/// In-process stand-in for a model endpoint.
///
/// Replies are chosen by prompt content. The first `fail_first` calls fail with
/// a backend error, which makes retry behaviour observable.
#[derive(Debug)]
pub struct MockBackend {
    latency: Duration,
    clock: Arc<dyn Clock>,
    calls: AtomicUsize,
    fail_first: usize,
}

impl MockBackend {
    pub fn new(latency: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            latency,
            clock,
            calls: AtomicUsize::new(0),
            fail_first: 0,
        }
    }

    /// Fail the first `n` calls. `usize::MAX` fails forever.
    pub fn with_injected_failures(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Calls received so far, including failed and cancelled ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply(prompt: &str, call_no: usize) -> String {
        let lowered = prompt.to_lowercase();
        if lowered.contains("project plan") {
            PROJECT_PLAN.to_string()
        } else if lowered.contains("step-by-step") {
            REASONING.to_string()
        } else if lowered.contains("stakeholder") {
            STAKEHOLDERS.to_string()
        } else {
            let head: String = prompt.chars().take(50).collect();
            format!("Mock response {call_no} for prompt: {head}...")
        }
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let call_no = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        sleep_or_cancel(self.clock.as_ref(), self.latency, cancel).await?;
        if call_no <= self.fail_first {
            return Err(GatewayError::Backend("API rate limit exceeded".into()));
        }
        Ok(Self::reply(prompt, call_no))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tower::ServiceExt;

    fn mock() -> MockBackend {
        MockBackend::new(Duration::from_millis(100), Arc::new(ManualClock::default()))
    }

    #[tokio::test]
    async fn test_mock_replies_by_prompt_content() {
        let backend = mock();
        let token = CancellationToken::new();

        let plan = backend.complete("Generate a project plan", &token).await.unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&plan).is_ok());

        let steps = backend.complete("Give a step-by-step answer", &token).await.unwrap();
        assert!(steps.starts_with("**Step 1"));

        let other = backend.complete("hello", &token).await.unwrap();
        assert_eq!(other, "Mock response 3 for prompt: hello...");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_then_success() {
        let backend = mock().with_injected_failures(2);
        let token = CancellationToken::new();
        assert!(backend.complete("x", &token).await.is_err());
        assert!(backend.complete("x", &token).await.is_err());
        assert!(backend.complete("x", &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_service_reports_cancellation() {
        let backend: Arc<dyn CompletionBackend> = Arc::new(mock());
        let token = CancellationToken::new();
        token.cancel();
        let err = BackendService::new(backend)
            .oneshot(CompletionRequest::new("x", token))
            .await
            .unwrap_err();
        assert!(GatewayError::from_boxed(err).is_cancellation());
    }

    struct Unresponsive;

    #[async_trait]
    impl CompletionBackend for Unresponsive {
        async fn complete(&self, _prompt: &str, _cancel: &CancellationToken) -> Result<String> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_service_abandons_backend_that_ignores_token() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });
        let err = BackendService::new(Arc::new(Unresponsive))
            .oneshot(CompletionRequest::new("x", token))
            .await
            .unwrap_err();
        assert!(matches!(
            GatewayError::from_boxed(err),
            GatewayError::Cancelled
        ));
    }
}
