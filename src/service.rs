//! The request service: admission, validation and dispatch to the backend.
//!
//! Every backend call goes through one Tower stack:
//!
//! ```text
//! Instrumented -> Timeout -> Retry -> BackendService
//! ```
//!
//! so call statistics count one logical call per request, however many
//! attempts the retry layer needed underneath.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use futures::TryFutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneService;
use tower::{BoxError, ServiceBuilder, ServiceExt};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError, Result};
use crate::items::{
    AnalysisRequest, ApiResponse, BatchItem, BatchItemResult, DocumentRequest, GatewayRequest,
    HealthReport, OutputFormat, ScaffoldRequest,
};
use crate::observability::{ExecutionStats, InstrumentedExecutor};
use crate::prompts::{DefaultTemplates, Prompt, PromptTemplates};
use crate::provider::{BackendService, CompletionBackend, CompletionRequest};
use crate::rate_limit::SlidingWindowLimiter;
use crate::resilience::{RetryLayer, TimeoutLayer};
use crate::retry::RetryExecutor;
use crate::streaming::{EnvelopeStream, StreamDeliverer};

type Pipeline = BoxCloneService<CompletionRequest, String, BoxError>;

/// Builder for [`PromptGateway`].
pub struct GatewayBuilder {
    backend: Arc<dyn CompletionBackend>,
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    templates: Arc<dyn PromptTemplates>,
}

impl GatewayBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn templates(mut self, templates: Arc<dyn PromptTemplates>) -> Self {
        self.templates = templates;
        self
    }

    pub fn build(self) -> Result<PromptGateway> {
        self.config.validate()?;
        let GatewayBuilder {
            backend,
            config,
            clock,
            templates,
        } = self;

        let instruments = InstrumentedExecutor::new(clock.clone());
        let retry = RetryExecutor::from_config(&config.retry, clock.clone());
        let stack = ServiceBuilder::new()
            .layer(instruments.layer("completion"))
            .layer(TimeoutLayer::new(config.backend.timeout))
            .layer(RetryLayer::new(retry, config.retry.max_attempts))
            .service(BackendService::new(backend.clone()));

        Ok(PromptGateway {
            limiter: SlidingWindowLimiter::from_config(&config.rate_limit, clock.clone()),
            deliverer: StreamDeliverer::new(config.stream.clone(), clock),
            pipeline: Mutex::new(BoxCloneService::new(stack)),
            backend,
            templates,
            instruments,
            config,
        })
    }
}

/// Front door for scaffold, analyze and document requests.
///
/// Failures never escape as `Err` from the request handlers; they come back
/// as an [`ApiResponse`] with `success = false` and the error kind set.
pub struct PromptGateway {
    config: GatewayConfig,
    limiter: SlidingWindowLimiter,
    backend: Arc<dyn CompletionBackend>,
    templates: Arc<dyn PromptTemplates>,
    instruments: InstrumentedExecutor,
    deliverer: StreamDeliverer,
    pipeline: Mutex<Pipeline>,
}

impl PromptGateway {
    pub fn builder(backend: Arc<dyn CompletionBackend>) -> GatewayBuilder {
        GatewayBuilder {
            backend,
            config: GatewayConfig::default(),
            clock: SystemClock::shared(),
            templates: Arc::new(DefaultTemplates),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Statistics of completed backend calls.
    pub fn stats(&self) -> ExecutionStats {
        self.instruments.stats()
    }

    pub async fn handle(
        &self,
        client: &str,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> ApiResponse<Value> {
        let kind = request.kind_name();
        respond(client, kind, self.dispatch(client, &request, cancel)).await
    }

    /// Like [`handle`](Self::handle), for requests given as a kind name and a
    /// JSON object of fields.
    pub async fn handle_fields(
        &self,
        client: &str,
        kind: &str,
        fields: Value,
        cancel: &CancellationToken,
    ) -> ApiResponse<Value> {
        respond(client, kind, self.dispatch_fields(client, kind, fields, cancel)).await
    }

    /// Run up to `max_batch_items` requests concurrently.
    ///
    /// The batch is admitted once. Results keep the input order and each item
    /// fails on its own.
    pub async fn handle_batch(
        &self,
        client: &str,
        items: Vec<BatchItem>,
        cancel: &CancellationToken,
    ) -> ApiResponse<Vec<BatchItemResult>> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("batch", %request_id, client, items = items.len());
        async move {
            if let Err(err) = self.admit_batch(client, items.len()) {
                report(&err);
                return ApiResponse::failure(request_id, &err);
            }
            let results = join_all(items.into_iter().map(|item| async move {
                let outcome = match item.request.validate() {
                    Ok(()) => self.execute(&item.request, cancel).await,
                    Err(err) => Err(err),
                };
                BatchItemResult::from_outcome(item.id, outcome)
            }))
            .await;
            let failed = results.iter().filter(|r| !r.success).count();
            info!(failed, "batch completed");
            ApiResponse::success(request_id, results)
        }
        .instrument(span)
        .await
    }

    /// Start a streamed analysis.
    ///
    /// Admission and validation failures are returned before any envelope is
    /// produced. Once the stream exists, failures arrive as its terminal
    /// `Error` envelope.
    pub fn stream_analysis(
        &self,
        client: &str,
        request: &AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<EnvelopeStream> {
        self.admit(client)?;
        request.validate()?;
        let request_id = Uuid::new_v4().to_string();
        let prompt = self
            .templates
            .render(&request.analysis_type()?.prompt(&request.problem));
        let upstream = self
            .pipeline()
            .oneshot(CompletionRequest::new(prompt, cancel.clone()))
            .map_err(GatewayError::from_boxed);
        info!(%request_id, client, "streaming analysis");
        Ok(self.deliverer.deliver_from(request_id, upstream, cancel))
    }

    /// Probe the backend directly, bypassing admission and retry.
    pub async fn health(&self, cancel: &CancellationToken) -> HealthReport {
        let check = self.backend.complete("health check", cancel).await;
        let (status, backend_status) = match check {
            Ok(_) => ("healthy", "healthy".to_string()),
            Err(err) => {
                warn!(%err, "health check failed");
                ("unhealthy", format!("unhealthy: {err}"))
            }
        };
        HealthReport {
            status,
            backend: self.backend.name().to_string(),
            backend_status,
            stats: self.stats(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn admit(&self, client: &str) -> Result<()> {
        if self.limiter.admit(client) {
            Ok(())
        } else {
            Err(GatewayError::RateLimitExceeded {
                client: client.to_string(),
            })
        }
    }

    fn admit_batch(&self, client: &str, items: usize) -> Result<()> {
        self.admit(client)?;
        let max = self.config.requests.max_batch_items;
        if items > max {
            return Err(GatewayError::validation(
                "requests",
                format!("maximum {max} requests allowed per batch"),
            ));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        client: &str,
        request: &GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.admit(client)?;
        request.validate()?;
        self.execute(request, cancel).await
    }

    async fn dispatch_fields(
        &self,
        client: &str,
        kind: &str,
        fields: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.admit(client)?;
        let request = GatewayRequest::from_fields(kind, fields)?;
        request.validate()?;
        self.execute(&request, cancel).await
    }

    async fn execute(&self, request: &GatewayRequest, cancel: &CancellationToken) -> Result<Value> {
        match request {
            GatewayRequest::Scaffold(req) => self.scaffold(req, cancel).await,
            GatewayRequest::Analyze(req) => {
                let prompt = req.analysis_type()?.prompt(&req.problem);
                self.complete(&prompt, cancel).await.map(Value::String)
            }
            GatewayRequest::ProcessDocument(req) => self.process_document(req, cancel).await,
        }
    }

    async fn scaffold(&self, req: &ScaffoldRequest, cancel: &CancellationToken) -> Result<Value> {
        let settings = req.settings();
        let prompt = Prompt::ScaffoldPlan {
            description: &req.description,
            settings: &settings,
        };
        let reply = self.complete(&prompt, cancel).await?;
        Ok(serde_json::from_str(&reply).unwrap_or(Value::String(reply)))
    }

    async fn process_document(
        &self,
        req: &DocumentRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let format = req.output_format()?;
        if req.content.chars().count() > self.config.requests.large_document_chars {
            return self.process_large_document(&req.content, format, cancel).await;
        }
        self.complete(&format.prompt(&req.content), cancel)
            .await
            .map(Value::String)
    }

    /// Pieces are processed in order. A failed piece is reported inline and
    /// does not fail the document, unless the caller cancelled.
    async fn process_large_document(
        &self,
        content: &str,
        format: OutputFormat,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let chars: Vec<char> = content.chars().collect();
        let pieces = chars.chunks(self.config.requests.document_chunk_chars);
        info!(pieces = pieces.len(), "processing large document");

        let mut sections = Vec::with_capacity(pieces.len());
        for (i, piece) in pieces.enumerate() {
            let piece: String = piece.iter().collect();
            let number = i + 1;
            match self.complete(&format.prompt(&piece), cancel).await {
                Ok(reply) => sections.push(format!("Chunk {number}: {reply}")),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    warn!(chunk = number, %err, "document chunk failed");
                    sections.push(format!("Chunk {number}: Processing failed"));
                }
            }
        }
        Ok(Value::String(sections.join("\n\n")))
    }

    async fn complete(&self, prompt: &Prompt<'_>, cancel: &CancellationToken) -> Result<String> {
        let prompt = self.templates.render(prompt);
        self.pipeline()
            .oneshot(CompletionRequest::new(prompt, cancel.clone()))
            .await
            .map_err(GatewayError::from_boxed)
    }
}

async fn respond<F>(client: &str, kind: &str, work: F) -> ApiResponse<Value>
where
    F: std::future::Future<Output = Result<Value>>,
{
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("request", %request_id, kind, client);
    async move {
        match work.await {
            Ok(data) => {
                info!("request completed");
                ApiResponse::success(request_id, data)
            }
            Err(err) => {
                report(&err);
                ApiResponse::failure(request_id, &err)
            }
        }
    }
    .instrument(span)
    .await
}

fn report(err: &GatewayError) {
    match err.kind() {
        ErrorKind::Validation => info!(%err, "request rejected"),
        ErrorKind::RateLimit => warn!(%err, "request throttled"),
        ErrorKind::Cancellation => info!(%err, "request cancelled"),
        ErrorKind::Backend | ErrorKind::Stream => error!(%err, "request failed"),
    }
}
