//! # Prompt Gateway
//!
//! A Tower-based front door for prompt-driven completion backends. Requests are
//! admitted per client, validated, sent through a retrying and instrumented
//! service stack, and answered either as a single [`ApiResponse`] or as a
//! stream of chunked envelopes.
//!
//! ## Core Concepts
//!
//! - **Admission**: [`SlidingWindowLimiter`] allows at most N requests per
//!   client in any trailing window
//! - **Retry**: [`RetryExecutor`] re-runs a failing call with linear backoff and
//!   reports the last error
//! - **Instrumentation**: [`InstrumentedExecutor`] counts calls, failures and
//!   total duration across concurrent callers
//! - **Streaming**: [`StreamDeliverer`] turns a completed result into
//!   `Start`, `Chunk`..., then `Complete` or `Error`, watching a cancellation token
//! - **Gateway**: [`PromptGateway`] composes all of the above behind scaffold,
//!   analyze and process-document requests
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use prompt_gateway::{
//!     AnalysisRequest, GatewayConfig, GatewayRequest, MockBackend, PromptGateway, SystemClock,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> prompt_gateway::Result<()> {
//! let backend = Arc::new(MockBackend::new(Duration::from_millis(100), SystemClock::shared()));
//! let gateway = PromptGateway::builder(backend)
//!     .config(GatewayConfig::default())
//!     .build()?;
//!
//! let request = GatewayRequest::Analyze(AnalysisRequest::new("How should we shard the cache?"));
//! let response = gateway.handle("client-1", request, &CancellationToken::new()).await;
//! println!("{:?}", response.data);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod items;
pub mod observability;
pub mod prompts;
pub mod provider;
pub mod rate_limit;
pub mod resilience;
pub mod retry;
pub mod service;
pub mod streaming;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigBuilder, GatewayConfig};
pub use error::{ErrorKind, GatewayError, Result};
pub use items::{
    AnalysisRequest, ApiResponse, BatchItem, BatchItemResult, DocumentRequest, GatewayRequest,
    HealthReport, ScaffoldRequest,
};
pub use observability::{ExecutionStats, InstrumentLayer, InstrumentedExecutor};
pub use prompts::{DefaultTemplates, Prompt, PromptTemplates};
pub use provider::{BackendService, CompletionBackend, CompletionRequest, MockBackend};
pub use rate_limit::SlidingWindowLimiter;
pub use resilience::{RetryLayer, TimeoutLayer};
pub use retry::{Backoff, RetryExecutor, RetryTrace};
pub use service::{GatewayBuilder, PromptGateway};
pub use streaming::{EnvelopeStream, StreamDeliverer, StreamEnvelope};

// Re-export Tower traits so callers can compose the layers directly
pub use tower::{Layer, Service, ServiceExt};
