//! Configuration for the gateway
//!
//! Every knob has a default, so partial TOML files and environment overlays work.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::retry::Backoff;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Admission control
    pub rate_limit: RateLimitConfig,

    /// Retry policy for backend calls
    pub retry: RetryConfig,

    /// Chunked delivery
    pub stream: StreamConfig,

    /// Completion backend
    pub backend: BackendConfig,

    /// Request-shape limits
    pub requests: RequestConfig,
}

impl GatewayConfig {
    /// Reject settings that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(GatewayError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        self.retry.backoff.validate()?;
        if self.stream.chunk_size == 0 {
            return Err(GatewayError::Config(
                "stream.chunk_size must be at least 1".into(),
            ));
        }
        if self.requests.document_chunk_chars == 0 {
            return Err(GatewayError::Config(
                "requests.document_chunk_chars must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Sliding-window admission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admissions allowed per client inside one window. Zero denies everything.
    pub limit: usize,

    /// Length of the trailing window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: usize,

    /// Delay policy between attempts
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::linear(Duration::from_secs(1)),
        }
    }
}

/// Chunked delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Characters per chunk
    pub chunk_size: usize,

    /// Artificial delay between chunks
    pub pacing: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            pacing: Duration::from_millis(100),
        }
    }
}

/// Completion backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Optional deadline around each logical backend call (all attempts)
    pub timeout: Option<Duration>,

    /// Latency of the mock backend
    pub simulated_latency: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            simulated_latency: Duration::from_millis(100),
        }
    }
}

/// Limits on request shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Largest accepted batch
    pub max_batch_items: usize,

    /// Documents longer than this (in characters) are processed piecewise
    pub large_document_chars: usize,

    /// Piece size for large documents
    pub document_chunk_chars: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_batch_items: 10,
            large_document_chars: 10_000,
            document_chunk_chars: 5_000,
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: GatewayConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
        }
    }

    pub fn rate_limit(mut self, limit: usize, window: Duration) -> Self {
        self.config.rate_limit = RateLimitConfig { limit, window };
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.retry.backoff = backoff;
        self
    }

    pub fn chunk_size(mut self, chars: usize) -> Self {
        self.config.stream.chunk_size = chars;
        self
    }

    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.config.stream.pacing = pacing;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.backend.timeout = Some(timeout);
        self
    }

    pub fn simulated_latency(mut self, latency: Duration) -> Self {
        self.config.backend.simulated_latency = latency;
        self
    }

    pub fn max_batch_items(mut self, items: usize) -> Self {
        self.config.requests.max_batch_items = items;
        self
    }

    pub fn large_documents(mut self, threshold_chars: usize, chunk_chars: usize) -> Self {
        self.config.requests.large_document_chars = threshold_chars;
        self.config.requests.document_chunk_chars = chunk_chars;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

/// Load configuration from environment variables on top of the defaults
pub fn from_env() -> GatewayConfig {
    let mut config = GatewayConfig::default();

    if let Some(limit) = env_parse::<usize>("GATEWAY_RATE_LIMIT") {
        config.rate_limit.limit = limit;
    }

    if let Some(secs) = env_parse::<u64>("GATEWAY_RATE_WINDOW_SECS") {
        config.rate_limit.window = Duration::from_secs(secs);
    }

    if let Some(attempts) = env_parse::<usize>("GATEWAY_RETRY_ATTEMPTS") {
        config.retry.max_attempts = attempts;
    }

    if let Some(chars) = env_parse::<usize>("GATEWAY_STREAM_CHUNK_SIZE") {
        config.stream.chunk_size = chars;
    }

    if let Some(secs) = env_parse::<u64>("GATEWAY_TIMEOUT_SECS") {
        config.backend.timeout = Some(Duration::from_secs(secs));
    }

    config
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<Path>) -> Result<GatewayConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: GatewayConfig =
        toml::from_str(&contents).map_err(|e| GatewayError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
