//! Chunked delivery of completed results
//!
//! What this module provides
//! - `StreamEnvelope::{Start, Chunk, Complete, Error}` keyed by a request id
//! - `StreamDeliverer`: turns a completed (or pending) result into a lazy,
//!   finite `Stream` of envelopes
//! - `collect_text(stream)` for callers that want the whole text back
//!
//! Guarantees per request id
//! - exactly one `Start`, then `Chunk`s with contiguous, strictly increasing
//!   byte offsets, then exactly one terminal `Complete` or `Error`
//! - once cancellation is observed no further chunk is produced; the terminal
//!   envelope is an `Error` of kind `cancellation`
//!
//! Cancellation checks
//! - the token is checked before every chunk and before `Complete`
//! - the pacing wait between chunks races the token
//!
//! The stream does nothing until polled and cannot be restarted.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::{sleep_or_cancel, Clock};
use crate::config::StreamConfig;
use crate::error::{ErrorKind, GatewayError, Result};

/// One event of a chunked response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEnvelope {
    Start {
        request_id: String,
    },
    Chunk {
        request_id: String,
        index: usize,
        /// Byte offset of `data` within the full result
        offset: usize,
        data: String,
    },
    Complete {
        request_id: String,
        chunks: usize,
        bytes: usize,
    },
    Error {
        request_id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl StreamEnvelope {
    pub fn request_id(&self) -> &str {
        match self {
            StreamEnvelope::Start { request_id }
            | StreamEnvelope::Chunk { request_id, .. }
            | StreamEnvelope::Complete { request_id, .. }
            | StreamEnvelope::Error { request_id, .. } => request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEnvelope::Complete { .. } | StreamEnvelope::Error { .. }
        )
    }
}

pub type EnvelopeStream = BoxStream<'static, StreamEnvelope>;

/// Splits results into ordered chunk envelopes.
#[derive(Debug, Clone)]
pub struct StreamDeliverer {
    config: StreamConfig,
    clock: Arc<dyn Clock>,
}

impl StreamDeliverer {
    pub fn new(config: StreamConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Deliver an already completed result.
    pub fn deliver(
        &self,
        request_id: impl Into<String>,
        result: String,
        cancel: CancellationToken,
    ) -> EnvelopeStream {
        self.deliver_from(request_id, future::ready(Ok(result)), cancel)
    }

    /// Emit `Start`, await `upstream`, then deliver its text.
    ///
    /// An upstream failure (or cancellation while waiting) becomes the
    /// terminal `Error` right after `Start`.
    pub fn deliver_from<F>(
        &self,
        request_id: impl Into<String>,
        upstream: F,
        cancel: CancellationToken,
    ) -> EnvelopeStream
    where
        F: std::future::Future<Output = Result<String>> + Send + 'static,
    {
        let delivery = Delivery {
            request_id: request_id.into(),
            phase: Phase::Start(Box::pin(upstream)),
            chunk_size: self.config.chunk_size.max(1),
            pacing: self.config.pacing,
            clock: self.clock.clone(),
            cancel,
        };
        stream::unfold(delivery, |mut delivery| async move {
            let envelope = delivery.next_envelope().await?;
            Some((envelope, delivery))
        })
        .boxed()
    }
}

enum Phase {
    Start(BoxFuture<'static, Result<String>>),
    Awaiting(BoxFuture<'static, Result<String>>),
    Chunks {
        text: String,
        offset: usize,
        index: usize,
    },
    Done,
}

struct Delivery {
    request_id: String,
    phase: Phase,
    chunk_size: usize,
    pacing: std::time::Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Delivery {
    async fn next_envelope(&mut self) -> Option<StreamEnvelope> {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Start(upstream) => {
                self.phase = Phase::Awaiting(upstream);
                Some(StreamEnvelope::Start {
                    request_id: self.request_id.clone(),
                })
            }
            Phase::Awaiting(upstream) => {
                let outcome = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
                    out = upstream => out,
                };
                match outcome {
                    Ok(text) => {
                        self.phase = Phase::Chunks {
                            text,
                            offset: 0,
                            index: 0,
                        };
                        self.next_chunk().await
                    }
                    Err(err) => Some(self.error(&err)),
                }
            }
            phase @ Phase::Chunks { .. } => {
                self.phase = phase;
                self.next_chunk().await
            }
            Phase::Done => None,
        }
    }

    async fn next_chunk(&mut self) -> Option<StreamEnvelope> {
        let Phase::Chunks {
            text,
            offset,
            index,
        } = std::mem::replace(&mut self.phase, Phase::Done)
        else {
            return None;
        };

        if self.cancel.is_cancelled() {
            return Some(self.error(&GatewayError::Cancelled));
        }
        if offset >= text.len() {
            debug!(request_id = %self.request_id, chunks = index, "stream complete");
            return Some(StreamEnvelope::Complete {
                request_id: self.request_id.clone(),
                chunks: index,
                bytes: text.len(),
            });
        }

        if index > 0 {
            if let Err(err) = sleep_or_cancel(self.clock.as_ref(), self.pacing, &self.cancel).await
            {
                return Some(self.error(&err));
            }
        }

        let end = chunk_end(&text, offset, self.chunk_size);
        let envelope = StreamEnvelope::Chunk {
            request_id: self.request_id.clone(),
            index,
            offset,
            data: text[offset..end].to_string(),
        };
        self.phase = Phase::Chunks {
            text,
            offset: end,
            index: index + 1,
        };
        Some(envelope)
    }

    fn error(&self, err: &GatewayError) -> StreamEnvelope {
        debug!(request_id = %self.request_id, %err, "stream terminated with error");
        StreamEnvelope::Error {
            request_id: self.request_id.clone(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Byte index that ends a chunk of up to `chars` characters starting at `start`.
fn chunk_end(text: &str, start: usize, chars: usize) -> usize {
    text[start..]
        .char_indices()
        .nth(chars)
        .map(|(i, _)| start + i)
        .unwrap_or(text.len())
}

/// Drain a stream back into the full text.
///
/// A terminal `Error` becomes `Err`: cancellation kinds map to
/// [`GatewayError::Cancelled`], everything else to [`GatewayError::Stream`].
pub async fn collect_text(mut stream: EnvelopeStream) -> Result<String> {
    let mut text = String::new();
    while let Some(envelope) = stream.next().await {
        match envelope {
            StreamEnvelope::Start { .. } => {}
            StreamEnvelope::Chunk { data, .. } => text.push_str(&data),
            StreamEnvelope::Complete { .. } => return Ok(text),
            StreamEnvelope::Error { kind, message, .. } => {
                return Err(match kind {
                    ErrorKind::Cancellation => GatewayError::Cancelled,
                    _ => GatewayError::Stream(message),
                })
            }
        }
    }
    Err(GatewayError::Stream("stream ended without a terminal envelope".into()))
}
