//! Envelope ordering, coverage and cancellation of chunked delivery.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use prompt_gateway::config::StreamConfig;
use prompt_gateway::streaming::collect_text;
use prompt_gateway::{ErrorKind, GatewayError, ManualClock, StreamDeliverer, StreamEnvelope};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

fn deliverer(chunk_size: usize, pacing: Duration) -> (StreamDeliverer, ManualClock) {
    let clock = ManualClock::default();
    let config = StreamConfig { chunk_size, pacing };
    (StreamDeliverer::new(config, Arc::new(clock.clone())), clock)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_cancel_after_third_chunk_stops_delivery() {
    let (deliverer, _clock) = deliverer(4, Duration::from_millis(100));
    let cancel = CancellationToken::new();
    let mut stream = deliverer.deliver("req-1", "a".repeat(40), cancel.clone());

    let mut chunks = 0;
    let mut terminal = None;
    while let Some(envelope) = stream.next().await {
        match envelope {
            StreamEnvelope::Chunk { .. } => {
                chunks += 1;
                if chunks == 3 {
                    cancel.cancel();
                }
            }
            StreamEnvelope::Start { .. } => {}
            other => terminal = Some(other),
        }
    }
    assert_eq!(chunks, 3);
    assert!(matches!(
        terminal,
        Some(StreamEnvelope::Error {
            kind: ErrorKind::Cancellation,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancel_without_pacing_stops_after_third_chunk() {
    let (deliverer, clock) = deliverer(1, Duration::ZERO);
    let cancel = CancellationToken::new();
    let mut stream = deliverer.deliver("req-5", "abcdefghij".into(), cancel.clone());

    let mut chunks = 0;
    let mut terminal = None;
    while let Some(envelope) = stream.next().await {
        match envelope {
            StreamEnvelope::Chunk { .. } => {
                chunks += 1;
                if chunks == 3 {
                    cancel.cancel();
                }
            }
            StreamEnvelope::Start { .. } => {}
            other => terminal = Some(other),
        }
    }
    assert!(chunks <= 4, "delivered {chunks} chunks after cancelling at 3");
    assert!(matches!(
        terminal,
        Some(StreamEnvelope::Error {
            kind: ErrorKind::Cancellation,
            ..
        })
    ));
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_cancellation_before_start_yields_start_then_error() {
    let (deliverer, _clock) = deliverer(4, Duration::ZERO);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let envelopes: Vec<_> = deliverer
        .deliver_from("req-2", futures::future::pending(), cancel)
        .collect()
        .await;
    assert_eq!(envelopes.len(), 2);
    assert!(matches!(envelopes[0], StreamEnvelope::Start { .. }));
    assert!(matches!(
        envelopes[1],
        StreamEnvelope::Error {
            kind: ErrorKind::Cancellation,
            ..
        }
    ));
}

#[tokio::test]
async fn test_pacing_waits_between_chunks_only() {
    let (deliverer, clock) = deliverer(2, Duration::from_millis(100));
    let stream = deliverer.deliver("req-3", "abcdef".into(), CancellationToken::new());
    assert_eq!(collect_text(stream).await.unwrap(), "abcdef");
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(100); 2]);
}

#[tokio::test]
async fn test_upstream_failure_is_reported_as_error_envelope() {
    let (deliverer, _clock) = deliverer(2, Duration::ZERO);
    let stream = deliverer.deliver_from(
        "req-4",
        async { Err(GatewayError::Backend("model unavailable".into())) },
        CancellationToken::new(),
    );
    let err = collect_text(stream).await.unwrap_err();
    assert!(err.to_string().contains("model unavailable"));
}

#[tokio::test]
async fn test_envelope_wire_shape_is_tagged() {
    let envelope = StreamEnvelope::Chunk {
        request_id: "r".into(),
        index: 0,
        offset: 0,
        data: "hi".into(),
    };
    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["type"], "chunk");
    assert_eq!(json["data"], "hi");
}

proptest! {
    #[test]
    fn test_chunks_cover_text_exactly_once(text in "\\PC{0,300}", chunk_size in 1usize..64) {
        let (deliverer, _clock) = deliverer(chunk_size, Duration::ZERO);
        let envelopes: Vec<_> = runtime().block_on(
            deliverer
                .deliver("req", text.clone(), CancellationToken::new())
                .collect(),
        );

        let starts = matches!(envelopes.first(), Some(StreamEnvelope::Start { .. }));
        prop_assert!(starts, "first envelope must be Start, got {:?}", envelopes.first());
        let mut rebuilt = String::new();
        let mut expected_index = 0;
        for envelope in &envelopes[1..envelopes.len() - 1] {
            match envelope {
                StreamEnvelope::Chunk { index, offset, data, .. } => {
                    prop_assert_eq!(*index, expected_index);
                    prop_assert_eq!(*offset, rebuilt.len());
                    prop_assert!(!data.is_empty(), "chunk {} is empty", index);
                    prop_assert!(
                        data.chars().count() <= chunk_size,
                        "chunk {} exceeds {} chars",
                        index,
                        chunk_size
                    );
                    rebuilt.push_str(data);
                    expected_index += 1;
                }
                other => prop_assert!(false, "unexpected envelope {:?}", other),
            }
        }
        prop_assert_eq!(&rebuilt, &text);
        match envelopes.last() {
            Some(StreamEnvelope::Complete { chunks, bytes, .. }) => {
                prop_assert_eq!(*chunks, expected_index);
                prop_assert_eq!(*bytes, text.len());
            }
            other => prop_assert!(false, "expected Complete, got {:?}", other),
        }
        let same_id = envelopes.iter().all(|e| e.request_id() == "req");
        prop_assert!(same_id, "every envelope must carry the request id");
    }
}
