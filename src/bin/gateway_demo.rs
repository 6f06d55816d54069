//! Walk through the gateway against the in-process mock backend.
//!
//! Usage: `gateway_demo [config.toml]`. Without a file, settings come from
//! `GATEWAY_*` environment variables. Set `RUST_LOG` to change verbosity.

use std::sync::Arc;

use futures::StreamExt;
use prompt_gateway::config::{from_env, from_file};
use prompt_gateway::{
    AnalysisRequest, BatchItem, GatewayRequest, MockBackend, PromptGateway, ScaffoldRequest,
    StreamEnvelope, SystemClock,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,prompt_gateway=debug")),
        )
        .with_target(false)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => from_file(path)?,
        None => from_env(),
    };
    let clock = SystemClock::shared();
    let backend = Arc::new(
        MockBackend::new(config.backend.simulated_latency, clock.clone()).with_injected_failures(2),
    );
    let gateway = Arc::new(
        PromptGateway::builder(backend.clone())
            .config(config)
            .clock(clock)
            .build()?,
    );
    let cancel = CancellationToken::new();

    println!("=== Prompt Gateway Demo ===\n");

    println!("1. Scaffold (first two backend calls fail and are retried)");
    let scaffold = GatewayRequest::Scaffold(ScaffoldRequest {
        description: "A REST API for managing tasks".into(),
        language: "rust".into(),
        template: "axum".into(),
        ..Default::default()
    });
    let resp = gateway.handle("demo", scaffold, &cancel).await;
    println!("   success={} backend calls={}", resp.success, backend.calls());
    println!("   {}\n", serde_json::to_string_pretty(&resp.data)?);

    println!("2. Validation");
    let resp = gateway
        .handle_fields("demo", "analyze", json!({"problem": ""}), &cancel)
        .await;
    println!("   success={} error={:?}\n", resp.success, resp.error);

    println!("3. Concurrent analyses");
    let tasks: Vec<_> = ["cache sharding", "schema migration", "on-call rotation"]
        .into_iter()
        .enumerate()
        .map(|(i, problem)| {
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let request = GatewayRequest::Analyze(AnalysisRequest::new(problem));
                gateway.handle(&format!("client-{i}"), request, &cancel).await
            })
        })
        .collect();
    for task in tasks {
        let resp = task.await?;
        println!("   request {} success={}", resp.request_id, resp.success);
    }
    println!();

    println!("4. Batch");
    let items = vec![
        BatchItem {
            id: "stakeholders".into(),
            request: GatewayRequest::Analyze(AnalysisRequest {
                problem: "Launch a billing portal".into(),
                analysis_type: Some("stakeholder".into()),
            }),
        },
        BatchItem {
            id: "empty".into(),
            request: GatewayRequest::Analyze(AnalysisRequest::new("")),
        },
    ];
    let resp = gateway.handle_batch("batch", items, &cancel).await;
    for item in resp.data.unwrap_or_default() {
        println!("   {} success={}", item.id, item.success);
    }
    println!();

    println!("5. Streaming with cancellation after the third chunk");
    let stream_cancel = CancellationToken::new();
    let mut stream = gateway.stream_analysis(
        "stream",
        &AnalysisRequest::new("Design a rate limiter"),
        stream_cancel.clone(),
    )?;
    let mut chunks = 0;
    while let Some(envelope) = stream.next().await {
        match &envelope {
            StreamEnvelope::Chunk { index, data, .. } => {
                chunks += 1;
                println!("   chunk {index}: {data:?}");
                if chunks == 3 {
                    stream_cancel.cancel();
                }
            }
            other => println!("   {}", serde_json::to_string(other)?),
        }
    }
    println!();

    println!("6. Rate limiting");
    let limiter = gateway.limiter();
    let mut admitted = 0;
    while limiter.admit("greedy") {
        admitted += 1;
    }
    let resp = gateway
        .handle("greedy", GatewayRequest::Analyze(AnalysisRequest::new("again")), &cancel)
        .await;
    println!(
        "   {admitted} admitted in {:?}, next request: {:?}\n",
        limiter.window(),
        resp.error
    );

    let health = gateway.health(&cancel).await;
    println!("7. Health\n   {}\n", serde_json::to_string_pretty(&health)?);

    let stats = gateway.stats();
    info!(
        calls = stats.calls,
        failures = stats.failures,
        average = ?stats.average(),
        "demo finished"
    );
    Ok(())
}
