//! End-to-end dispatch against mock backends.
//!
//! Run with:
//!   cargo test --test test_aggregator

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chorus::aggregator::Aggregator;
use chorus::config::Domain;
use chorus::error::AggregatorError;
use chorus::synth::{FALLBACK_TEXT, ResponseKind};

use common::*;

async fn running(config: chorus::config::AggregatorConfig) -> Aggregator {
    let agg = Aggregator::new(config);
    agg.initialize().await.expect("initialize");
    agg
}

// ── unary ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_is_synthesized_in_priority_order() {
    let alpha = MockBackend::spawn(answer_after(Duration::from_millis(30), "hi from alpha")).await;
    let beta = MockBackend::spawn(answer("hi from beta")).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]))
    .await;

    let r = agg.dispatch_unary("hello").await.unwrap();
    assert_eq!(r.kind, ResponseKind::SynthesizedResponse);
    assert_eq!(r.text, "[alpha] hi from alpha\n\n[beta] hi from beta");
    assert_eq!(r.sources, vec!["alpha", "beta"]);

    // both legs carried the same correlation id
    let (a, b) = (alpha.requests(), beta.requests());
    assert_eq!(a.len(), 1);
    assert_eq!(a[0]["kind"], "chat_message");
    assert_eq!(a[0]["source"], "aggregator");
    assert_eq!(a[0]["message"], "hello");
    assert_eq!(a[0]["correlationId"], b[0]["correlationId"]);

    let m = agg.metrics().await;
    assert_eq!(m.connected_backends, 2);
    assert_eq!(m.dispatched, 1);
    assert_eq!(m.completed, 1);
    assert_eq!(m.pending_requests, 0);
    agg.shutdown().await;
}

#[tokio::test]
async fn keyword_route_reaches_only_its_domain() {
    let alpha = MockBackend::spawn(answer("registry optimised")).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &dead_endpoint().await, Domain::Creative),
    ]))
    .await;

    let status = agg.connection_status().await;
    assert!(status["alpha"]);
    assert!(!status["beta"]);

    let r = agg.dispatch_unary("optimize the registry").await.unwrap();
    assert_eq!(r.kind, ResponseKind::UnifiedResponse);
    assert_eq!(r.text, "registry optimised");
    assert_eq!(r.sources, vec!["alpha"]);
    agg.shutdown().await;
}

#[tokio::test]
async fn every_answering_backend_is_a_source() {
    let mocks = [
        MockBackend::spawn(answer("one")).await,
        MockBackend::spawn(answer("two")).await,
        MockBackend::spawn(answer("three")).await,
    ];
    let names = ["alpha", "beta", "gamma"];
    let backends = names
        .iter()
        .zip(&mocks)
        .map(|(n, m)| chorus::config::BackendConfig::new(*n, m.endpoint()))
        .collect();
    let agg = running(config(backends)).await;

    for _ in 0..5 {
        let r = agg.dispatch_unary("hello").await.unwrap();
        assert_eq!(r.sources, vec!["alpha", "beta", "gamma"]);
    }
    agg.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_are_matched_by_correlation_id() {
    let alpha = MockBackend::spawn(Arc::new(|req: &serde_json::Value| {
        // slower answers for earlier requests, so replies arrive out of order
        let n: u64 = req["message"].as_str().unwrap().trim_start_matches("q").parse().unwrap();
        vec![Action::Send(
            Duration::from_millis(100 - n * 10),
            serde_json::json!({"correlationId": req["correlationId"], "response": format!("a{n}")}),
        )]
    }))
    .await;
    let agg = running(config(vec![chorus::config::BackendConfig::new("alpha", alpha.endpoint())])).await;

    let calls = (0..8).map(|n| {
        let agg = agg.clone();
        async move { (n, agg.dispatch_unary(&format!("q{n}")).await.unwrap()) }
    });
    for (n, r) in futures::future::join_all(calls).await {
        assert_eq!(r.text, format!("a{n}"));
    }
    assert_eq!(agg.metrics().await.pending_requests, 0);
    agg.shutdown().await;
}

#[tokio::test]
async fn backend_error_is_absorbed() {
    let alpha = MockBackend::spawn(fail_with("overloaded")).await;
    let beta = MockBackend::spawn(answer("still here")).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]))
    .await;

    let r = agg.dispatch_unary("hello").await.unwrap();
    assert_eq!(r.kind, ResponseKind::UnifiedResponse);
    assert_eq!(r.sources, vec!["beta"]);
    agg.shutdown().await;
}

#[tokio::test]
async fn all_failures_give_fallback() {
    let alpha = MockBackend::spawn(fail_with("nope")).await;
    let agg = running(config(vec![chorus::config::BackendConfig::new("alpha", alpha.endpoint())])).await;

    let r = agg.dispatch_unary("hello").await.unwrap();
    assert_eq!(r.kind, ResponseKind::FallbackResponse);
    assert_eq!(r.text, FALLBACK_TEXT);
    assert!(r.sources.is_empty());
    agg.shutdown().await;
}

#[tokio::test]
async fn hangup_mid_request_fails_that_leg() {
    let alpha = MockBackend::spawn(hang_up()).await;
    let beta = MockBackend::spawn(answer_after(Duration::from_millis(50), "beta answers")).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]))
    .await;

    let r = agg.dispatch_unary("hello").await.unwrap();
    assert_eq!(r.sources, vec!["beta"]);
    assert_eq!(r.text, "beta answers");
    agg.shutdown().await;
}

#[tokio::test]
async fn uncorrelated_reply_reaches_sole_pending_request() {
    let alpha = MockBackend::spawn(answer_uncorrelated("legacy says hi")).await;
    let agg = running(config(vec![chorus::config::BackendConfig::new("alpha", alpha.endpoint())])).await;

    let r = agg.dispatch_unary("hello").await.unwrap();
    assert_eq!(r.text, "legacy says hi");
    agg.shutdown().await;
}

#[tokio::test]
async fn serial_mode_sends_to_first_backend_only() {
    let alpha = MockBackend::spawn(answer("a")).await;
    let beta = MockBackend::spawn(answer("b")).await;
    let mut cfg = config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]);
    cfg.dispatch.enable_parallel_processing = false;
    let agg = running(cfg).await;

    let r = agg.dispatch_unary("hello").await.unwrap();
    assert_eq!(r.sources, vec!["alpha"]);
    assert!(beta.requests().is_empty());
    agg.shutdown().await;
}

// ── timeout, cancel, shutdown ────────────────────────────────────────────────

#[tokio::test]
async fn silent_backend_times_out_whole_request() {
    let alpha = MockBackend::spawn(answer_after(Duration::from_millis(600), "too late")).await;
    let beta = MockBackend::spawn(answer("hi from beta")).await;
    let mut cfg = config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]);
    cfg.dispatch.response_timeout_ms = 200;
    let agg = running(cfg).await;

    let pending = agg.submit_unary("hello").await.unwrap();
    let id = pending.correlation_id().to_string();
    let err = pending.wait().await.unwrap_err();
    assert_eq!(err, AggregatorError::ResponseTimeout { correlation_id: id, timeout_ms: 200 });
    assert_eq!(agg.metrics().await.pending_requests, 0);

    // alpha's late reply is dropped without effect
    assert!(eventually(|| async { agg.metrics().await.dropped_frames == 1 }).await);
    let m = agg.metrics().await;
    assert_eq!(m.timed_out, 1);
    assert_eq!(m.completed, 0);
    agg.shutdown().await;
}

#[tokio::test]
async fn cancelled_request_resolves_once() {
    let alpha = MockBackend::spawn(answer_after(Duration::from_millis(100), "late")).await;
    let agg = running(config(vec![chorus::config::BackendConfig::new("alpha", alpha.endpoint())])).await;

    let pending = agg.submit_unary("hello").await.unwrap();
    let id = pending.correlation_id().to_string();
    assert!(agg.cancel(&id).await);
    assert!(!agg.cancel(&id).await);
    assert_eq!(pending.wait().await.unwrap_err(), AggregatorError::Cancelled { correlation_id: id });
    assert_eq!(agg.metrics().await.cancelled, 1);
    agg.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_pending_requests() {
    let alpha = MockBackend::spawn(silent()).await;
    let agg = running(config(vec![chorus::config::BackendConfig::new("alpha", alpha.endpoint())])).await;

    let pending = agg.submit_unary("hello").await.unwrap();
    agg.shutdown().await;
    assert_eq!(pending.wait().await.unwrap_err(), AggregatorError::Shutdown);
    assert_eq!(agg.dispatch_unary("again").await.unwrap_err(), AggregatorError::Shutdown);
}

// ── streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_reaches_creative_backend() {
    let alpha = MockBackend::spawn(answer("should not be asked")).await;
    let beta = MockBackend::spawn(stream(&["Hol", "o"], Duration::from_millis(5))).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]))
    .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let r = agg
        .dispatch_streaming("reality spiral", move |c| sink.lock().unwrap().push(c.content))
        .await
        .unwrap();

    assert_eq!(r.text, "Holo");
    assert_eq!(r.sources, vec!["beta"]);
    assert_eq!(*seen.lock().unwrap(), vec!["Hol", "o"]);
    assert!(alpha.requests().is_empty());
    agg.shutdown().await;
}

#[tokio::test]
async fn streamed_output_is_stable_across_runs() {
    let alpha = MockBackend::spawn(stream(&["A1", "A2", "A3"], Duration::from_millis(7))).await;
    let beta = MockBackend::spawn(stream(&["B1", "B2"], Duration::from_millis(3))).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]))
    .await;

    for _ in 0..3 {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let r = agg
            .dispatch_streaming("hello", move |c| sink.lock().unwrap().push((c.backend, c.content)))
            .await
            .unwrap();
        assert_eq!(r.text, "A1A2A3\n\nB1B2");
        assert_eq!(r.sources, vec!["alpha", "beta"]);

        let seen = seen.lock().unwrap();
        let per = |b: &str| seen.iter().filter(|(n, _)| n == b).map(|(_, c)| c.clone()).collect::<Vec<_>>();
        assert_eq!(per("alpha"), vec!["A1", "A2", "A3"]);
        assert_eq!(per("beta"), vec!["B1", "B2"]);
    }
    agg.shutdown().await;
}

#[tokio::test]
async fn failed_stream_gives_fallback() {
    let beta = MockBackend::spawn(fail_with("stream broke")).await;
    let agg = running(config(vec![backend("beta", &beta.endpoint(), Domain::Creative)])).await;

    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = seen.clone();
    let r = agg
        .dispatch_streaming("hello", move |c| sink.lock().unwrap().push(c.content))
        .await
        .unwrap();

    assert_eq!(r.kind, ResponseKind::FallbackResponse);
    assert_eq!(r.text, FALLBACK_TEXT);
    assert!(r.sources.is_empty());
    assert!(r.failures["beta"].contains("stream broke"));
    assert!(seen.lock().unwrap().is_empty());
    agg.shutdown().await;
}

#[tokio::test]
async fn partial_stream_from_lost_backend_is_not_in_answer() {
    let alpha = MockBackend::spawn(chunk_then_hang_up("half-an-ans")).await;
    let beta = MockBackend::spawn(stream(&["B"], Duration::from_millis(50))).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &beta.endpoint(), Domain::Creative),
    ]))
    .await;

    let r = agg.dispatch_streaming("hello", |_| {}).await.unwrap();
    assert_eq!(r.kind, ResponseKind::UnifiedResponse);
    assert_eq!(r.text, "B");
    assert_eq!(r.sources, vec!["beta"]);
    assert!(r.failures.contains_key("alpha"));
    agg.shutdown().await;
}

// ── capabilities ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn reported_capabilities_replace_static_ones() {
    let alpha = MockBackend::spawn_with_greeting(
        answer("a"),
        vec![serde_json::json!({"kind": "capabilities", "capabilities": ["code_analysis", "profiling"]})],
    )
    .await;
    let beta = MockBackend::spawn(answer("b")).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems).with_capabilities(["static_only"]),
        backend("beta", &beta.endpoint(), Domain::Creative).with_capabilities(["creative_writing"]),
    ]))
    .await;

    assert!(
        eventually(|| async {
            agg.capabilities().await.for_backend("alpha").is_some_and(|c| c.contains("profiling"))
        })
        .await
    );
    let snap = agg.capabilities().await;
    assert!(!snap.unified.contains("static_only"));
    assert!(snap.unified.contains("creative_writing"));
    assert!(snap.unified.contains("code_analysis"));
    agg.shutdown().await;
}

#[tokio::test]
async fn health_tracks_connections() {
    let alpha = MockBackend::spawn(answer("a")).await;
    let agg = running(config(vec![
        backend("alpha", &alpha.endpoint(), Domain::Systems),
        backend("beta", &dead_endpoint().await, Domain::Creative),
    ]))
    .await;

    let health = agg.health().await;
    let by_name = |n: &str| health.iter().find(|h| h.backend == n).cloned().unwrap();
    let alpha_health = by_name("alpha");
    assert!(alpha_health.healthy);
    assert_eq!(alpha_health.endpoint, Some(alpha.endpoint()));
    assert_eq!(alpha_health.attempt, 0);
    let beta_health = by_name("beta");
    assert!(!beta_health.healthy);
    assert!(beta_health.attempt >= 1);
    agg.shutdown().await;
}
