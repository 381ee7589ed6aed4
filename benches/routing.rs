//! Routing hot-path benchmarks.
//!
//! Targets:
//! - Complexity scoring (short prompt):  < 5μs
//! - Routing decision:                   < 2μs
//! - Cached dispatch (hit path):         < 50μs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use edgellm_router::audit::TracingAuditSink;
use edgellm_router::routing::RoutingInputs;
use edgellm_router::{
    Backend, BackendRegistry, ComplexityScorer, InferenceRequest, LoadSnapshot,
    RequestDispatcher, RoutingDecisionEngine, ServiceTier, SharedConfig, SimulatedBackend,
};
use edgellm_router::resilience::HealthSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prompt_of(words: usize) -> String {
    let mut p = String::from("Compare the two designs.\n1. latency\n2. cost\n");
    p.push_str(&"token ".repeat(words));
    p
}

// ---------------------------------------------------------------------------
// Bench: complexity scoring by prompt size
// ---------------------------------------------------------------------------

fn bench_scorer(c: &mut Criterion) {
    let scorer = ComplexityScorer::new();
    let mut group = c.benchmark_group("complexity_score");
    for words in [10usize, 100, 1000] {
        let req = InferenceRequest::new("bench", prompt_of(words));
        group.bench_with_input(BenchmarkId::from_parameter(words), &req, |b, req| {
            b.iter(|| black_box(scorer.score(black_box(req))))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: routing decision
// ---------------------------------------------------------------------------

fn bench_decide(c: &mut Criterion) {
    let engine = RoutingDecisionEngine::new(SharedConfig::default());
    let req = InferenceRequest::new("bench", "hello").with_tier(ServiceTier::Premium);
    let inputs = RoutingInputs {
        complexity: 0.7,
        tier: ServiceTier::Premium,
        budget_remaining: 10.0,
        load: LoadSnapshot::new(0.5, 0.9, 0.1),
        health: HealthSnapshot::all_available(),
    };
    c.bench_function("routing_decide", |b| {
        b.iter(|| black_box(engine.decide(black_box(&req), black_box(&inputs))))
    });
}

// ---------------------------------------------------------------------------
// Bench: dispatch served from the cache
// ---------------------------------------------------------------------------

fn bench_cached_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let sim = Arc::new(SimulatedBackend::new("bench", Duration::ZERO));
    let registry = BackendRegistry::new()
        .with(Backend::LocalTierA, sim.clone())
        .with(Backend::LocalTierB, sim.clone())
        .with(Backend::CloudFallback, sim);
    let dispatcher = RequestDispatcher::new(
        SharedConfig::default(),
        registry,
        Arc::new(TracingAuditSink),
    );
    let req = InferenceRequest::new("bench", "What is the capital of France?");
    rt.block_on(dispatcher.dispatch(req.clone())).expect("warm cache");

    c.bench_function("dispatch_cache_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(dispatcher.dispatch(req.clone()).await.expect("dispatch"));
        })
    });
}

criterion_group!(benches, bench_scorer, bench_decide, bench_cached_dispatch);
criterion_main!(benches);
