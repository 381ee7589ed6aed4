//! Demo binary for edgellm-router
//!
//! Wires simulated backends behind the dispatcher, sends a mixed workload
//! from a standard and a premium tenant, and prints usage and health reports.
//!
//! ## Usage
//!
//! ```text
//! edgellm-router [CONFIG.toml]
//! ```
//!
//! With a config path the file is loaded at startup and hot-reloaded on change.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)
//! - `EDGELLM_CONFIG`: config path when none is given on the command line

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgellm_router::audit::{AuditRecorder, ChannelAuditSink, TracingAuditSink};
use edgellm_router::config::loader::load_from_file;
use edgellm_router::config::watcher::ConfigWatcher;
use edgellm_router::{
    init_tracing, metrics, Backend, BackendRegistry, EngineConfig, InferenceRequest,
    RequestDispatcher, ServiceTier, SharedConfig, SimulatedBackend, TenantId,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured tracing (JSON or pretty, based on LOG_FORMAT env)
    let _ = init_tracing();

    // Initialize Prometheus metrics registry before any request is dispatched.
    metrics::init_metrics()?;

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EDGELLM_CONFIG").ok())
        .map(PathBuf::from);

    let initial = match &config_path {
        Some(path) => load_from_file(path)?,
        None => EngineConfig::default(),
    };
    let config = SharedConfig::new(initial);

    // Keep the watcher alive for the whole run.
    let _watcher = match &config_path {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path.clone())?;
            config.follow(rx);
            info!(path = %path.display(), "config hot reload enabled");
            Some(watcher)
        }
        None => None,
    };

    // Audit events drain to the tracing sink off the request path.
    let (audit_sink, mut audit_rx) =
        ChannelAuditSink::new(config.current().dispatch.audit_channel_capacity);
    let audit_sink = Arc::new(audit_sink);
    let audit_task = tokio::spawn(async move {
        while let Some(event) = audit_rx.recv().await {
            TracingAuditSink.record(event);
        }
    });

    let tier_a = Arc::new(SimulatedBackend::new("phi4-mini", Duration::from_millis(15)));
    let tier_b = Arc::new(SimulatedBackend::new("mistral-7b", Duration::from_millis(40)));
    let cloud = Arc::new(SimulatedBackend::new(
        "llama-3.3-70b-versatile",
        Duration::from_millis(120),
    ));
    // A flaky fast tier shows failover and the breaker opening.
    tier_a.fail_next(6);

    let registry = BackendRegistry::new()
        .with(Backend::LocalTierA, tier_a.clone())
        .with(Backend::LocalTierB, tier_b)
        .with(Backend::CloudFallback, cloud);

    let dispatcher = Arc::new(RequestDispatcher::new(
        config.clone(),
        registry,
        audit_sink.clone(),
    ));

    let mut transitions = dispatcher.breakers().subscribe();
    tokio::spawn(async move {
        while let Ok(t) = transitions.recv().await {
            info!(backend = %t.backend, from = t.from.as_str(), to = t.to.as_str(), "breaker transition");
        }
    });

    let long_prompt = format!(
        "Analyze the following quarterly report and compare it with last year.\n1. Revenue\n2. Margins\n{}",
        "figure ".repeat(220)
    );
    let workload = vec![
        InferenceRequest::new("dept-legal", "What is the capital of France?"),
        InferenceRequest::new("dept-legal", "Summarise this clause in one sentence."),
        InferenceRequest::new("dept-legal", "What is the capital of France?"),
        InferenceRequest::new("dept-research", long_prompt.clone())
            .with_tier(ServiceTier::Premium)
            .with_max_tokens(2048),
        InferenceRequest::new("dept-research", long_prompt)
            .with_tier(ServiceTier::Premium)
            .with_max_tokens(2048),
        InferenceRequest::new("dept-research", "Write a haiku about programming")
            .with_tier(ServiceTier::Premium),
        InferenceRequest::new("dept-legal", "Explain why contracts need consideration, step by step")
            .with_max_tokens(2048),
        InferenceRequest::new("dept-research", "Describe the water cycle")
            .with_tier(ServiceTier::Premium)
            .with_model(Backend::CloudFallback),
    ];

    info!(count = workload.len(), "sending demo requests");

    let mut handles = Vec::with_capacity(workload.len());
    for request in workload {
        let d = Arc::clone(&dispatcher);
        handles.push(tokio::spawn(async move { d.dispatch(request).await }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(Ok(resp)) => info!(
                request_id = %resp.request_id,
                model = %resp.model_used,
                latency_ms = resp.latency_ms,
                cost = resp.cost,
                location = resp.data_location.as_str(),
                cache_hit = resp.cache_hit,
                "response"
            ),
            Ok(Err(e)) => warn!(error = %e, "request failed"),
            Err(e) => warn!(error = %e, "dispatch task panicked"),
        }
    }

    for tenant in ["dept-legal", "dept-research"] {
        let usage = dispatcher.usage(&TenantId::new(tenant));
        println!("{}", serde_json::to_string_pretty(&usage)?);
    }
    println!("{}", serde_json::to_string_pretty(&dispatcher.health())?);
    println!(
        "{}",
        serde_json::to_string_pretty(&dispatcher.models(ServiceTier::Premium))?
    );
    println!("{}", serde_json::to_string_pretty(&dispatcher.cache().stats())?);

    let summary = metrics::get_metrics_summary();
    info!(
        requests = ?summary.requests_total,
        cache = ?summary.cache_events,
        audit_dropped = audit_sink.dropped(),
        "demo complete"
    );

    // Closing the sink ends the audit drain task.
    drop(dispatcher);
    drop(audit_sink);
    let _ = tokio::time::timeout(Duration::from_secs(1), audit_task).await;

    Ok(())
}
