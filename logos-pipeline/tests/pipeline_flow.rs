//! Pipeline flows through an assembled gateway
//!
//! - Dispatch and completion on a local deployment
//! - Terminal and recoverable failures (no candidates, timeout, resolution)
//! - Cloud requests parked on an exhausted budget and woken by headers
//! - Builder validation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use logos_core::{
    DeploymentId, DeploymentMetadata, LocalProviderConfig, Priority, ProviderKind, RequestId,
    RequestMetrics, SchedulingCandidate, SchedulingResult,
};
use logos_pipeline::{
    CompositeMonitor, ContextResolver, Classifier, Gateway, GatewayConfig, Monitor, NoopMonitor,
    PipelineError, PipelineRequest, RoutingContext, TracingMonitor,
};
use serde_json::{json, Value};

const LOCAL: DeploymentId = DeploymentId::new(10, 1);
const CLOUD: DeploymentId = DeploymentId::new(20, 2);

/// Routes on the payload's `target` field
struct TargetClassifier;

#[async_trait]
impl Classifier for TargetClassifier {
    async fn classify(&self, request: &PipelineRequest) -> anyhow::Result<Vec<SchedulingCandidate>> {
        let priority = match request.payload.get("priority").and_then(Value::as_i64) {
            Some(level) => Priority::from_level(level as i32),
            None => Priority::Normal,
        };
        let candidates = match request.payload.get("target").and_then(Value::as_str) {
            Some("local") => vec![SchedulingCandidate::new(LOCAL, 1.0, priority)],
            Some("cloud") => vec![SchedulingCandidate::new(CLOUD, 1.0, priority)],
            _ => Vec::new(),
        };
        Ok(candidates)
    }
}

/// Fails when the payload asks it to
struct StaticResolver;

#[async_trait]
impl ContextResolver for StaticResolver {
    async fn resolve(
        &self,
        request: &PipelineRequest,
        scheduling: &SchedulingResult,
    ) -> anyhow::Result<RoutingContext> {
        if request.payload.get("fail_resolution").and_then(Value::as_bool) == Some(true) {
            anyhow::bail!("no API key configured for {}", scheduling.deployment);
        }
        let (endpoint, model_name) = match scheduling.provider_kind {
            ProviderKind::Local => ("http://127.0.0.1:11434", "llama3.2:3b"),
            ProviderKind::Cloud => ("https://api.example.com/v1", "gpt-4o"),
        };
        Ok(RoutingContext {
            deployment: scheduling.deployment,
            endpoint: endpoint.to_string(),
            model_name: model_name.to_string(),
            auth: Some("secret".to_string()),
        })
    }
}

#[derive(Default)]
struct Events {
    enqueued: AtomicUsize,
    scheduled: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

#[async_trait]
impl Monitor for Events {
    async fn on_enqueued(&self, _request_id: &RequestId, _candidates: &[SchedulingCandidate]) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_scheduled(&self, _request_id: &RequestId, _scheduling: &SchedulingResult) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_completed(&self, _deployment: DeploymentId, _metrics: &RequestMetrics) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failed(&self, _request_id: &RequestId, _error: &PipelineError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn gateway(config: GatewayConfig, events: Arc<Events>) -> Gateway {
    let monitor = CompositeMonitor::new().with(events).with(Arc::new(TracingMonitor));

    Gateway::builder()
        .config(config)
        .local_provider(
            LocalProviderConfig::new(1, "ollama").with_total_vram_mb(24576).with_parallel_capacity(1),
            None,
        )
        .cloud_provider(2, "azure")
        .deployment(DeploymentMetadata::local(LOCAL, "llama3.2:3b"))
        .deployment(DeploymentMetadata::cloud(CLOUD, "gpt-4o", "gpt4o-eu"))
        .classifier(Arc::new(TargetClassifier))
        .resolver(Arc::new(StaticResolver))
        .monitor(Arc::new(monitor))
        .build()
        .await
        .unwrap()
}

fn request(id: &str, payload: Value) -> PipelineRequest {
    PipelineRequest::new(payload).with_request_id(id)
}

#[tokio::test]
async fn test_dispatch_and_complete() {
    let events = Arc::new(Events::default());
    let gateway = gateway(GatewayConfig::default(), events.clone()).await;

    let dispatch = gateway
        .pipeline()
        .process(request("req-1", json!({"target": "local", "priority": 9})))
        .await
        .unwrap();

    assert_eq!(dispatch.request_id, RequestId::from("req-1"));
    assert_eq!(dispatch.scheduling.deployment, LOCAL);
    assert_eq!(dispatch.scheduling.priority, Priority::High);
    assert!(!dispatch.scheduling.was_queued);
    assert_eq!(dispatch.routing.endpoint, "http://127.0.0.1:11434");
    assert_eq!(gateway.stats().await.num_in_flight, 1);

    let metrics = gateway.pipeline().complete(&dispatch.request_id, LOCAL).await.unwrap();
    assert_eq!(metrics.request_id, dispatch.request_id);
    assert_eq!(gateway.stats().await.num_in_flight, 0);

    assert_eq!(events.enqueued.load(Ordering::SeqCst), 1);
    assert_eq!(events.scheduled.load(Ordering::SeqCst), 1);
    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
    assert_eq!(events.failed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_candidates_is_terminal() {
    let events = Arc::new(Events::default());
    let gateway = gateway(GatewayConfig::default(), events.clone()).await;

    let err = gateway.pipeline().process(request("req-1", json!({}))).await.unwrap_err();

    assert!(matches!(err, PipelineError::NoCandidates { ref request_id } if request_id.as_str() == "req-1"));
    assert!(!err.is_recoverable());
    assert_eq!(events.enqueued.load(Ordering::SeqCst), 0);
    assert_eq!(events.failed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout() {
    let events = Arc::new(Events::default());
    let gateway = gateway(GatewayConfig::default(), events.clone()).await;
    let pipeline = gateway.pipeline();

    let holder = pipeline.process(request("holder", json!({"target": "local"}))).await.unwrap();

    let err = pipeline
        .process(request("late", json!({"target": "local"})).with_timeout(Duration::from_secs(2)))
        .await
        .unwrap_err();

    let PipelineError::Timeout { request_id, waited } = err else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(request_id.as_str(), "late");
    assert!(waited >= Duration::from_secs(2));
    assert_eq!(gateway.queue().get_total_depth(LOCAL).await, 0);

    // The holder is unaffected and can still complete
    pipeline.complete(&holder.request_id, LOCAL).await.unwrap();
    assert_eq!(events.failed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resolution_failure_keeps_capacity() {
    let gateway = gateway(GatewayConfig::default(), Arc::new(Events::default())).await;
    let pipeline = gateway.pipeline();

    let err = pipeline
        .process(request("req-1", json!({"target": "local", "fail_resolution": true})))
        .await
        .unwrap_err();

    let scheduling = err.held_capacity().cloned().expect("resolution failure carries the grant");
    assert!(matches!(err, PipelineError::Resolution { .. }));
    assert!(err.is_recoverable());
    assert_eq!(scheduling.deployment, LOCAL);
    assert_eq!(gateway.stats().await.num_in_flight, 1);

    pipeline.complete(&RequestId::from("req-1"), scheduling.deployment).await.unwrap();
    assert_eq!(gateway.stats().await.num_in_flight, 0);
}

#[tokio::test]
async fn test_cloud_budget_exhaustion_and_recovery() {
    let gateway = Arc::new(gateway(GatewayConfig::default(), Arc::new(Events::default())).await);

    let updated = gateway
        .pipeline()
        .report_rate_limits(CLOUD, [("x-ratelimit-remaining-requests", "5")])
        .await
        .unwrap();
    assert!(updated);

    let waiting = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway.pipeline().process(request("cloud-1", json!({"target": "cloud"}))).await
        })
    };

    for _ in 0..10_000 {
        if gateway.queue().get_total_depth(CLOUD).await == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(gateway.queue().get_total_depth(CLOUD).await, 1);

    gateway
        .pipeline()
        .report_rate_limits(CLOUD, [("X-RateLimit-Remaining-Requests", "500")])
        .await
        .unwrap();

    let dispatch = waiting.await.unwrap().unwrap();
    assert_eq!(dispatch.scheduling.deployment, CLOUD);
    assert!(dispatch.scheduling.was_queued);
    assert_eq!(dispatch.routing.model_name, "gpt-4o");
}

#[tokio::test]
async fn test_rate_limits_rejected_for_local() {
    let gateway = gateway(GatewayConfig::default(), Arc::new(Events::default())).await;

    let err = gateway
        .pipeline()
        .report_rate_limits(LOCAL, [("x-ratelimit-remaining-requests", "5")])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Scheduling(_)));
}

#[tokio::test]
async fn test_builder_selects_scheduler() {
    let config = GatewayConfig { scheduler_name: "first".to_string(), ..Default::default() };
    let gateway = gateway(config, Arc::new(Events::default())).await;

    assert_eq!(gateway.pipeline().scheduler().name(), "first_candidate");
    assert_eq!(gateway.registry().deployments().await.len(), 2);
}

#[tokio::test]
async fn test_builder_rejects_invalid_setup() {
    let unknown_scheduler = GatewayConfig { scheduler_name: "fastest".to_string(), ..Default::default() };
    let err = Gateway::builder()
        .config(unknown_scheduler)
        .classifier(Arc::new(TargetClassifier))
        .resolver(Arc::new(StaticResolver))
        .build()
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("fastest"));

    let err = Gateway::builder()
        .config(GatewayConfig::default())
        .resolver(Arc::new(StaticResolver))
        .build()
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("classifier"));

    // Deployment on a provider that was never added
    let err = Gateway::builder()
        .config(GatewayConfig::default())
        .deployment(DeploymentMetadata::local(LOCAL, "llama3.2:3b"))
        .classifier(Arc::new(TargetClassifier))
        .resolver(Arc::new(StaticResolver))
        .monitor(Arc::new(NoopMonitor))
        .build()
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("provider"));
}
