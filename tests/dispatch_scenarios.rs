//! End-to-end scenarios covering the dispatch loop against the in-memory queue
//! substrate, exercising the full read -> route -> execute -> publish/archive/DLQ
//! path without any external dependency.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use dispatch_core::approval::ApprovalService;
use dispatch_core::config::Config;
use dispatch_core::dispatch::DispatchCore;
use dispatch_core::error::HandlerError;
use dispatch_core::handler::{Handler, HandlerContext};
use dispatch_core::metrics::Metrics;
use dispatch_core::pool::WorkerPool;
use dispatch_core::queue::InMemoryQueueAdapter;
use dispatch_core::registry::Registry;
use dispatch_core::router::HandlerRouter;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, payload: Value, ctx: HandlerContext) -> Result<Value, HandlerError> {
        (self.0)(payload, ctx).await
    }
}

/// A running dispatch core plus the substrate handle needed to drive a scenario
/// and inspect its effects. `shutdown` must be cancelled before the test ends so
/// the background task doesn't outlive it.
struct Harness {
    queue: Arc<InMemoryQueueAdapter>,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<bool>,
    metrics: Arc<Metrics>,
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.pool.poll_interval_ms = 10;
    config.pool.visibility_seconds = 5;
    config
}

fn build(config: Config, router: HandlerRouter, workers: usize) -> Harness {
    let queue = Arc::new(InMemoryQueueAdapter::new());
    let metrics = Arc::new(Metrics::default());
    let shutdown = CancellationToken::new();
    let registry = Registry::spawn(
        Duration::from_secs(config.registry.terminal_retention_seconds),
        shutdown.clone(),
    );
    let pool = Arc::new(WorkerPool::new(workers));
    let approval = Arc::new(ApprovalService::new(Duration::from_secs(config.approval.default_ttl_seconds)));

    let core = Arc::new(DispatchCore {
        queue: queue.clone(),
        router: Arc::new(router),
        pool,
        registry,
        approval,
        metrics: metrics.clone(),
        config,
        abandoned: AtomicBool::new(false),
    });

    let handle = tokio::spawn(core.run(shutdown.clone()));
    Harness { queue, shutdown, handle, metrics }
}

/// Poll `queue`'s ready depth (non-destructively) until it reaches `want_len` or
/// `timeout` elapses.
async fn wait_for_depth(queue: &InMemoryQueueAdapter, name: &str, want_len: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if queue.depth(name).await >= want_len {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.depth(name).await >= want_len
}

// S1: a well-formed job request is read, executed, published to job_results, and
// archived from job_requests.
#[tokio::test]
async fn s1_happy_path_job_is_executed_and_published() {
    let config = test_config();
    let mut router = HandlerRouter::new();
    router.register(
        "job_requests",
        "code_execution_request",
        Arc::new(FnHandler(|_payload, _ctx| async { Ok(json!({"quality_score": 1.0})) })),
        &config.queues[2],
    );
    let harness = build(config, router, 4);

    harness
        .queue
        .publish("job_requests", json!({"type": "code_execution_request", "id": "job-1", "code": "print(1)"}))
        .await
        .unwrap();

    assert!(
        wait_for_depth(&harness.queue, "job_results", 1, Duration::from_secs(2)).await,
        "expected a result envelope to be published"
    );
    let results = harness.queue.read("job_results", 10, 30).await.unwrap();
    assert_eq!(results[0].body["status"], "success");
    assert_eq!(harness.queue.depth("job_requests").await, 0, "source message should be archived");

    harness.stop().await;
}

// S2: a handler that fails transiently once and then succeeds retries and
// eventually produces a success result, without exceeding max_attempts.
#[tokio::test]
async fn s2_transient_failure_then_success_retries() {
    // Near-zero visibility so the substrate redelivers the in-flight message
    // promptly after the first (transient) failure leaves it unacknowledged.
    let mut config = test_config();
    config.pool.visibility_seconds = 0;

    let attempt = Arc::new(AtomicUsize::new(0));
    let attempt_clone = attempt.clone();
    let mut router = HandlerRouter::new();
    router.register(
        "job_requests",
        "code_execution_request",
        Arc::new(FnHandler(move |_payload, _ctx| {
            let attempt = attempt_clone.clone();
            async move {
                let n = attempt.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(HandlerError::transient("simulated flake"))
                } else {
                    Ok(json!({"quality_score": 1.0}))
                }
            }
        })),
        &config.queues[2],
    );
    let harness = build(config, router, 4);
    harness
        .queue
        .publish("job_requests", json!({"type": "code_execution_request", "id": "job-2", "code": "x"}))
        .await
        .unwrap();

    assert!(
        wait_for_depth(&harness.queue, "job_results", 1, Duration::from_secs(3)).await,
        "expected eventual success after one retry"
    );
    let results = harness.queue.read("job_results", 10, 30).await.unwrap();
    assert_eq!(results[0].body["status"], "success");
    assert!(attempt.load(Ordering::SeqCst) >= 2, "handler should have run at least twice");

    harness.stop().await;
}

// S3: a handler that always fails transiently exhausts max_attempts and lands in
// the DLQ with a failed result envelope, never a success.
#[tokio::test]
async fn s3_exhausted_retries_land_in_dlq() {
    let mut config = test_config();
    config.pool.visibility_seconds = 0;
    config.queues[2].max_attempts = 2;

    let mut router = HandlerRouter::new();
    router.register(
        "job_requests",
        "code_execution_request",
        Arc::new(FnHandler(|_payload, _ctx| async { Err(HandlerError::transient("always fails")) })),
        &config.queues[2],
    );
    let harness = build(config, router, 4);

    harness
        .queue
        .publish("job_requests", json!({"type": "code_execution_request", "id": "job-3", "code": "x"}))
        .await
        .unwrap();

    assert!(
        wait_for_depth(&harness.queue, "job_requests_dlq", 1, Duration::from_secs(3)).await,
        "expected the message to land in the DLQ after exhausting retries"
    );

    let results = harness.queue.read("job_results", 10, 30).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].body["status"], "failed");

    harness.stop().await;
}

// S4: a message with no `type` discriminator is rejected immediately, without
// ever reaching a handler, and counted as a decode failure.
#[tokio::test]
async fn s4_invalid_message_is_dlqd_without_executing_a_handler() {
    let config = test_config();
    let router = HandlerRouter::new();
    let harness = build(config, router, 4);

    harness.queue.publish("job_requests", json!({"id": "job-4"})).await.unwrap();

    assert!(
        wait_for_depth(&harness.queue, "job_requests_dlq", 1, Duration::from_secs(2)).await,
        "expected the invalid message to be DLQ'd"
    );

    let dlq_msgs = harness.queue.read("job_requests_dlq", 10, 30).await.unwrap();
    assert_eq!(dlq_msgs[0].body["reason"], "invalid_message");
    assert_eq!(harness.metrics.snapshot().decode_failures, 1);

    harness.stop().await;
}

// S5: a handler that requires a validated approval token before applying an
// effect rejects the workflow when no token (or an invalid one) is supplied, and
// succeeds once a matching token has been issued.
#[tokio::test]
async fn s5_approval_gate_blocks_until_token_is_valid() {
    let approval = Arc::new(ApprovalService::new(Duration::from_secs(60)));
    let approval_for_handler = approval.clone();

    let config = test_config();
    let mut router = HandlerRouter::new();
    router.register(
        "rule_updates",
        "rule_update",
        Arc::new(FnHandler(move |payload, ctx| {
            let approval = approval_for_handler.clone();
            async move {
                let token = payload
                    .get("approval_token")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::invalid_input("missing approval_token"))?;
                approval
                    .validate_and_consume(token, &ctx.workflow_id)
                    .await
                    .map_err(|e| HandlerError::permanent(format!("approval rejected: {e}")))?;
                Ok(json!({"applied": true}))
            }
        })),
        &config.queues[0],
    );
    let harness = build(config, router, 4);

    // No token at all: rejected as invalid_input, goes straight to the DLQ.
    harness
        .queue
        .publish("rule_updates", json!({"type": "rule_update", "id": "rule-unapproved"}))
        .await
        .unwrap();
    assert!(
        wait_for_depth(&harness.queue, "rule_updates_dlq", 1, Duration::from_secs(2)).await,
        "unapproved workflow must be rejected"
    );

    // Issue a token for the next workflow id and supply it: handler should succeed.
    let token = approval.issue("rule-approved", None).await;
    harness
        .queue
        .publish(
            "rule_updates",
            json!({"type": "rule_update", "id": "rule-approved", "approval_token": token}),
        )
        .await
        .unwrap();
    assert!(
        wait_for_depth(&harness.queue, "rule_updates_results", 1, Duration::from_secs(2)).await,
        "approved workflow must succeed"
    );
    let results = harness.queue.read("rule_updates_results", 10, 30).await.unwrap();
    assert_eq!(results[0].body["status"], "success");

    harness.stop().await;
}

// S6: eight job requests submitted at once against a pool of capacity 4 never
// run more than 4 concurrently.
#[tokio::test]
async fn s6_parallel_batch_respects_pool_capacity() {
    let mut config = test_config();
    config.pool.batch_size = 16;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let in_flight_clone = in_flight.clone();
    let max_seen_clone = max_seen.clone();

    let mut router = HandlerRouter::new();
    router.register(
        "job_requests",
        "code_execution_request",
        Arc::new(FnHandler(move |_payload, _ctx| {
            let in_flight = in_flight_clone.clone();
            let max_seen = max_seen_clone.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({"quality_score": 1.0}))
            }
        })),
        &config.queues[2],
    );
    let harness = build(config, router, 4);

    for i in 0..8 {
        harness
            .queue
            .publish(
                "job_requests",
                json!({"type": "code_execution_request", "id": format!("job-6-{i}"), "code": "x"}),
            )
            .await
            .unwrap();
    }

    assert!(
        wait_for_depth(&harness.queue, "job_results", 8, Duration::from_secs(5)).await,
        "all eight jobs should eventually complete"
    );
    assert!(max_seen.load(Ordering::SeqCst) <= 4, "pool must never exceed its configured capacity");
    assert_eq!(max_seen.load(Ordering::SeqCst), 4, "capacity 4 should be fully utilized under an 8-job burst");

    harness.stop().await;
}
