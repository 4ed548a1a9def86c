//! Worker Pool: bounded-concurrency executor with per-message timeout and
//! cooperative cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::handler::{Handler, HandlerContext};
use crate::models::MessageEnvelope;
use crate::router::RoutingPolicy;

/// Grace window after a deadline fires before an uncooperative handler is abandoned.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One unit of work submitted to the pool.
pub struct Task {
    pub envelope: MessageEnvelope,
    pub workflow_id: String,
    pub attempts: u32,
    pub handler: Arc<dyn Handler>,
    pub policy: RoutingPolicy,
}

/// What came of running a [`Task`].
pub struct TaskOutcome {
    pub envelope: MessageEnvelope,
    pub workflow_id: String,
    pub attempts: u32,
    pub policy: RoutingPolicy,
    pub result: Result<Value, HandlerError>,
    pub execution: Duration,
}

/// Bounded-concurrency executor. `submit` blocks the caller when the pool is at
/// capacity, supplying end-to-end backpressure back to the Dispatch Core's read loop.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Signal for shutdown: broadcast to in-flight handlers. Does not itself stop new
    /// submissions; callers must stop calling `submit` separately (the Dispatch Core
    /// does this by stopping its read loop first).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Acquire a capacity permit, blocking the caller until one is free. Separated
    /// from `submit_with_permit` so callers can observe "a slot is actually ours"
    /// before doing anything that assumes the task is really running (e.g.
    /// transitioning the Workflow Registry to `running`).
    pub async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed while the pool is alive")
    }

    /// Run `task` under an already-acquired `permit`, enforcing `task.policy.timeout`
    /// plus [`SHUTDOWN_GRACE`] cooperative cancellation. Returns a handle the caller
    /// can await for the outcome without blocking further submissions.
    pub fn submit_with_permit(&self, task: Task, permit: OwnedSemaphorePermit) -> tokio::task::JoinHandle<TaskOutcome> {
        let handler_cancel = self.shutdown.child_token();
        let pool_shutdown = self.shutdown.clone();
        let timeout = task.policy.timeout;

        tokio::spawn(async move {
            let _permit = permit; // held for the lifetime of this task
            let started = Instant::now();
            let ctx = HandlerContext {
                workflow_id: task.workflow_id.clone(),
                dry_run: false,
                deadline: started + timeout,
                cancel: handler_cancel.clone(),
            };
            let handler = task.handler.clone();
            let payload = task.envelope.body.clone();

            let inner = tokio::spawn(async move { handler.handle(payload, ctx).await });
            let result = run_with_deadline(inner, handler_cancel, pool_shutdown, timeout).await;

            TaskOutcome {
                envelope: task.envelope,
                workflow_id: task.workflow_id,
                attempts: task.attempts,
                policy: task.policy,
                result,
                execution: started.elapsed(),
            }
        })
    }

    /// Convenience wrapper for callers that don't need to observe the permit
    /// separately from submission (acquires, then runs, in one call).
    pub async fn submit(&self, task: Task) -> tokio::task::JoinHandle<TaskOutcome> {
        let permit = self.acquire_permit().await;
        self.submit_with_permit(task, permit)
    }
}

async fn run_with_deadline(
    mut inner: tokio::task::JoinHandle<Result<Value, HandlerError>>,
    cancel: CancellationToken,
    pool_shutdown: CancellationToken,
    timeout: Duration,
) -> Result<Value, HandlerError> {
    match tokio::time::timeout(timeout, &mut inner).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HandlerError::permanent(format!("handler panicked: {join_err}"))),
        Err(_elapsed) => {
            // Deadline fired: signal cooperative cancellation and allow a short
            // grace window before giving up on the handler entirely.
            cancel.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut inner).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(HandlerError::permanent(format!("handler panicked: {join_err}"))),
                Err(_) => {
                    inner.abort();
                    if pool_shutdown.is_cancelled() {
                        Err(HandlerError::shutdown(
                            "handler abandoned: process shutdown grace window elapsed",
                        ))
                    } else {
                        Err(HandlerError::transient(format!(
                            "handler timed out after {timeout:?} (+{SHUTDOWN_GRACE:?} grace)"
                        )))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::models::MessageEnvelope;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(timeout_ms: u64) -> RoutingPolicy {
        RoutingPolicy {
            max_attempts: 3,
            timeout: Duration::from_millis(timeout_ms),
            backoff: BackoffConfig::default(),
            result_queue: "job_results".into(),
        }
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            msg_id: "m1".into(),
            queue: "job_requests".into(),
            body: json!({"type": "code_execution_request", "id": "j1"}),
            read_count: Some(1),
        }
    }

    struct Instant50msHandler;
    #[async_trait]
    impl Handler for Instant50msHandler {
        async fn handle(&self, _payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({"ok": true}))
        }
    }

    struct NeverReturnsHandler;
    #[async_trait]
    impl Handler for NeverReturnsHandler {
        async fn handle(&self, _payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn completes_before_deadline_returns_ok() {
        let pool = WorkerPool::new(4);
        let task = Task {
            envelope: envelope(),
            workflow_id: "j1".into(),
            attempts: 1,
            handler: Arc::new(Instant50msHandler),
            policy: policy(500),
        };
        let outcome = pool.submit(task).await.await.unwrap();
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn exceeding_deadline_yields_transient_timeout() {
        let pool = WorkerPool::new(4);
        let task = Task {
            envelope: envelope(),
            workflow_id: "j1".into(),
            attempts: 1,
            handler: Arc::new(NeverReturnsHandler),
            policy: policy(20),
        };
        let outcome = pool.submit(task).await.await.unwrap();
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Transient);
    }

    #[tokio::test]
    async fn pool_at_capacity_blocks_submitter() {
        let pool = Arc::new(WorkerPool::new(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        struct TrackingHandler {
            in_flight: Arc<AtomicUsize>,
            max_seen: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Handler for TrackingHandler {
            async fn handle(&self, _payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        }

        let handler = Arc::new(TrackingHandler {
            in_flight: in_flight.clone(),
            max_seen: max_seen.clone(),
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let task = Task {
                envelope: envelope(),
                workflow_id: "j1".into(),
                attempts: 1,
                handler: handler.clone(),
                policy: policy(500),
            };
            handles.push(pool.submit(task).await);
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "capacity 1 must serialize work");
    }
}
