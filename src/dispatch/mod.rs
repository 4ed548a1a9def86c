//! Dispatch Core: the top-level consumer loop tying the Queue Adapter, Handler
//! Router, Worker Pool, and Workflow Registry together.

pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::ApprovalService;
use crate::config::Config;
use crate::error::{ErrorKind, RegistryError, RouterError};
use crate::metrics::Metrics;
use crate::models::{MessageEnvelope, ResultEnvelope, WorkflowStatus, WorkflowType};
use crate::pool::{Task, TaskOutcome, WorkerPool};
use crate::queue::QueueAdapter;
use crate::registry::Registry;
use crate::router::HandlerRouter;

/// Bound on how long the final drain is allowed to run after the read loop stops,
/// once in-flight handlers have been told to cancel.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the main loop needs, wired together at startup.
pub struct DispatchCore {
    pub queue: Arc<dyn QueueAdapter>,
    pub router: Arc<HandlerRouter>,
    pub pool: Arc<WorkerPool>,
    pub registry: Registry,
    pub approval: Arc<ApprovalService>,
    pub metrics: Arc<Metrics>,
    pub config: Config,
    /// Set once any in-flight task is abandoned at shutdown, either because its
    /// handler hit the pool's shutdown grace window or because the final drain
    /// itself timed out. Read back by the CLI to pick the process exit code.
    pub abandoned: AtomicBool,
}

impl DispatchCore {
    /// Run the consumer loop until `cancel` fires. Shutdown order: stop reading new
    /// batches first, cancel every in-flight handler, then give the drain loop a
    /// bounded window to finish before giving up. Returns `true` if any work was
    /// abandoned rather than completed cleanly.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> bool {
        let (tx, rx) = mpsc::unbounded_channel::<tokio::task::JoinHandle<TaskOutcome>>();
        let drainer = tokio::spawn(Arc::clone(&self).drain_loop(rx));
        self.read_loop(tx, cancel).await;
        self.pool.cancel_all();
        match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drainer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "drain loop task panicked"),
            Err(_) => {
                tracing::warn!("shutdown drain window elapsed with work still in flight, abandoning it");
                self.abandoned.store(true, Ordering::SeqCst);
            }
        }
        tracing::info!(snapshot_size = self.registry.snapshot().await.len(), "dispatch core stopped");
        self.abandoned.load(Ordering::SeqCst)
    }

    async fn read_loop(&self, tx: mpsc::UnboundedSender<tokio::task::JoinHandle<TaskOutcome>>, cancel: CancellationToken) {
        let mut consecutive_transient_errors: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut batch = Vec::new();
            let mut saw_transient_error = false;
            for queue_cfg in &self.config.queues {
                match self
                    .queue
                    .read(
                        &queue_cfg.logical_name,
                        self.config.pool.batch_size,
                        self.config.pool.visibility_seconds,
                    )
                    .await
                {
                    Ok(envelopes) => {
                        self.metrics.inc_read(envelopes.len() as u64);
                        batch.extend(envelopes);
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(queue = %queue_cfg.logical_name, error = %e, "transient read failure");
                        saw_transient_error = true;
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue_cfg.logical_name, error = %e, "permanent read failure");
                    }
                }
            }

            if saw_transient_error {
                consecutive_transient_errors += 1;
                let delay = bounded_backoff(consecutive_transient_errors);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            consecutive_transient_errors = 0;

            if batch.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.pool.poll_interval()) => {}
                }
                continue;
            }

            for envelope in batch {
                self.process_envelope(envelope, &tx).await;
            }
        }
    }

    async fn process_envelope(&self, envelope: MessageEnvelope, tx: &mpsc::UnboundedSender<tokio::task::JoinHandle<TaskOutcome>>) {
        let (handler, policy) = match self.router.resolve(&envelope) {
            Ok(resolved) => resolved,
            Err(RouterError::MissingType) => {
                self.metrics.inc_decode_failure();
                self.dlq(&envelope, "invalid_message").await;
                return;
            }
            Err(RouterError::NotFound { .. }) => {
                self.dlq(&envelope, "unknown_type").await;
                return;
            }
        };

        // Router only resolves entries registered against a known wire type, so this
        // is always Some; fall back defensively rather than panic on a substrate that
        // somehow violates that invariant.
        let Some(workflow_type) = envelope.body_type().and_then(WorkflowType::from_wire) else {
            self.dlq(&envelope, "unknown_type").await;
            return;
        };

        let workflow_id = envelope
            .body_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self
            .registry
            .create_or_get(workflow_id.clone(), workflow_type, envelope.queue.clone(), envelope.body.clone())
            .await
            .is_err()
        {
            tracing::error!(workflow_id, "registry unavailable, leaving message for redelivery");
            return;
        }

        // Acquire a pool permit *before* marking the workflow `running`, so the
        // registry's running count never counts a submission still waiting on
        // capacity: a batch larger than `pool.workers` would otherwise mark later
        // entries `running` while they're still blocked on `acquire_permit`.
        let permit = self.pool.acquire_permit().await;

        if self
            .registry
            .transition(&workflow_id, WorkflowStatus::Pending, WorkflowStatus::Running, None)
            .await
            .is_err()
        {
            // Already running or completed for this id: an at-least-once duplicate.
            // Leave it to the substrate's redelivery cycle; drop the permit we
            // reserved so it goes back to the pool unused.
            tracing::debug!(workflow_id, "duplicate delivery skipped");
            drop(permit);
            return;
        }

        let attempts = self
            .registry
            .increment_attempts(&workflow_id)
            .await
            .unwrap_or(1);

        let task = Task {
            envelope,
            workflow_id,
            attempts,
            handler,
            policy,
        };
        let handle = self.pool.submit_with_permit(task, permit);
        let _ = tx.send(handle);
    }

    async fn dlq(&self, envelope: &MessageEnvelope, reason: &str) {
        if let Err(e) = self.queue.move_to_dlq(&envelope.queue, &envelope.msg_id, reason).await {
            tracing::error!(queue = %envelope.queue, msg_id = %envelope.msg_id, error = %e, "failed to move message to dlq");
        }
        self.metrics.inc_dlq();
    }

    async fn drain_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<tokio::task::JoinHandle<TaskOutcome>>) {
        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                maybe_handle = rx.recv() => {
                    match maybe_handle {
                        Some(handle) => in_flight.push(handle),
                        None => break,
                    }
                }
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                    self.handle_outcome(joined).await;
                }
            }
        }
        // Reader stopped; drain whatever is still in flight before returning.
        while let Some(joined) = in_flight.next().await {
            self.handle_outcome(joined).await;
        }
    }

    async fn handle_outcome(&self, joined: Result<TaskOutcome, tokio::task::JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "worker task join failed");
                return;
            }
        };

        let TaskOutcome {
            envelope,
            workflow_id,
            attempts,
            policy,
            result,
            execution,
        } = outcome;

        match result {
            Ok(value) => self.handle_success(&envelope, &workflow_id, &policy.result_queue, attempts, execution, value).await,
            Err(err) if err.kind == ErrorKind::Shutdown => {
                // Abandoned at process shutdown: no publication, no archive, no DLQ.
                // The substrate will redeliver once the visibility timeout elapses.
                tracing::warn!(workflow_id, "handler abandoned at shutdown, message left for redelivery");
                self.abandoned.store(true, Ordering::SeqCst);
            }
            Err(err) if err.kind == ErrorKind::Transient && attempts < policy.max_attempts => {
                tracing::warn!(workflow_id, attempts, error = %err.detail, "transient failure, will retry");
                if let Err(e) = self
                    .registry
                    .transition(&workflow_id, WorkflowStatus::Running, WorkflowStatus::Pending, Some(err))
                    .await
                {
                    self.log_illegal_transition(&workflow_id, WorkflowStatus::Running, WorkflowStatus::Pending, &e);
                    self.dlq(&envelope, "illegal_registry_transition").await;
                }
                // Do NOT archive: the substrate redelivers after the visibility timeout.
            }
            Err(err) => {
                self.handle_terminal_failure(&envelope, &workflow_id, &policy.result_queue, attempts, execution, err)
                    .await;
            }
        }
    }

    fn log_illegal_transition(&self, workflow_id: &str, from: WorkflowStatus, to: WorkflowStatus, e: &RegistryError) {
        tracing::error!(
            workflow_id,
            ?from,
            ?to,
            error = %e,
            "illegal workflow transition rejected by registry, treating as a programming defect"
        );
    }

    async fn handle_success(
        &self,
        envelope: &MessageEnvelope,
        workflow_id: &str,
        result_queue: &str,
        attempts: u32,
        execution: Duration,
        result: Value,
    ) {
        let envelope_out = ResultEnvelope::Success {
            workflow_id: workflow_id.to_string(),
            source_queue: envelope.queue.clone(),
            result,
            attempts,
            execution_ms: execution.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        };
        self.publish_result(result_queue, &envelope_out).await;

        if let Err(e) = self.queue.archive(&envelope.queue, &envelope.msg_id).await {
            tracing::error!(error = %e, "failed to archive successfully processed message");
        } else {
            self.metrics.inc_archived();
        }

        if let Err(e) = self
            .registry
            .transition(workflow_id, WorkflowStatus::Running, WorkflowStatus::Completed, None)
            .await
        {
            self.log_illegal_transition(workflow_id, WorkflowStatus::Running, WorkflowStatus::Completed, &e);
            self.dlq(envelope, "illegal_registry_transition").await;
        }
    }

    async fn handle_terminal_failure(
        &self,
        envelope: &MessageEnvelope,
        workflow_id: &str,
        result_queue: &str,
        attempts: u32,
        execution: Duration,
        err: crate::error::HandlerError,
    ) {
        let envelope_out = ResultEnvelope::Failed {
            workflow_id: workflow_id.to_string(),
            source_queue: envelope.queue.clone(),
            error: err.clone(),
            attempts,
            execution_ms: execution.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        };
        self.publish_result(result_queue, &envelope_out).await;
        self.dlq(envelope, "max_attempts_exhausted").await;

        if let Err(e) = self
            .registry
            .transition(workflow_id, WorkflowStatus::Running, WorkflowStatus::Failed, Some(err))
            .await
        {
            self.log_illegal_transition(workflow_id, WorkflowStatus::Running, WorkflowStatus::Failed, &e);
            self.dlq(envelope, "illegal_registry_transition").await;
        }
    }

    async fn publish_result(&self, result_queue: &str, envelope: &ResultEnvelope) {
        let body = serde_json::to_value(envelope).expect("ResultEnvelope always serializes");
        match self.queue.publish(result_queue, body).await {
            Ok(_) => self.metrics.inc_published(),
            Err(e) => tracing::error!(error = %e, queue = result_queue, "failed to publish result envelope"),
        }
    }
}

fn bounded_backoff(consecutive_errors: u32) -> Duration {
    let base = Duration::from_secs(1);
    let cap = Duration::from_secs(30);
    base.saturating_mul(1u32 << consecutive_errors.min(5)).min(cap)
}
