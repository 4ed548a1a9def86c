//! Workflow Registry: authoritative in-process state for each workflow id observed.
//!
//! Per the design notes, writes are serialized without a global lock by hashing
//! `workflow_id` to a shard; each shard is owned by a single `tokio::task` reading a
//! bounded command channel, giving exactly one writer per id without per-id locks.

mod shard;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, RegistryError};
use crate::models::{Workflow, WorkflowStatus, WorkflowSummary, WorkflowType};

use shard::{Command, Shard};

const SHARD_COUNT: usize = 16;
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Handle to the sharded registry. Cheap to clone; every clone shares the same
/// underlying shard tasks.
#[derive(Clone)]
pub struct Registry {
    shards: Arc<Vec<mpsc::Sender<Command>>>,
}

impl Registry {
    /// Spawn `SHARD_COUNT` shard tasks, each retaining terminal records for
    /// `terminal_retention`. Returns the handle; tasks run until `cancel` fires.
    pub fn spawn(terminal_retention: std::time::Duration, cancel: CancellationToken) -> Self {
        let mut senders = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
            let shard = Shard::new(terminal_retention);
            let cancel = cancel.clone();
            tokio::spawn(shard.run(rx, cancel));
            senders.push(tx);
        }
        Self {
            shards: Arc::new(senders),
        }
    }

    fn shard_for(&self, id: &str) -> &mpsc::Sender<Command> {
        let hash = blake3::hash(id.as_bytes());
        let idx = (hash.as_bytes()[0] as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Idempotent: returns the existing record if `id` is already present.
    pub async fn create_or_get(
        &self,
        id: String,
        workflow_type: WorkflowType,
        queue: String,
        payload: Value,
    ) -> Result<Workflow, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shard_for(&id)
            .send(Command::CreateOrGet {
                id,
                workflow_type,
                queue,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::ShardUnavailable)?;
        reply_rx.await.map_err(|_| RegistryError::ShardUnavailable)
    }

    /// Enforce an allowed `from -> to` transition for `id`.
    pub async fn transition(
        &self,
        id: &str,
        from: WorkflowStatus,
        to: WorkflowStatus,
        error: Option<HandlerError>,
    ) -> Result<(), RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shard_for(id)
            .send(Command::Transition {
                id: id.to_string(),
                from,
                to,
                error,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::ShardUnavailable)?;
        reply_rx
            .await
            .map_err(|_| RegistryError::ShardUnavailable)?
    }

    /// Increment `attempts` for `id` and return the new value.
    pub async fn increment_attempts(&self, id: &str) -> Result<u32, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shard_for(id)
            .send(Command::IncrementAttempts {
                id: id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::ShardUnavailable)?;
        reply_rx.await.map_err(|_| RegistryError::ShardUnavailable)
    }

    /// Current status for `id`, if known to this process.
    pub async fn status_of(&self, id: &str) -> Result<Option<WorkflowStatus>, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shard_for(id)
            .send(Command::StatusOf {
                id: id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::ShardUnavailable)?;
        reply_rx.await.map_err(|_| RegistryError::ShardUnavailable)
    }

    /// Fan out a snapshot request to every shard and merge the results, for
    /// observability.
    pub async fn snapshot(&self) -> Vec<WorkflowSummary> {
        let mut all = Vec::new();
        for shard in self.shards.iter() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if shard.send(Command::Snapshot { reply: reply_tx }).await.is_err() {
                continue;
            }
            if let Ok(summaries) = reply_rx.await {
                all.extend(summaries);
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_registry() -> Registry {
        Registry::spawn(std::time::Duration::from_secs(3600), CancellationToken::new())
    }

    #[tokio::test]
    async fn create_or_get_is_idempotent() {
        let reg = test_registry();
        let a = reg
            .create_or_get("w1".into(), WorkflowType::JobRequest, "job_requests".into(), json!({}))
            .await
            .unwrap();
        let b = reg
            .create_or_get("w1".into(), WorkflowType::JobRequest, "job_requests".into(), json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(a.payload, b.payload, "second create_or_get must return the original record");
    }

    #[tokio::test]
    async fn legal_transition_sequence_succeeds() {
        let reg = test_registry();
        reg.create_or_get("w1".into(), WorkflowType::JobRequest, "job_requests".into(), json!({}))
            .await
            .unwrap();
        reg.transition("w1", WorkflowStatus::Pending, WorkflowStatus::Running, None)
            .await
            .unwrap();
        reg.transition("w1", WorkflowStatus::Running, WorkflowStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(reg.status_of("w1").await.unwrap(), Some(WorkflowStatus::Completed));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let reg = test_registry();
        reg.create_or_get("w1".into(), WorkflowType::JobRequest, "job_requests".into(), json!({}))
            .await
            .unwrap();
        let err = reg
            .transition("w1", WorkflowStatus::Pending, WorkflowStatus::Completed, None)
            .await;
        assert!(matches!(err, Err(RegistryError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn snapshot_reflects_all_shards() {
        let reg = test_registry();
        for i in 0..20 {
            reg.create_or_get(format!("w{i}"), WorkflowType::JobRequest, "job_requests".into(), json!({}))
                .await
                .unwrap();
        }
        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 20);
    }
}
