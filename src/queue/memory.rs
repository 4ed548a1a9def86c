use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::MessageEnvelope;

use super::QueueAdapter;

#[derive(Clone)]
struct StoredMessage {
    msg_id: String,
    body: serde_json::Value,
    read_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, (StoredMessage, Instant)>,
}

/// An in-process substrate used for local development and for every integration
/// test in this crate. Honors visibility timeouts, DLQ conventions, and idempotent
/// archival without requiring an external broker.
#[derive(Default)]
pub struct InMemoryQueueAdapter {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryQueueAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently ready (not in-flight) on `queue`. Used by tests
    /// and by the `status` CLI command.
    pub async fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }
}

fn requeue_expired(state: &mut QueueState) {
    let now = Instant::now();
    let expired: Vec<String> = state
        .in_flight
        .iter()
        .filter(|(_, (_, visible_at))| *visible_at <= now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in expired {
        if let Some((msg, _)) = state.in_flight.remove(&id) {
            state.ready.push_back(msg);
        }
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueueAdapter {
    async fn read(
        &self,
        queue: &str,
        max_count: usize,
        visibility_seconds: u64,
    ) -> Result<Vec<MessageEnvelope>, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        requeue_expired(state);

        let mut out = Vec::with_capacity(max_count.min(state.ready.len()));
        let visible_at = Instant::now() + std::time::Duration::from_secs(visibility_seconds);
        for _ in 0..max_count {
            let Some(mut msg) = state.ready.pop_front() else {
                break;
            };
            msg.read_count += 1;
            let envelope = MessageEnvelope {
                msg_id: msg.msg_id.clone(),
                queue: queue.to_string(),
                body: msg.body.clone(),
                read_count: Some(msg.read_count),
            };
            state.in_flight.insert(msg.msg_id.clone(), (msg, visible_at));
            out.push(envelope);
        }
        Ok(out)
    }

    async fn archive(&self, queue: &str, msg_id: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.in_flight.remove(msg_id);
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: serde_json::Value) -> Result<String, QueueError> {
        let msg_id = Uuid::new_v4().to_string();
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back(StoredMessage {
            msg_id: msg_id.clone(),
            body,
            read_count: 0,
        });
        Ok(msg_id)
    }

    async fn move_to_dlq(&self, queue: &str, msg_id: &str, reason: &str) -> Result<(), QueueError> {
        let original_body = {
            let mut queues = self.queues.lock().await;
            let state = queues.entry(queue.to_string()).or_default();
            state.in_flight.remove(msg_id).map(|(msg, _)| msg.body)
        };
        let annotated = json!({
            "reason": reason,
            "original_body": original_body,
            "original_msg_id": msg_id,
        });
        let dlq_name = format!("{queue}_dlq");
        self.publish(&dlq_name, annotated).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_read_round_trips() {
        let q = InMemoryQueueAdapter::new();
        q.publish("jobs", json!({"type": "job_request", "id": "j1"}))
            .await
            .unwrap();
        let msgs = q.read("jobs", 10, 30).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body_id(), Some("j1"));
        assert_eq!(msgs[0].read_count, Some(1));
    }

    #[tokio::test]
    async fn in_flight_message_is_invisible_until_visibility_expires() {
        let q = InMemoryQueueAdapter::new();
        q.publish("jobs", json!({"type": "job_request", "id": "j1"}))
            .await
            .unwrap();
        let first = q.read("jobs", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        // visibility_seconds = 0 means it is immediately eligible for redelivery.
        let second = q.read("jobs", 10, 30).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].read_count, Some(2));
    }

    #[tokio::test]
    async fn archive_is_idempotent() {
        let q = InMemoryQueueAdapter::new();
        q.publish("jobs", json!({"type": "job_request", "id": "j1"}))
            .await
            .unwrap();
        let msgs = q.read("jobs", 10, 30).await.unwrap();
        q.archive("jobs", &msgs[0].msg_id).await.unwrap();
        q.archive("jobs", &msgs[0].msg_id).await.unwrap();
    }

    #[tokio::test]
    async fn move_to_dlq_annotates_and_publishes() {
        let q = InMemoryQueueAdapter::new();
        q.publish("jobs", json!({"type": "unknown", "id": "x"}))
            .await
            .unwrap();
        let msgs = q.read("jobs", 10, 30).await.unwrap();
        q.move_to_dlq("jobs", &msgs[0].msg_id, "unknown_type")
            .await
            .unwrap();
        let dlq_msgs = q.read("jobs_dlq", 10, 30).await.unwrap();
        assert_eq!(dlq_msgs.len(), 1);
        assert_eq!(dlq_msgs[0].body["reason"], "unknown_type");
        assert_eq!(q.depth("jobs").await, 0);
    }
}
