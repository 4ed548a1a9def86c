//! Queue Adapter: a thin, stateless facade over the durable substrate.

mod memory;

#[cfg(feature = "amqp-broker")]
mod amqp;

pub use memory::InMemoryQueueAdapter;

#[cfg(feature = "amqp-broker")]
pub use amqp::AmqpQueueAdapter;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::models::MessageEnvelope;

/// Operations the Dispatch Core needs from the durable substrate. All errors are
/// classified transient (caller should back off and retry) or permanent.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Read up to `max_count` messages, invisible to other consumers for
    /// `visibility_seconds`.
    async fn read(
        &self,
        queue: &str,
        max_count: usize,
        visibility_seconds: u64,
    ) -> Result<Vec<MessageEnvelope>, QueueError>;

    /// Archive a message. Idempotent: archiving an already-archived id is a no-op
    /// success.
    async fn archive(&self, queue: &str, msg_id: &str) -> Result<(), QueueError>;

    /// Publish a JSON body to `queue`, returning the substrate-assigned id.
    async fn publish(&self, queue: &str, body: serde_json::Value) -> Result<String, QueueError>;

    /// Move a message to `<queue>_dlq`, annotated with `reason`, and archive it from
    /// the source queue.
    async fn move_to_dlq(&self, queue: &str, msg_id: &str, reason: &str) -> Result<(), QueueError>;
}
