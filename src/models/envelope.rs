use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HandlerError;

/// What the queue substrate returns per `read`. `body` must decode to a JSON object
/// carrying a `type` discriminator and should carry an `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub msg_id: String,
    pub queue: String,
    pub body: Value,
    pub read_count: Option<u32>,
}

impl MessageEnvelope {
    pub fn body_type(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    pub fn body_id(&self) -> Option<&str> {
        self.body.get("id").and_then(Value::as_str)
    }
}

/// Terminal success/failure outcome published to a routing entry's result queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultEnvelope {
    Success {
        workflow_id: String,
        source_queue: String,
        result: Value,
        attempts: u32,
        execution_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        workflow_id: String,
        source_queue: String,
        error: HandlerError,
        attempts: u32,
        execution_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ResultEnvelope {
    pub fn workflow_id(&self) -> &str {
        match self {
            ResultEnvelope::Success { workflow_id, .. } => workflow_id,
            ResultEnvelope::Failed { workflow_id, .. } => workflow_id,
        }
    }
}
