use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HandlerError;

/// The closed set of workflow types this dispatcher routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    RuleUpdate,
    LlmConfigUpdate,
    JobRequest,
}

impl WorkflowType {
    /// Parse the `type` discriminator carried on a message body.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "rule_update" => Some(WorkflowType::RuleUpdate),
            "llm_config_update" => Some(WorkflowType::LlmConfigUpdate),
            "code_execution_request" => Some(WorkflowType::JobRequest),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            WorkflowType::RuleUpdate => "rule_update",
            WorkflowType::LlmConfigUpdate => "llm_config_update",
            WorkflowType::JobRequest => "code_execution_request",
        }
    }
}

/// A workflow's lifecycle state. `pending -> running -> {completed, failed}` only;
/// `running` is never itself persisted across a restart, it is always re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether `to` is a legal next state from `self`.
    pub fn can_transition_to(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// The unit of work, created on first observation of a queued message and owned by the
/// Workflow Registry for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub source_queue: String,
    pub payload: Value,
    /// blake3 digest of the canonicalized payload, recorded once at creation time.
    pub payload_digest: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<HandlerError>,
}

impl Workflow {
    pub fn new(id: String, workflow_type: WorkflowType, source_queue: String, payload: Value) -> Self {
        let now = Utc::now();
        let payload_digest = hex::encode(blake3::hash(payload.to_string().as_bytes()).as_bytes());
        Self {
            id,
            workflow_type,
            source_queue,
            payload,
            payload_digest,
            status: WorkflowStatus::Pending,
            created_at: now,
            updated_at: now,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Point-in-time observability view of a workflow, returned by `Registry::snapshot()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub attempts: u32,
    pub last_error: Option<HandlerError>,
    pub age_seconds: i64,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(w: &Workflow) -> Self {
        Self {
            id: w.id.clone(),
            workflow_type: w.workflow_type,
            status: w.status,
            attempts: w.attempts,
            last_error: w.last_error.clone(),
            age_seconds: (Utc::now() - w.created_at).num_seconds(),
        }
    }
}
