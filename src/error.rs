//! Crate-wide error kind shared by every subsystem, plus per-subsystem error enums.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The taxonomy a handler or queue operation result falls into.
///
/// `transient` may succeed on retry, `permanent` will not, `invalid_input` means the
/// message could never be routed, and `shutdown` means the process stopped before the
/// handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    InvalidInput,
    Shutdown,
}

impl ErrorKind {
    /// Terminal kinds always go to the DLQ without retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::Permanent | ErrorKind::InvalidInput)
    }
}

/// A structured error carried on `workflow.last_error` and in result envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl HandlerError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            detail: detail.into(),
        }
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            detail: detail.into(),
        }
    }

    pub fn shutdown(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Shutdown,
            detail: detail.into(),
        }
    }
}

/// Errors from the Queue Adapter. All substrate failures are classified transient or
/// permanent per spec; decode/config errors at this layer are permanent.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("substrate unavailable: {0}")]
    Transient(String),
    #[error("substrate rejected operation: {0}")]
    Permanent(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}

/// Errors from the Approval Service. All of these are permanent to the caller; a
/// caller should request a fresh token rather than retry with the same one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("unknown token")]
    Unknown,
    #[error("token expired")]
    Expired,
    #[error("token already consumed")]
    AlreadyConsumed,
    #[error("token subject mismatch")]
    SubjectMismatch,
}

/// Errors from the Workflow Registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("illegal transition for workflow {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: String,
        from: crate::models::WorkflowStatus,
        to: crate::models::WorkflowStatus,
    },
    #[error("registry shard channel closed")]
    ShardUnavailable,
}

/// Errors from routing a message to a handler.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("no handler registered for queue {queue:?} / type {message_type:?}")]
    NotFound { queue: String, message_type: String },
    #[error("message body missing or invalid `type` discriminator")]
    MissingType,
}

/// Errors surfaced by the Worker Pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("handler timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("pool is shutting down, no new submissions accepted")]
    ShuttingDown,
}

/// Top-level dispatch loop error, used only for unrecoverable startup failures; runtime
/// per-message failures never propagate this far up.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
