use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, RegistryError};
use crate::models::{Workflow, WorkflowStatus, WorkflowSummary, WorkflowType};

pub enum Command {
    CreateOrGet {
        id: String,
        workflow_type: WorkflowType,
        queue: String,
        payload: Value,
        reply: oneshot::Sender<Workflow>,
    },
    Transition {
        id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
        error: Option<HandlerError>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    IncrementAttempts {
        id: String,
        reply: oneshot::Sender<u32>,
    },
    StatusOf {
        id: String,
        reply: oneshot::Sender<Option<WorkflowStatus>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<WorkflowSummary>>,
    },
}

/// One shard's share of the workflow map. Owned exclusively by the task running
/// `Shard::run`; there is never more than one writer.
pub struct Shard {
    records: HashMap<String, Workflow>,
    terminal_retention: Duration,
}

impl Shard {
    pub fn new(terminal_retention: Duration) -> Self {
        Self {
            records: HashMap::new(),
            terminal_retention,
        }
    }

    fn evict_expired_terminal_records(&mut self) {
        let retention = chrono::Duration::from_std(self.terminal_retention)
            .unwrap_or(chrono::Duration::seconds(3600));
        let now = Utc::now();
        self.records
            .retain(|_, w| !w.status.is_terminal() || now - w.updated_at < retention);
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.evict_expired_terminal_records(),
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd);
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::CreateOrGet {
                id,
                workflow_type,
                queue,
                payload,
                reply,
            } => {
                let record = self
                    .records
                    .entry(id.clone())
                    .or_insert_with(|| Workflow::new(id, workflow_type, queue, payload))
                    .clone();
                let _ = reply.send(record);
            }
            Command::Transition {
                id,
                from,
                to,
                error,
                reply,
            } => {
                let result = match self.records.get_mut(&id) {
                    Some(w) if w.status == from && from.can_transition_to(to) => {
                        w.status = to;
                        w.updated_at = Utc::now();
                        if let Some(err) = error {
                            w.last_error = Some(err);
                        }
                        Ok(())
                    }
                    Some(w) => Err(RegistryError::IllegalTransition {
                        id: id.clone(),
                        from: w.status,
                        to,
                    }),
                    None => Err(RegistryError::IllegalTransition { id, from, to }),
                };
                let _ = reply.send(result);
            }
            Command::IncrementAttempts { id, reply } => {
                let attempts = self
                    .records
                    .get_mut(&id)
                    .map(|w| {
                        w.attempts += 1;
                        w.attempts
                    })
                    .unwrap_or(0);
                let _ = reply.send(attempts);
            }
            Command::StatusOf { id, reply } => {
                let _ = reply.send(self.records.get(&id).map(|w| w.status));
            }
            Command::Snapshot { reply } => {
                let summaries = self.records.values().map(WorkflowSummary::from).collect();
                let _ = reply.send(summaries);
            }
        }
    }
}
