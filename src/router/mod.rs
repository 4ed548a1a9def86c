//! Handler Router: statically maps `(queue, message_type)` to a registered handler
//! plus routing policy. Built once at startup via [`HandlerRouter::register`]; read
//! only thereafter, so no locking is needed on the hot path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackoffConfig, QueueConfig};
use crate::error::{ErrorKind, RouterError};
use crate::handler::Handler;
use crate::models::MessageEnvelope;

/// Policy attached to one routing entry.
#[derive(Clone)]
pub struct RoutingPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: BackoffConfig,
    pub result_queue: String,
}

impl RoutingPolicy {
    /// Terminal error kinds always go to the DLQ without retry, per spec.
    pub fn is_terminal(&self, kind: ErrorKind) -> bool {
        kind.is_terminal()
    }
}

struct RoutingEntry {
    handler: Arc<dyn Handler>,
    policy: RoutingPolicy,
}

#[derive(Default)]
pub struct HandlerRouter {
    entries: HashMap<(String, String), RoutingEntry>,
}

impl HandlerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `(queue, message_type)`, built from a `QueueConfig`
    /// row's policy.
    pub fn register(
        &mut self,
        queue: impl Into<String>,
        message_type: impl Into<String>,
        handler: Arc<dyn Handler>,
        queue_config: &QueueConfig,
    ) {
        let policy = RoutingPolicy {
            max_attempts: queue_config.max_attempts,
            timeout: queue_config.timeout(),
            backoff: queue_config.backoff.clone(),
            result_queue: queue_config.result_queue_name.clone(),
        };
        self.entries
            .insert((queue.into(), message_type.into()), RoutingEntry { handler, policy });
    }

    /// Resolve a routing entry for a decoded envelope. Returns `RouterError` if the
    /// body has no `type` discriminator or no handler is registered for it.
    pub fn resolve(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<(Arc<dyn Handler>, RoutingPolicy), RouterError> {
        let message_type = envelope.body_type().ok_or(RouterError::MissingType)?;
        self.entries
            .get(&(envelope.queue.clone(), message_type.to_string()))
            .map(|entry| (entry.handler.clone(), entry.policy.clone()))
            .ok_or_else(|| RouterError::NotFound {
                queue: envelope.queue.clone(),
                message_type: message_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handler::builtin::JobExecutorStub;
    use serde_json::json;

    fn envelope(queue: &str, body: serde_json::Value) -> MessageEnvelope {
        MessageEnvelope {
            msg_id: "m1".into(),
            queue: queue.into(),
            body,
            read_count: Some(1),
        }
    }

    #[test]
    fn resolves_registered_handler() {
        let cfg = Config::default_queues();
        let mut router = HandlerRouter::new();
        router.register(
            "job_requests",
            "code_execution_request",
            Arc::new(JobExecutorStub),
            &cfg[2],
        );
        let env = envelope("job_requests", json!({"type": "code_execution_request", "id": "j1"}));
        let (_, policy) = router.resolve(&env).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.result_queue, "job_results");
    }

    #[test]
    fn unregistered_type_is_not_found() {
        let router = HandlerRouter::new();
        let env = envelope("rule_updates", json!({"type": "unknown_kind", "id": "x"}));
        let err = router.resolve(&env).unwrap_err();
        assert!(matches!(err, RouterError::NotFound { .. }));
    }

    #[test]
    fn missing_type_discriminator_is_rejected() {
        let router = HandlerRouter::new();
        let env = envelope("rule_updates", json!({"id": "x"}));
        assert!(matches!(router.resolve(&env), Err(RouterError::MissingType)));
    }
}
