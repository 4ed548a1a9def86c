//! Handler Contract: the interface a routed handler must honor.
//!
//! Concrete handler business logic (rule-application, model-config update,
//! code-execution sandboxing) is out of scope for this crate and is represented only
//! as an opaque implementation of [`Handler`].

pub mod builtin;

use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;

/// Per-invocation context passed to a handler alongside its payload.
pub struct HandlerContext {
    pub workflow_id: String,
    pub dry_run: bool,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

/// A registered handler for one `(queue, message_type)` routing entry. Handlers MUST
/// be idempotent with respect to `workflow_id`: because delivery is at-least-once and
/// timeouts can trigger redelivery, the same `workflow_id` may invoke the handler more
/// than once and must produce the same observable result each time.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: HandlerContext) -> Result<Value, HandlerError>;
}

/// Adapts a plain async closure into a [`Handler`], for registering simple handlers
/// without a dedicated type.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, payload: Value, ctx: HandlerContext) -> Result<Value, HandlerError> {
        (self.0)(payload, ctx).await
    }
}
