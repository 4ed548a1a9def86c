//! Placeholder handlers for the three routing entries in the queue configuration
//! table. Real rule-application, model-config update, and code-execution sandboxing
//! logic are out of scope for this crate (spec.md §1) and are expected to be
//! registered in their place by the owning subsystem; these exist so the `run`
//! command and the dispatcher's default wiring have something to route to.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::HandlerError;

use super::{Handler, HandlerContext};

/// Acknowledges a rule-update payload without applying it. Idempotent: the result is
/// a pure function of the payload.
pub struct RuleEngineStub;

#[async_trait]
impl Handler for RuleEngineStub {
    async fn handle(&self, payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        let rule_id = payload
            .get("rule_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::invalid_input("missing `rule_id`"))?;
        Ok(json!({ "applied_rule_id": rule_id, "stub": true }))
    }
}

/// Acknowledges an LLM config update payload without applying it.
pub struct LlmConfigManagerStub;

#[async_trait]
impl Handler for LlmConfigManagerStub {
    async fn handle(&self, payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::invalid_input("missing `model`"))?;
        Ok(json!({ "updated_model": model, "stub": true }))
    }
}

/// Acknowledges a code-execution request payload without sandboxed execution.
pub struct JobExecutorStub;

#[async_trait]
impl Handler for JobExecutorStub {
    async fn handle(&self, payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        if payload.get("code").and_then(Value::as_str).is_none() {
            return Err(HandlerError::invalid_input("missing `code`"));
        }
        Ok(json!({ "quality_score": 1.0, "issues": 0, "stub": true }))
    }
}
