//! Wire and domain types for the Workflow Dispatch Core.

mod envelope;
mod workflow;

pub use envelope::{MessageEnvelope, ResultEnvelope};
pub use workflow::{Workflow, WorkflowStatus, WorkflowSummary, WorkflowType};
