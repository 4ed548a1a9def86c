//! Workflow Dispatch Core: a durable, multi-queue message dispatcher providing
//! bounded-concurrency execution, retry-with-backoff, dead-lettering, and
//! approval-gated side effects for a self-evolution platform's background
//! workflows.

pub mod approval;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod router;
