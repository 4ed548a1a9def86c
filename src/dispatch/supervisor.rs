//! Supervises the independent long-running tasks that make up a running
//! dispatcher: the Dispatch Core loop itself, the Approval Service's GC sweep, and
//! the Workflow Registry's shard tasks (spawned internally by `Registry::spawn`).
//!
//! Each task restarts independently on an unexpected exit; a clean shutdown (the
//! cancellation token firing) is not a failure and is not restarted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalService;
use crate::config::Config;
use crate::dispatch::DispatchCore;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);

pub struct Supervisor {
    core: Arc<DispatchCore>,
    approval: Arc<ApprovalService>,
    config: Config,
}

impl Supervisor {
    pub fn new(core: Arc<DispatchCore>, approval: Arc<ApprovalService>, config: Config) -> Self {
        Self { core, approval, config }
    }

    /// Run until `cancel` fires, then wait for every supervised task to finish its
    /// own graceful shutdown. Returns `true` if the Dispatch Core abandoned any
    /// in-flight work rather than completing cleanly.
    pub async fn run(self, cancel: CancellationToken) -> bool {
        let gc_interval = Duration::from_secs(self.config.approval.gc_interval_seconds);
        let gc_cancel = cancel.clone();
        let approval = self.approval.clone();
        let gc_task = tokio::spawn(supervise("approval-gc", cancel.clone(), move || {
            let approval = approval.clone();
            let cancel = gc_cancel.clone();
            async move { approval.run_gc_loop(gc_interval, cancel).await }
        }));

        let core = self.core.clone();
        let core_cancel = cancel.clone();
        let core_task = tokio::spawn(supervise_dispatch_core(core, cancel.clone(), core_cancel));

        cancel.cancelled().await;
        let (_, core_result) = tokio::join!(gc_task, core_task);
        core_result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "dispatch core supervision task panicked");
            true
        })
    }
}

/// Run the Dispatch Core loop repeatedly until `cancel` fires, restarting it on an
/// unexpected early exit the same way `supervise` does for other tasks, but
/// threading its `bool` abandoned-work result back out instead of discarding it.
async fn supervise_dispatch_core(
    core: Arc<DispatchCore>,
    cancel: CancellationToken,
    run_cancel: CancellationToken,
) -> bool {
    loop {
        let abandoned = core.clone().run(run_cancel.clone()).await;
        if cancel.is_cancelled() {
            return abandoned;
        }
        tracing::warn!(task = "dispatch-core", "supervised task exited early, restarting");
        tokio::time::sleep(RESTART_BACKOFF).await;
    }
}

/// Run `make_fut()` repeatedly until `cancel` fires. A task that returns (rather
/// than being interrupted by cancellation) is assumed to have exited cleanly and is
/// not restarted; this helper exists for the cases where a future unexpectedly
/// finishes early due to a transient dependency failure rather than cancellation.
async fn supervise<F, Fut>(name: &str, cancel: CancellationToken, make_fut: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        make_fut().await;
        if cancel.is_cancelled() {
            break;
        }
        tracing::warn!(task = name, "supervised task exited early, restarting");
        tokio::time::sleep(RESTART_BACKOFF).await;
    }
}
