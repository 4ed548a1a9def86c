//! Minimal observability counters for the Dispatch Core's main loop.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub messages_read: AtomicU64,
    pub messages_archived: AtomicU64,
    pub messages_dlq: AtomicU64,
    pub results_published: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_read: self.messages_read.load(Ordering::Relaxed),
            messages_archived: self.messages_archived.load(Ordering::Relaxed),
            messages_dlq: self.messages_dlq.load(Ordering::Relaxed),
            results_published: self.results_published.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    pub fn inc_read(&self, n: u64) {
        self.messages_read.fetch_add(n, Ordering::Relaxed);
    }
    pub fn inc_archived(&self) {
        self.messages_archived.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_dlq(&self) {
        self.messages_dlq.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_published(&self) {
        self.results_published.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub messages_read: u64,
    pub messages_archived: u64,
    pub messages_dlq: u64,
    pub results_published: u64,
    pub decode_failures: u64,
}
