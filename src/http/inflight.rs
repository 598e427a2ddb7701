//! In-flight request tracking for graceful drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts requests currently being proxied.
#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    active: Arc<AtomicU64>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new request. The returned guard decrements on drop.
    pub fn track(&self) -> RequestGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }
}

/// Held for the lifetime of one proxied request.
#[derive(Debug)]
pub struct RequestGuard {
    active: Arc<AtomicU64>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Request counters reported on `/health`.
#[derive(Debug, Default)]
pub struct ProxyStats {
    total: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ProxyStatsSnapshot {
    pub total: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl ProxyStats {
    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
