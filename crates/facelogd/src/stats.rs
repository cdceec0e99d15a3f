use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub ticks: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub suppressed: AtomicU64,
    pub source_errors: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub persist_busy: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    /// Set by a persistence failure, cleared by the next success.
    degraded: AtomicBool,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub suppressed: u64,
    pub source_errors: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub persist_busy: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub degraded: bool,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            ticks: get(&self.ticks),
            accepted: get(&self.accepted),
            rejected: get(&self.rejected),
            suppressed: get(&self.suppressed),
            source_errors: get(&self.source_errors),
            persisted: get(&self.persisted),
            persist_failures: get(&self.persist_failures),
            persist_busy: get(&self.persist_busy),
            notifications_sent: get(&self.notifications_sent),
            notifications_failed: get(&self.notifications_failed),
            degraded: self.is_degraded(),
        }
    }
}
