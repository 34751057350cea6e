// rust/mlsync-core/src/stats.rs

//! Per-node counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct NodeStats {
    requests: AtomicU64,
    loads_started: AtomicU64,
    loads_completed: AtomicU64,
    loads_failed: AtomicU64,
    unloads: AtomicU64,
    sync_cycles: AtomicU64,
    skipped_ticks: AtomicU64,
    transport_failures: AtomicU64,
}

/// Plain copy of [`NodeStats`] for logging and reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub loads_started: u64,
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub unloads: u64,
    pub sync_cycles: u64,
    pub skipped_ticks: u64,
    pub transport_failures: u64,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_started(&self) {
        self.loads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_finished(&self, success: bool) {
        if success {
            self.loads_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.loads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unloads(&self, count: usize) {
        self.unloads.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_sync_cycle(&self) {
        self.sync_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_tick(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_failures(&self, count: usize) {
        self.transport_failures
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            loads_started: self.loads_started.load(Ordering::Relaxed),
            loads_completed: self.loads_completed.load(Ordering::Relaxed),
            loads_failed: self.loads_failed.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            sync_cycles: self.sync_cycles.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = NodeStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_load_started();
        stats.record_load_finished(true);
        stats.record_load_finished(false);
        stats.record_unloads(3);
        stats.record_transport_failures(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.loads_started, 1);
        assert_eq!(snapshot.loads_completed, 1);
        assert_eq!(snapshot.loads_failed, 1);
        assert_eq!(snapshot.unloads, 3);
        assert_eq!(snapshot.transport_failures, 2);
        assert_eq!(snapshot.sync_cycles, 0);
    }
}
