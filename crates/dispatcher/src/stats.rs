use std::{
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    time::Duration,
};

use crate::metrics;

/// Process-wide dispatch counters. They never gate behavior; every increment
/// is mirrored into the Prometheus registry.
#[derive(Debug, Default)]
pub struct DispatchStats {
    result_cache_hits: AtomicU64,
    placement_cache_hits: AtomicU64,
    batch_probe_hits: AtomicU64,
    placement_misses: AtomicU64,
    load_rejected: AtomicU64,
    accumulated_latency_us: AtomicU64,
}

/// A point-in-time copy of [`DispatchStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub result_cache_hits: u64,
    pub placement_cache_hits: u64,
    pub batch_probe_hits: u64,
    pub placement_misses: u64,
    pub load_rejected: u64,
    pub accumulated_latency_us: u64,
}

impl DispatchStats {
    pub fn record_result_cache_hit(&self) {
        self.result_cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::log_result_cache_hit();
    }

    pub fn record_placement_cache_hit(&self) {
        self.placement_cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::log_placement_cache_hit();
    }

    pub fn record_batch_probe_hit(&self) {
        self.batch_probe_hits.fetch_add(1, Ordering::Relaxed);
        metrics::log_batch_probe_hit();
    }

    pub fn record_placement_miss(&self) {
        self.placement_misses.fetch_add(1, Ordering::Relaxed);
        metrics::log_placement_miss();
    }

    pub fn record_load_rejected(&self) {
        self.load_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::log_load_rejected();
    }

    /// Adds `latency` to the running total and returns the new total.
    pub fn accumulate_latency(&self, latency: Duration) -> Duration {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let total = self
            .accumulated_latency_us
            .fetch_add(micros, Ordering::Relaxed)
            .saturating_add(micros);
        Duration::from_micros(total)
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            result_cache_hits: self.result_cache_hits.load(Ordering::Relaxed),
            placement_cache_hits: self.placement_cache_hits.load(Ordering::Relaxed),
            batch_probe_hits: self.batch_probe_hits.load(Ordering::Relaxed),
            placement_misses: self.placement_misses.load(Ordering::Relaxed),
            load_rejected: self.load_rejected.load(Ordering::Relaxed),
            accumulated_latency_us: self.accumulated_latency_us.load(Ordering::Relaxed),
        }
    }
}
