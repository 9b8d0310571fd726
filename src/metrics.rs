//! Observability metrics: search latency, mutation counts, lock contention.

use serde::Serialize;
use std::time::Duration;

/// Collects runtime metrics for one matcher.
#[derive(Debug)]
pub struct MetricsCollector {
    search_latencies_us: Vec<f64>,
    total_searches: u64,
    total_adds: u64,
    total_deletes: u64,
    total_rebuilds: u64,
    lock_timeouts: u64,
    skipped_records: u64,
}

/// Point-in-time copy of the collected metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub total_searches: u64,
    pub total_adds: u64,
    pub total_deletes: u64,
    pub total_rebuilds: u64,
    pub lock_timeouts: u64,
    pub skipped_records: u64,
    pub avg_search_latency_us: f64,
    pub p50_search_latency_us: f64,
    pub p95_search_latency_us: f64,
    pub p99_search_latency_us: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            search_latencies_us: Vec::new(),
            total_searches: 0,
            total_adds: 0,
            total_deletes: 0,
            total_rebuilds: 0,
            lock_timeouts: 0,
            skipped_records: 0,
        }
    }

    /// Record a search with its duration.
    pub fn record_search(&mut self, duration: Duration) {
        self.total_searches += 1;
        self.search_latencies_us.push(duration.as_micros() as f64);
    }

    pub fn record_add(&mut self) {
        self.total_adds += 1;
    }

    pub fn record_delete(&mut self) {
        self.total_deletes += 1;
    }

    /// Record an index built from the source, with the records it had to skip.
    pub fn record_rebuild(&mut self, skipped: usize) {
        self.total_rebuilds += 1;
        self.skipped_records += skipped as u64;
    }

    pub fn record_lock_timeout(&mut self) {
        self.lock_timeouts += 1;
    }

    pub fn total_searches(&self) -> u64 {
        self.total_searches
    }

    pub fn total_adds(&self) -> u64 {
        self.total_adds
    }

    pub fn total_deletes(&self) -> u64 {
        self.total_deletes
    }

    pub fn total_rebuilds(&self) -> u64 {
        self.total_rebuilds
    }

    pub fn lock_timeouts(&self) -> u64 {
        self.lock_timeouts
    }

    /// Average search latency in microseconds.
    pub fn avg_search_latency_us(&self) -> f64 {
        if self.search_latencies_us.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.search_latencies_us.iter().sum();
        sum / self.search_latencies_us.len() as f64
    }

    /// Get a percentile of search latency (e.g., 50.0, 95.0, 99.0).
    pub fn percentile_search_latency_us(&self, percentile: f64) -> f64 {
        if self.search_latencies_us.is_empty() {
            return 0.0;
        }

        let mut sorted = self.search_latencies_us.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            total_searches: self.total_searches,
            total_adds: self.total_adds,
            total_deletes: self.total_deletes,
            total_rebuilds: self.total_rebuilds,
            lock_timeouts: self.lock_timeouts,
            skipped_records: self.skipped_records,
            avg_search_latency_us: self.avg_search_latency_us(),
            p50_search_latency_us: self.percentile_search_latency_us(50.0),
            p95_search_latency_us: self.percentile_search_latency_us(95.0),
            p99_search_latency_us: self.percentile_search_latency_us(99.0),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
