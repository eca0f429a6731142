//! Statistics tracking for the forwarder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::handler::Source;

/// Atomic per-interval counters.
pub struct Stats {
    started: Instant,
    pub requests: AtomicU64,
    pub hosts: AtomicU64,
    pub cached: AtomicU64,
    pub forwarded: AtomicU64,
    pub disabled: AtomicU64,
    pub failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            hosts: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            disabled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, source: &Source, response_time_ms: f64) {
        let counter = match source {
            Source::Disabled => &self.disabled,
            Source::Hosts => &self.hosts,
            Source::Cache => &self.cached,
            Source::Group(_) => &self.forwarded,
            Source::Failed => &self.failed,
        };
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let hosts = self.hosts.swap(0, Ordering::Relaxed);
        let cached = self.cached.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let disabled = self.disabled.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            requests,
            hosts,
            cached,
            forwarded,
            disabled,
            failed,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub hosts: u64,
    pub cached: u64,
    pub forwarded: u64,
    pub disabled: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}
