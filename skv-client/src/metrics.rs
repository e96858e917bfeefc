//! # Pool Metrics
//!
//! Lock-free counters describing acquisition load over the current health
//! window, plus the `PoolInfo` snapshot exposed by `Connectors::info`.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply on
//!    the acquire/release hot path.
//! 2. **Windowed**: The health loop drains the counters once per interval
//!    with `take`; `snapshot` only reads.
//! 3. **Relaxed Ordering**: No cross-counter ordering is required, only
//!    eventual consistency.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Point-in-time copy of the window counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Acquisitions attempted in the window.
    pub created: u64,
    /// Total nanoseconds spent acquiring.
    pub create_time_ns: u64,
    /// Acquisitions that timed out in the wait queue.
    pub create_timeouts: u64,
    /// Acquisitions served from the wait queue.
    pub waits: u64,
    /// Total nanoseconds spent in the wait queue by served waiters.
    pub wait_time_ns: u64,
    /// Connections returned in a closed state.
    pub return_fails: u64,
    /// Total nanoseconds connections spent leased.
    pub parallel_time_ns: u64,
}

/// Atomic accumulator shared by every acquirer and releaser.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    created: AtomicU64,
    create_time_ns: AtomicU64,
    create_timeouts: AtomicU64,
    waits: AtomicU64,
    wait_time_ns: AtomicU64,
    return_fails: AtomicU64,
    parallel_time_ns: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one acquisition attempt.
    pub fn record_acquire(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the time taken by a successful acquisition.
    pub fn record_create_time(&self, elapsed: Duration) {
        self.create_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    /// Records an acquisition served by the wait queue.
    ///
    /// **Input**: total time spent since the acquisition started.
    /// **Logic**: counts the wait and adds the time to both the create and
    /// the wait totals.
    pub fn record_wait(&self, elapsed: Duration) {
        let ns = nanos(elapsed);
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.create_time_ns.fetch_add(ns, Ordering::Relaxed);
        self.wait_time_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.create_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_return_fail(&self) {
        self.return_fails.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds the duration a connection spent leased.
    pub fn record_parallel_time(&self, leased_for: Duration) {
        self.parallel_time_ns.fetch_add(nanos(leased_for), Ordering::Relaxed);
    }

    /// Reads every counter without resetting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            create_time_ns: self.create_time_ns.load(Ordering::Relaxed),
            create_timeouts: self.create_timeouts.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            wait_time_ns: self.wait_time_ns.load(Ordering::Relaxed),
            return_fails: self.return_fails.load(Ordering::Relaxed),
            parallel_time_ns: self.parallel_time_ns.load(Ordering::Relaxed),
        }
    }

    /// Reads and zeroes every counter, closing the current window.
    pub fn take(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.swap(0, Ordering::Relaxed),
            create_time_ns: self.create_time_ns.swap(0, Ordering::Relaxed),
            create_timeouts: self.create_timeouts.swap(0, Ordering::Relaxed),
            waits: self.waits.swap(0, Ordering::Relaxed),
            wait_time_ns: self.wait_time_ns.swap(0, Ordering::Relaxed),
            return_fails: self.return_fails.swap(0, Ordering::Relaxed),
            parallel_time_ns: self.parallel_time_ns.swap(0, Ordering::Relaxed),
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Structured pool status returned by `Connectors::info`.
///
/// Durations are averages in nanoseconds over the current health window.
/// `Display` renders the snapshot as JSON.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub created: u64,
    /// Health interval in seconds.
    pub seconds: u64,
    /// Leases currently outstanding.
    pub parallel: usize,
    pub wait_count: usize,
    pub total_return_fail: u64,
    pub avg_parallel_time: u64,
    pub avg_create_time: u64,
    pub avg_wait_time: u64,
    pub total_create_timeout: u64,
    pub cell_pos: usize,
    pub cell_min: usize,
    pub cell_max: usize,
}

impl PoolInfo {
    pub(crate) fn from_snapshot(
        snapshot: MetricsSnapshot,
        health_interval: Duration,
        parallel: usize,
        wait_count: usize,
        cells: (usize, usize, usize),
    ) -> Self {
        let per_created = |total: u64| {
            if snapshot.created > 0 {
                total / snapshot.created
            } else {
                total
            }
        };
        let avg_wait_time = if snapshot.waits > 0 {
            snapshot.wait_time_ns / snapshot.waits
        } else {
            0
        };
        PoolInfo {
            created: snapshot.created,
            seconds: health_interval.as_secs(),
            parallel,
            wait_count,
            total_return_fail: snapshot.return_fails,
            avg_parallel_time: per_created(snapshot.parallel_time_ns),
            avg_create_time: per_created(snapshot.create_time_ns),
            avg_wait_time,
            total_create_timeout: snapshot.create_timeouts,
            cell_pos: cells.0,
            cell_min: cells.1,
            cell_max: cells.2,
        }
    }
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_resets_window() {
        let metrics = PoolMetrics::new();
        metrics.record_acquire();
        metrics.record_acquire();
        metrics.record_timeout();
        metrics.record_wait(Duration::from_micros(5));

        let window = metrics.take();
        assert_eq!(window.created, 2);
        assert_eq!(window.create_timeouts, 1);
        assert_eq!(window.waits, 1);
        assert_eq!(window.wait_time_ns, 5_000);
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn snapshot_does_not_reset() {
        let metrics = PoolMetrics::new();
        metrics.record_return_fail();
        assert_eq!(metrics.snapshot().return_fails, 1);
        assert_eq!(metrics.snapshot().return_fails, 1);
    }

    #[test]
    fn info_averages_and_renders_json() {
        let snapshot = MetricsSnapshot {
            created: 4,
            create_time_ns: 400,
            parallel_time_ns: 800,
            waits: 2,
            wait_time_ns: 100,
            ..MetricsSnapshot::default()
        };
        let info = PoolInfo::from_snapshot(snapshot, Duration::from_secs(5), 3, 1, (2, 1, 4));
        assert_eq!(info.avg_create_time, 100);
        assert_eq!(info.avg_parallel_time, 200);
        assert_eq!(info.avg_wait_time, 50);

        let json = info.to_string();
        assert!(json.contains("\"waitCount\":1"));
        assert!(json.contains("\"totalCreateTimeout\":0"));
        assert!(json.contains("\"seconds\":5"));
    }
}
