//! Engine-wide counters. Maintained independently of `mu` so that
//! `GetStatistics` never has to contend with the coarse write lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use graphdb_api::Statistics;

#[derive(Debug, Default)]
pub struct Stats {
    node_count: AtomicU64,
    edge_count: AtomicU64,
    total_queries: AtomicU64,
    avg_query_time_bits: AtomicU64,
    /// Unix seconds of the last successful snapshot, or `0` for "never".
    last_snapshot: AtomicI64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn record_node_created(&self) {
        self.node_count.fetch_add(1, Ordering::Relaxed);
    }

    /// A decrement observing zero is a no-op, not an underflow.
    pub fn record_node_deleted(&self) {
        let _ = self
            .node_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n - 1)
                }
            });
    }

    pub fn record_edge_created(&self) {
        self.edge_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_edge_deleted(&self) {
        let _ = self
            .edge_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n - 1)
                }
            });
    }

    pub fn node_count(&self) -> u64 {
        self.node_count.load(Ordering::Relaxed)
    }

    pub fn edge_count(&self) -> u64 {
        self.edge_count.load(Ordering::Relaxed)
    }

    pub fn record_query(&self, elapsed: std::time::Duration) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let sample = elapsed.as_secs_f64() * 1e9; // nanoseconds
        loop {
            let old_bits = self.avg_query_time_bits.load(Ordering::Relaxed);
            let old = f64::from_bits(old_bits);
            let new = if old_bits == 0 {
                sample
            } else {
                0.9 * old + 0.1 * sample
            };
            if self
                .avg_query_time_bits
                .compare_exchange_weak(
                    old_bits,
                    new.to_bits(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn record_snapshot(&self, at: DateTime<Utc>) {
        self.last_snapshot.store(at.timestamp(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Statistics {
        let last_snapshot_secs = self.last_snapshot.load(Ordering::Relaxed);
        Statistics {
            node_count: self.node_count.load(Ordering::Relaxed),
            edge_count: self.edge_count.load(Ordering::Relaxed),
            total_queries: self.total_queries.load(Ordering::Relaxed),
            avg_query_time_nanos: f64::from_bits(self.avg_query_time_bits.load(Ordering::Relaxed)),
            last_snapshot: if last_snapshot_secs == 0 {
                None
            } else {
                DateTime::from_timestamp(last_snapshot_secs, 0)
            },
        }
    }

    /// Restores counters from a loaded snapshot. `total_queries` and
    /// `avg_query_time` are intentionally not restored — they are
    /// documented as lost on crash, not a bug.
    pub fn restore_from_snapshot(&self, node_count: u64, edge_count: u64, last_snapshot: Option<DateTime<Utc>>) {
        self.node_count.store(node_count, Ordering::Relaxed);
        self.edge_count.store(edge_count, Ordering::Relaxed);
        self.last_snapshot.store(
            last_snapshot.map(|t| t.timestamp()).unwrap_or(0),
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_below_zero_is_a_no_op() {
        let stats = Stats::new();
        stats.record_node_deleted();
        assert_eq!(stats.node_count(), 0);
    }

    #[test]
    fn counts_track_create_and_delete() {
        let stats = Stats::new();
        stats.record_node_created();
        stats.record_node_created();
        stats.record_node_deleted();
        assert_eq!(stats.node_count(), 1);
    }

    #[test]
    fn avg_query_time_converges_toward_samples() {
        let stats = Stats::new();
        stats.record_query(std::time::Duration::from_nanos(100));
        for _ in 0..50 {
            stats.record_query(std::time::Duration::from_nanos(200));
        }
        let snapshot = stats.snapshot();
        assert!((snapshot.avg_query_time_nanos - 200.0).abs() < 1.0);
        assert_eq!(snapshot.total_queries, 51);
    }
}
