// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for inventory-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `inventory_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `status`: success, failed, skipped
//! - `outcome`: granted, busy, renewed, expired
//! - `severity`: none, minor, major, critical

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a finished (or skipped) sync run
pub fn record_sync_run(status: &str) {
    counter!(
        "inventory_sync_sync_runs_total",
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_sync_duration(duration: Duration) {
    histogram!("inventory_sync_sync_duration_seconds").record(duration.as_secs_f64());
}

/// Record per-item outcomes of a batch
pub fn record_items(upserted: u64, skipped: u64, deleted: u64, duplicates: u64) {
    counter!("inventory_sync_items_upserted_total").increment(upserted);
    counter!("inventory_sync_items_skipped_total").increment(skipped);
    counter!("inventory_sync_items_deleted_total").increment(deleted);
    counter!("inventory_sync_duplicates_resolved_total").increment(duplicates);
}

pub fn record_invalid_record() {
    counter!("inventory_sync_invalid_records_total").increment(1);
}

/// Record rows per source page
pub fn record_batch_size(count: usize) {
    histogram!("inventory_sync_batch_size").record(count as f64);
}

pub fn record_source_error(kind: &str) {
    counter!(
        "inventory_sync_source_errors_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a lease operation outcome
pub fn record_lease(resource: &str, outcome: &str) {
    counter!(
        "inventory_sync_lease_operations_total",
        "resource" => resource.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn set_stale_items(count: usize) {
    gauge!("inventory_sync_stale_items").set(count as f64);
}

/// Record a created or refined variance
pub fn record_variance(severity: &str) {
    counter!(
        "inventory_sync_variances_total",
        "severity" => severity.to_string()
    )
    .increment(1);
}

pub fn record_variance_transition(to: &str) {
    counter!(
        "inventory_sync_variance_transitions_total",
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_concurrent_modification() {
    counter!("inventory_sync_concurrent_modifications_total").increment(1);
}

pub fn record_count_submitted(verified: bool) {
    counter!(
        "inventory_sync_counts_submitted_total",
        "verified" => verified.to_string()
    )
    .increment(1);
}

/// A count stored `pending` because its variance stayed locked
pub fn record_count_deferred() {
    counter!("inventory_sync_counts_deferred_total").increment(1);
}

/// Record a notification delivered to (or dropped by) one subscriber
pub fn record_notification(event_type: &str, delivered: bool) {
    counter!(
        "inventory_sync_notifications_total",
        "type" => event_type.to_string(),
        "status" => if delivered { "delivered" } else { "dropped" }.to_string()
    )
    .increment(1);
}

/// A timing guard that records sync duration on drop
pub struct SyncTimer {
    start: Instant,
}

impl SyncTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Drop for SyncTimer {
    fn drop(&mut self) {
        record_sync_duration(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without an installed recorder these are no-ops; they must not panic.
    #[test]
    fn test_record_without_recorder() {
        record_sync_run("success");
        record_items(3, 1, 0, 2);
        record_batch_size(500);
        record_lease("sync", "busy");
        set_stale_items(4);
        record_variance("major");
        record_variance_transition("resolved");
        record_count_deferred();
        record_notification("sync_completed", false);
        {
            let _timer = SyncTimer::start();
        }
    }

    #[test]
    fn test_counters_reach_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_sync_run("success");
            record_sync_run("success");
            record_items(5, 2, 0, 1);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let counter = |name: &str| {
            snapshot.iter().find_map(|(key, _, _, value)| {
                match (key.key().name() == name, value) {
                    (true, DebugValue::Counter(v)) => Some(*v),
                    _ => None,
                }
            })
        };

        assert_eq!(counter("inventory_sync_sync_runs_total"), Some(2));
        assert_eq!(counter("inventory_sync_items_upserted_total"), Some(5));
        assert_eq!(counter("inventory_sync_items_skipped_total"), Some(2));
    }
}
