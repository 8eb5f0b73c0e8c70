//! Metrics and health checks.
//!
//! Metric namespaces:
//! - keystone.rw.*
//! - keystone.dup_res.*
//! - keystone.repl_write.*
//! - keystone.truncate.*

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall healthy state.
    pub healthy: bool,
    /// Status message.
    pub message: String,
}

impl HealthStatus {
    /// Create a healthy status.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: "OK".to_string(),
        }
    }

    /// Create an unhealthy status.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Metric names.
pub mod metrics {
    /// Transactions currently registered.
    pub const RW_IN_FLIGHT: &str = "keystone.rw.in_flight";
    /// Transactions admitted into the registry.
    pub const RW_ADMITTED_TOTAL: &str = "keystone.rw.admitted_total";
    /// Writes turned away because the key was busy.
    pub const RW_ALREADY_IN_FLIGHT_TOTAL: &str = "keystone.rw.already_in_flight_total";
    /// Messages resent by the retransmit sweep.
    pub const RW_RETRANSMITS_TOTAL: &str = "keystone.rw.retransmits_total";
    /// Transactions that finished OK.
    pub const RW_COMPLETED_TOTAL: &str = "keystone.rw.completed_total";
    /// Transactions that finished with an error code.
    pub const RW_FAILED_TOTAL: &str = "keystone.rw.failed_total";
    /// Admission-to-completion latency.
    pub const RW_LATENCY_MS: &str = "keystone.rw.latency_ms";
    /// Duplicate resolutions settled by merging an exact tie.
    pub const DUP_RES_TIES_TOTAL: &str = "keystone.dup_res.ties_total";
    /// Duplicate resolutions won by a remote copy.
    pub const DUP_RES_REMOTE_WINS_TOTAL: &str = "keystone.dup_res.remote_wins_total";
    /// Bins taken from a non-winning copy during a tie merge.
    pub const DUP_RES_BIN_WINNERS_TOTAL: &str = "keystone.dup_res.bin_winners_total";
    /// Replica acks carrying an error code.
    pub const REPL_WRITE_FAILURES_TOTAL: &str = "keystone.repl_write.failures_total";
    /// Inbound replica writes this node refused.
    pub const REPL_WRITE_REJECTED_TOTAL: &str = "keystone.repl_write.rejected_total";
    /// Records removed by truncation reapers.
    pub const TRUNCATE_RECORDS_REAPED_TOTAL: &str = "keystone.truncate.records_reaped_total";
    /// Reaper threads currently running.
    pub const TRUNCATE_THREADS_RUNNING: &str = "keystone.truncate.threads_running";
}

/// Named counters, gauges and histograms.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicU64>>,
    histograms: RwLock<HashMap<String, HistogramData>>,
}

impl MetricsRegistry {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Get counter value.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge value.
    pub fn gauge_set(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Get gauge value.
    pub fn gauge_get(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, value: f64) {
        self.histograms
            .write()
            .entry(name.to_string())
            .or_default()
            .observe(value);
    }

    /// Get histogram data.
    pub fn histogram_get(&self, name: &str) -> Option<HistogramSnapshot> {
        self.histograms.read().get(name).map(|h| h.snapshot())
    }

    /// Export metrics in Prometheus text format, sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read();
        let mut names: Vec<_> = counters.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} counter\n{} {}\n",
                prometheus_name,
                prometheus_name,
                counters[name].load(Ordering::Relaxed)
            ));
        }

        let gauges = self.gauges.read();
        let mut names: Vec<_> = gauges.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} gauge\n{} {}\n",
                prometheus_name,
                prometheus_name,
                gauges[name].load(Ordering::Relaxed)
            ));
        }

        let histograms = self.histograms.read();
        let mut names: Vec<_> = histograms.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = name.replace('.', "_");
            let snapshot = histograms[name].snapshot();
            output.push_str(&format!(
                "# TYPE {} histogram\n{}_count {}\n{}_sum {}\n",
                prometheus_name, prometheus_name, snapshot.count, prometheus_name, snapshot.sum
            ));
        }

        output
    }
}

#[derive(Debug)]
struct HistogramData {
    count: AtomicU64,
    // (sum, min, max)
    stats: Mutex<(f64, f64, f64)>,
}

impl Default for HistogramData {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            stats: Mutex::new((0.0, f64::MAX, f64::MIN)),
        }
    }
}

impl HistogramData {
    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.lock();
        stats.0 += value;
        stats.1 = stats.1.min(value);
        stats.2 = stats.2.max(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let (sum, min, max) = *self.stats.lock();
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum,
            min,
            max,
        }
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
    /// Minimum value observed.
    pub min: f64,
    /// Maximum value observed.
    pub max: f64,
}

impl HistogramSnapshot {
    /// Calculate mean.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Typed recorder for the write path and truncation.
#[derive(Debug, Default)]
pub struct KeystoneMetrics {
    registry: MetricsRegistry,
}

impl KeystoneMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the underlying registry.
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    // === Transactions ===

    pub fn set_in_flight(&self, count: u32) {
        self.registry.gauge_set(metrics::RW_IN_FLIGHT, count as u64);
    }

    pub fn record_admitted(&self) {
        self.registry.counter_inc(metrics::RW_ADMITTED_TOTAL);
    }

    pub fn record_already_in_flight(&self) {
        self.registry.counter_inc(metrics::RW_ALREADY_IN_FLIGHT_TOTAL);
    }

    pub fn record_retransmits(&self, count: u64) {
        self.registry.counter_add(metrics::RW_RETRANSMITS_TOTAL, count);
    }

    /// Record a terminal transaction and its latency.
    pub fn record_completion(&self, ok: bool, latency_ms: u64) {
        let name = if ok {
            metrics::RW_COMPLETED_TOTAL
        } else {
            metrics::RW_FAILED_TOTAL
        };
        self.registry.counter_inc(name);
        self.registry
            .histogram_observe(metrics::RW_LATENCY_MS, latency_ms as f64);
    }

    // === Duplicate resolution ===

    pub fn record_dup_res_tie(&self, bins_won: u32) {
        self.registry.counter_inc(metrics::DUP_RES_TIES_TOTAL);
        self.registry
            .counter_add(metrics::DUP_RES_BIN_WINNERS_TOTAL, bins_won as u64);
    }

    pub fn record_dup_res_remote_win(&self) {
        self.registry.counter_inc(metrics::DUP_RES_REMOTE_WINS_TOTAL);
    }

    // === Replica writes ===

    pub fn record_replica_failure(&self) {
        self.registry.counter_inc(metrics::REPL_WRITE_FAILURES_TOTAL);
    }

    pub fn record_replica_rejected(&self) {
        self.registry.counter_inc(metrics::REPL_WRITE_REJECTED_TOTAL);
    }

    // === Truncation ===

    pub fn record_reaped(&self, count: u64) {
        self.registry
            .counter_add(metrics::TRUNCATE_RECORDS_REAPED_TOTAL, count);
    }

    pub fn set_reapers_running(&self, count: u32) {
        self.registry
            .gauge_set(metrics::TRUNCATE_THREADS_RUNNING, count as u64);
    }

    /// Export all metrics.
    pub fn export(&self) -> String {
        self.registry.export_prometheus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_counters() {
        let registry = MetricsRegistry::new();

        registry.counter_inc("test.counter");
        assert_eq!(registry.counter_get("test.counter"), 1);

        registry.counter_add("test.counter", 5);
        assert_eq!(registry.counter_get("test.counter"), 6);
        assert_eq!(registry.counter_get("test.missing"), 0);
    }

    #[test]
    fn test_metrics_registry_histograms() {
        let registry = MetricsRegistry::new();

        registry.histogram_observe("test.histogram", 10.0);
        registry.histogram_observe("test.histogram", 20.0);
        registry.histogram_observe("test.histogram", 30.0);

        let snapshot = registry.histogram_get("test.histogram").unwrap();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.sum, 60.0);
        assert_eq!(snapshot.min, 10.0);
        assert_eq!(snapshot.max, 30.0);
        assert_eq!(snapshot.mean(), 20.0);
    }

    #[test]
    fn test_keystone_metrics_completion() {
        let recorder = KeystoneMetrics::new();

        recorder.record_completion(true, 4);
        recorder.record_completion(false, 8);
        recorder.record_completion(true, 6);

        assert_eq!(recorder.registry().counter_get(metrics::RW_COMPLETED_TOTAL), 2);
        assert_eq!(recorder.registry().counter_get(metrics::RW_FAILED_TOTAL), 1);
        let latency = recorder.registry().histogram_get(metrics::RW_LATENCY_MS).unwrap();
        assert_eq!(latency.count, 3);
        assert_eq!(latency.mean(), 6.0);
    }

    #[test]
    fn test_dup_res_tie_counts_bins() {
        let recorder = KeystoneMetrics::new();
        recorder.record_dup_res_tie(3);
        recorder.record_dup_res_tie(0);
        assert_eq!(recorder.registry().counter_get(metrics::DUP_RES_TIES_TOTAL), 2);
        assert_eq!(
            recorder.registry().counter_get(metrics::DUP_RES_BIN_WINNERS_TOTAL),
            3
        );
    }

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::healthy().healthy);
        let down = HealthStatus::unhealthy("reaper stalled");
        assert!(!down.healthy);
        assert_eq!(down.message, "reaper stalled");
    }

    #[test]
    fn test_prometheus_export() {
        let recorder = KeystoneMetrics::new();
        recorder.record_admitted();
        recorder.set_in_flight(42);

        let output = recorder.export();
        assert!(output.contains("keystone_rw_admitted_total 1"));
        assert!(output.contains("keystone_rw_in_flight 42"));
    }
}
