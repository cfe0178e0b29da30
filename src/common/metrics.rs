//! Metrics collection
//!
//! Prometheus-compatible counters, gauges and a latency histogram for the
//! replica directory, the ground projection and the reconciliation loop.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    /// Cumulative buckets, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics of one master process
#[derive(Debug)]
pub struct MetricsRegistry {
    start_time: Instant,

    pub chunks_created: Counter,
    pub chunks_removed: Counter,
    pub replicas_recorded: Counter,
    pub replicas_dropped: Counter,
    pub stale_events: Counter,

    pub ground_batches: Counter,
    pub ground_failures: Counter,
    pub ground_rows_written: Counter,
    pub ground_rows_deleted: Counter,
    pub ground_latency: Histogram,

    pub chunks: Gauge,
    pub reconcile_backlog: Gauge,
    pub lost_chunks: Gauge,
    pub degraded_chunks: Gauge,
    pub locations_up: Gauge,
    pub locations_suspect: Gauge,
    pub locations_down: Gauge,
    pub down_transitions: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            chunks_created: Counter::new(),
            chunks_removed: Counter::new(),
            replicas_recorded: Counter::new(),
            replicas_dropped: Counter::new(),
            stale_events: Counter::new(),
            ground_batches: Counter::new(),
            ground_failures: Counter::new(),
            ground_rows_written: Counter::new(),
            ground_rows_deleted: Counter::new(),
            ground_latency: Histogram::new(),
            chunks: Gauge::new(),
            reconcile_backlog: Gauge::new(),
            lost_chunks: Gauge::new(),
            degraded_chunks: Gauge::new(),
            locations_up: Gauge::new(),
            locations_suspect: Gauge::new(),
            locations_down: Gauge::new(),
            down_transitions: Counter::new(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("replicadir_chunks_created_total", "Chunks created", &self.chunks_created),
            ("replicadir_chunks_removed_total", "Chunks removed", &self.chunks_removed),
            ("replicadir_replicas_recorded_total", "Replicas recorded", &self.replicas_recorded),
            ("replicadir_replicas_dropped_total", "Replicas dropped", &self.replicas_dropped),
            ("replicadir_stale_events_total", "Events referencing removed chunks or locations", &self.stale_events),
            ("replicadir_ground_batches_total", "Ground store batches applied", &self.ground_batches),
            ("replicadir_ground_failures_total", "Ground store batches failed", &self.ground_failures),
            ("replicadir_ground_rows_written_total", "Ground rows written", &self.ground_rows_written),
            ("replicadir_ground_rows_deleted_total", "Ground rows deleted", &self.ground_rows_deleted),
            ("replicadir_location_down_transitions_total", "Locations declared down", &self.down_transitions),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges = [
            ("replicadir_chunks", "Chunks known to the directory", &self.chunks),
            ("replicadir_reconcile_backlog", "Chunks awaiting a ground store retry", &self.reconcile_backlog),
            ("replicadir_lost_chunks", "Chunks without any current replica", &self.lost_chunks),
            ("replicadir_degraded_chunks", "Chunks underreplicated for too long", &self.degraded_chunks),
            ("replicadir_locations_up", "Locations up", &self.locations_up),
            ("replicadir_locations_suspect", "Locations suspect", &self.locations_suspect),
            ("replicadir_locations_down", "Locations down or reaped", &self.locations_down),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, gauge.get());
        }

        out.push_str("# HELP replicadir_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE replicadir_uptime_seconds gauge\n");
        let _ = writeln!(out, "replicadir_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP replicadir_ground_batch_ms Ground batch latency in milliseconds\n");
        out.push_str("# TYPE replicadir_ground_batch_ms histogram\n");
        for (le, count) in self.ground_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "replicadir_ground_batch_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "replicadir_ground_batch_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "replicadir_ground_batch_ms_sum {}", self.ground_latency.sum());
        let _ = writeln!(out, "replicadir_ground_batch_ms_count {}", self.ground_latency.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
