#![forbid(unsafe_code)]

// Server metrics — lock-free AtomicU64 counters and Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    25_000,    // 25ms
    50_000,    // 50ms
    100_000,   // 100ms
    250_000,   // 250ms
    500_000,   // 500ms
    1_000_000, // 1s
    5_000_000, // 5s
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters — bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    /// +Inf bucket (total count)
    count: AtomicU64,
    /// Sum of all observations in microseconds
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let labels = [
            "0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "5",
        ];
        for (i, label) in labels.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        // Convert microseconds to seconds with 6 decimal places
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Host-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    offers_sent_total: AtomicU64,
    reconnect_attempts_total: AtomicU64,
    peers_removed_total: AtomicU64,
    bitrate_adjustments_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,

    // Histogram
    message_handling: Histogram,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                offers_sent_total: AtomicU64::new(0),
                reconnect_attempts_total: AtomicU64::new(0),
                peers_removed_total: AtomicU64::new(0),
                bitrate_adjustments_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_offers_sent(&self) {
        self.inner.offers_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_reconnect_attempts(&self) {
        self.inner.reconnect_attempts_total.fetch_add(1, Relaxed);
    }

    pub fn inc_peers_removed(&self) {
        self.inner.peers_removed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_bitrate_adjustments(&self) {
        self.inner.bitrate_adjustments_total.fetch_add(1, Relaxed);
    }

    // --- Gauge ---

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    /// This guarantees the gauge is decremented even if the session handler panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    // --- Histogram ---

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active`, `viewers_active` and `peers_active` are passed in from the
    /// coordinator (on-demand gauges).
    pub fn render_prometheus(
        &self,
        rooms_active: usize,
        viewers_active: usize,
        peers_active: usize,
    ) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        // Counters
        render_counter(&mut out, "lancast_connections_total", "Total signaling sessions accepted", i.connections_total.load(Relaxed));
        render_counter(&mut out, "lancast_messages_received_total", "Total messages received from viewers", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "lancast_messages_sent_total", "Total messages sent to viewers", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "lancast_errors_total", "Total errors", i.errors_total.load(Relaxed));
        render_counter(&mut out, "lancast_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "lancast_joins_total", "Total viewer joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "lancast_leaves_total", "Total viewer leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "lancast_offers_sent_total", "Total session description offers sent", i.offers_sent_total.load(Relaxed));
        render_counter(&mut out, "lancast_reconnect_attempts_total", "Total peer reconnection attempts", i.reconnect_attempts_total.load(Relaxed));
        render_counter(&mut out, "lancast_peers_removed_total", "Total peer connections removed", i.peers_removed_total.load(Relaxed));
        render_counter(&mut out, "lancast_bitrate_adjustments_total", "Total adaptive bitrate adjustments committed", i.bitrate_adjustments_total.load(Relaxed));

        // Gauges
        render_gauge(&mut out, "lancast_connections_active", "Currently open signaling sessions", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "lancast_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "lancast_viewers_active", "Currently joined viewers", viewers_active as u64);
        render_gauge(&mut out, "lancast_peers_active", "Currently live peer connections", peers_active as u64);

        // Histogram
        i.message_handling.render(
            "lancast_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
/// Prevents gauge underflow/drift if the session handler panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_render() {
        let metrics = ServerMetrics::new();
        metrics.inc_connections_total();
        metrics.inc_joins();
        metrics.inc_bitrate_adjustments();
        let guard = metrics.connection_active_guard();

        let out = metrics.render_prometheus(1, 2, 2);
        assert!(out.contains("lancast_connections_total 1"));
        assert!(out.contains("lancast_joins_total 1"));
        assert!(out.contains("lancast_bitrate_adjustments_total 1"));
        assert!(out.contains("lancast_connections_active 1"));
        assert!(out.contains("lancast_rooms_active 1"));
        assert!(out.contains("lancast_viewers_active 2"));

        drop(guard);
        let out = metrics.render_prometheus(0, 0, 0);
        assert!(out.contains("lancast_connections_active 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new();
        h.observe(Duration::from_micros(500));
        h.observe(Duration::from_millis(20));
        h.observe(Duration::from_secs(10));

        let mut out = String::new();
        h.render("lancast_test_seconds", "test", &mut out);
        assert!(out.contains("lancast_test_seconds_bucket{le=\"0.001\"} 1"));
        assert!(out.contains("lancast_test_seconds_bucket{le=\"0.025\"} 2"));
        assert!(out.contains("lancast_test_seconds_bucket{le=\"5\"} 2"));
        assert!(out.contains("lancast_test_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(out.contains("lancast_test_seconds_count 3"));
    }
}
