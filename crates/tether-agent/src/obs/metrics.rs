//! Labelled counter/gauge/histogram types backed by `DashMap`.
//!
//! Label sets are sorted before use so rendering is deterministic. Histogram
//! buckets are fixed in microseconds.

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn label_key(labels: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut key: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    key.sort();
    key
}

fn label_str(key: &[(String, String)]) -> String {
    key.iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Default)]
pub struct CounterVec {
    map: DashMap<Vec<(String, String)>, AtomicU64>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &[(&str, &str)], v: u64) {
        let counter = self
            .map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicU64::new(0));
        counter.fetch_add(v, Ordering::Relaxed);
    }

    /// Current value for one label set (0 if never touched).
    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&label_key(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} counter", name);
        for r in self.map.iter() {
            let val = r.value().load(Ordering::Relaxed);
            let _ = writeln!(out, "{}{{{}}} {}", name, label_str(r.key()), val);
        }
    }
}

#[derive(Default)]
pub struct GaugeVec {
    map: DashMap<Vec<(String, String)>, AtomicI64>,
}

impl GaugeVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }
    pub fn dec(&self, labels: &[(&str, &str)]) {
        self.add(labels, -1);
    }

    pub fn add(&self, labels: &[(&str, &str)], v: i64) {
        let gauge = self
            .map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicI64::new(0));
        gauge.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[(&str, &str)]) -> i64 {
        self.map
            .get(&label_key(labels))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} gauge", name);
        for r in self.map.iter() {
            let val = r.value().load(Ordering::Relaxed);
            let _ = writeln!(out, "{}{{{}}} {}", name, label_str(r.key()), val);
        }
    }
}

// 1ms .. 30s; request latency is dominated by the network round trip.
const BUCKETS_MICROS: [u64; 9] = [
    1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000, 30_000_000,
];

#[derive(Default)]
struct AtomicHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    buckets: [AtomicU64; 9],
}

#[derive(Default)]
pub struct HistogramVec {
    map: DashMap<Vec<(String, String)>, AtomicHistogram>,
}

impl HistogramVec {
    /// Observe a duration into cumulative buckets (microsecond scale).
    pub fn observe(&self, labels: &[(&str, &str)], duration: Duration) {
        let hist = self.map.entry(label_key(labels)).or_default();
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        hist.count.fetch_add(1, Ordering::Relaxed);
        hist.sum.fetch_add(micros, Ordering::Relaxed);
        for (i, &b) in BUCKETS_MICROS.iter().enumerate() {
            if micros <= b {
                hist.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&label_key(labels))
            .map(|h| h.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for r in self.map.iter() {
            let hist = r.value();
            let labels = label_str(r.key());
            let prefix = if labels.is_empty() {
                String::new()
            } else {
                format!("{},", labels)
            };

            for (i, &le) in BUCKETS_MICROS.iter().enumerate() {
                let count = hist.buckets[i].load(Ordering::Relaxed);
                let _ = writeln!(out, "{}_bucket{{{}le=\"{}\"}} {}", name, prefix, le, count);
            }
            let count = hist.count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{{}le=\"+Inf\"}} {}", name, prefix, count);
            let sum = hist.sum.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, sum);
            let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, count);
        }
    }
}

#[derive(Default)]
pub struct AgentMetrics {
    /// by packet kind
    pub packets_sent: CounterVec,
    pub packets_received: CounterVec,
    /// packets the auth gate refused, by reason
    pub gate_drops: CounterVec,
    /// completed requests, by outcome
    pub rpc_requests: CounterVec,
    pub rpc_inflight: GaugeVec,
    pub rpc_latency: HistogramVec, // microseconds
    /// inbound requests served locally, by outcome
    pub rpc_served: CounterVec,
    pub state_transitions: CounterVec,
    pub connect_failures: CounterVec,
    pub auth_attempts: CounterVec,
    shutting_down: AtomicBool,
}

impl AgentMetrics {
    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Render everything plus caller-supplied extra samples.
    pub fn render(&self, extra: &[(&str, u64)]) -> String {
        let mut out = String::new();
        self.packets_sent.render("tether_packets_sent_total", &mut out);
        self.packets_received.render("tether_packets_received_total", &mut out);
        self.gate_drops.render("tether_gate_drops_total", &mut out);
        self.rpc_requests.render("tether_rpc_requests_total", &mut out);
        self.rpc_inflight.render("tether_rpc_inflight", &mut out);
        self.rpc_latency.render("tether_rpc_latency_micros", &mut out);
        self.rpc_served.render("tether_rpc_served_total", &mut out);
        self.state_transitions.render("tether_state_transitions_total", &mut out);
        self.connect_failures.render("tether_connect_failures_total", &mut out);
        self.auth_attempts.render("tether_auth_attempts_total", &mut out);

        let _ = writeln!(
            out,
            "# TYPE tether_shutting_down gauge\ntether_shutting_down {}",
            u8::from(self.is_shutting_down())
        );
        for (k, v) in extra {
            let _ = writeln!(out, "{} {}", k, v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_order_insensitive() {
        let m = AgentMetrics::default();
        m.rpc_requests.inc(&[("outcome", "ok"), ("a", "b")]);
        m.rpc_requests.inc(&[("a", "b"), ("outcome", "ok")]);
        assert_eq!(m.rpc_requests.get(&[("outcome", "ok"), ("a", "b")]), 2);
    }

    #[test]
    fn render_includes_extra_and_histogram_lines() {
        let m = AgentMetrics::default();
        m.rpc_latency
            .observe(&[("outcome", "ok")], Duration::from_millis(3));
        m.rpc_inflight.inc(&[]);
        m.rpc_inflight.dec(&[]);

        let text = m.render(&[("tether_transport_queue_depth", 7)]);
        assert!(text.contains("tether_rpc_latency_micros_bucket{outcome=\"ok\",le=\"1000\"} 0"));
        assert!(text.contains("tether_rpc_latency_micros_bucket{outcome=\"ok\",le=\"5000\"} 1"));
        assert!(text.contains("tether_rpc_latency_micros_count{outcome=\"ok\"} 1"));
        assert!(text.contains("tether_rpc_inflight{} 0"));
        assert!(text.contains("tether_shutting_down 0"));
        assert!(text.ends_with("tether_transport_queue_depth 7\n"));
    }
}
