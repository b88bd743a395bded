//! Per-transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by one `FramedTransport` instance.
#[derive(Debug, Default)]
pub struct TransportStats {
    dropped_full: AtomicU64,
    frames_written: AtomicU64,
    frames_read: AtomicU64,
}

impl TransportStats {
    pub fn record_dropped(&self) {
        self.dropped_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Packets dropped because the outgoing queue stayed full.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_full.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub connected: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub dropped_total: u64,
    pub frames_written: u64,
    pub frames_read: u64,
}

impl TransportSnapshot {
    /// Flattened `(name, value)` pairs for the metrics renderer.
    pub fn as_metrics(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("tether_transport_connected", u64::from(self.connected)),
            ("tether_outgoing_queue_depth", self.queue_depth as u64),
            ("tether_outgoing_queue_capacity", self.queue_capacity as u64),
            ("tether_outgoing_dropped_total", self.dropped_total),
            ("tether_frames_written_total", self.frames_written),
            ("tether_frames_read_total", self.frames_read),
        ]
    }
}
