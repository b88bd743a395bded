//! In-process agent metrics.
//!
//! Counters and histograms live in atomics and are rendered in Prometheus text
//! format on demand (the binary logs them at shutdown).

pub mod metrics;

pub use metrics::AgentMetrics;
