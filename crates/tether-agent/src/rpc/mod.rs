//! Request/response correlation.
//!
//! The store is constructed explicitly and handed to the `TransportManager`;
//! there is no process-wide instance.

pub mod store;

pub use store::{CorrelationStore, ResponseCallback};
