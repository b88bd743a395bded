//! Transport layer (framed TCP).
//!
//! `FramedTransport` owns the socket and its reader/writer tasks;
//! `TransportManager` layers the auth gate and request/response on top.

pub mod framed;
pub mod listener;
pub mod manager;
pub mod stats;

pub use framed::{FramedTransport, LinkState, TransportOptions};
pub use listener::TransportListener;
pub use manager::TransportManager;
pub use stats::{TransportSnapshot, TransportStats};
