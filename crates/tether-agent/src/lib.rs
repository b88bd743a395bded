//! tether agent runtime.
//!
//! Wires the framed transport, correlation store, auth-gated transport
//! manager and connection lifecycle controller into one `Agent`. Consumed by
//! the binary (`main.rs`) and by integration tests.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod obs;
pub mod rpc;
pub mod services;
pub mod transport;

pub use agent::Agent;
