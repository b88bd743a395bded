//! tether core: transport-agnostic packet envelope, wire codec, and errors.
//!
//! This crate defines the wire-level contracts and error surface shared by the
//! agent runtime and its tests. It carries no async runtime dependency so the
//! codec can be exercised in isolation.
//!
//! # Guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here.
//! All fallible paths surface as `TetherError`/`Result` so a corrupt stream
//! never takes the host process down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod packet;
pub mod protocol;

/// Shared result type.
pub use error::{ErrorCode, Result, TetherError};
pub use packet::{AuthResponse, Fields, Packet, PacketKind};
