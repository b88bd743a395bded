//! Top-level facade crate for tether.
//!
//! Re-exports the wire primitives and the agent runtime so users can depend on a single crate.

pub mod core {
    pub use tether_core::*;
}

pub mod agent {
    pub use tether_agent::*;
}
