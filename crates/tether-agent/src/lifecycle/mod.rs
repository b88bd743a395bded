//! Connection lifecycle: state machine, reconnect backoff, auth and one-shot sync.

pub mod backoff;
pub mod controller;
pub mod state;
pub mod sync;

pub use backoff::Backoff;
pub use controller::{LifecycleController, LifecycleOptions};
pub use state::{ConnectionState, StateCell};
pub use sync::{NoopSync, SyncSource};
