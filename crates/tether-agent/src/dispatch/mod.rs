//! Inbound dispatch.
//!
//! `Dispatcher` is the action registry; `LinkHandler` is the transport
//! listener that routes each inbound packet to the store, a service, or the
//! lifecycle controller.

pub mod handler;
pub mod router;

pub use handler::LinkHandler;
pub use router::{Dispatcher, EventService, RpcService};
