use async_trait::async_trait;

use tether_core::error::TetherError;
use tether_core::packet::Packet;

/// Callbacks raised by the transport.
///
/// `on_packet` runs on the reader task, in wire order, so implementations
/// must hand long work off to their own tasks.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn on_packet(&self, packet: Packet);
    async fn on_connect(&self);
    async fn on_disconnect(&self);
    async fn on_error(&self, error: &TetherError);
}
