use std::sync::{Arc, Weak};

use async_trait::async_trait;

use tether_core::error::TetherError;
use tether_core::packet::Packet;

use crate::dispatch::router::Dispatcher;
use crate::lifecycle::LifecycleController;
use crate::obs::AgentMetrics;
use crate::transport::{TransportListener, TransportManager};

/// Transport listener for the agent.
///
/// Holds the controller weakly: the controller owns the manager, which owns
/// the transport, which owns this handler.
pub struct LinkHandler {
    manager: Arc<TransportManager>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Weak<LifecycleController>,
    metrics: Arc<AgentMetrics>,
}

impl LinkHandler {
    pub fn new(
        manager: Arc<TransportManager>,
        dispatcher: Arc<Dispatcher>,
        lifecycle: Weak<LifecycleController>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            lifecycle,
            metrics,
        }
    }

    fn serve_request(&self, request: Packet) {
        let manager = Arc::clone(&self.manager);
        let dispatcher = Arc::clone(&self.dispatcher);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let response = dispatcher.dispatch_rpc(request.clone()).await;
            let outcome = if response.payload().contains_key("error") {
                "error"
            } else {
                "ok"
            };
            metrics.rpc_served.inc(&[("outcome", outcome)]);

            if let Err(e) = manager.respond(&request, response).await {
                tracing::warn!(
                    request_id = %request.id(),
                    action = %request.action(),
                    error = %e,
                    "failed to send rpc response"
                );
            }
        });
    }
}

#[async_trait]
impl TransportListener for LinkHandler {
    async fn on_packet(&self, packet: Packet) {
        self.metrics
            .packets_received
            .inc(&[("kind", packet.kind().as_str())]);

        if packet.is_response() {
            if let Err(e) = self.manager.handle_response(packet).await {
                tracing::warn!(error = %e, "response without pending request");
            }
            return;
        }

        if !self.manager.is_authenticated() {
            tracing::debug!(
                packet_id = %packet.id(),
                action = %packet.action(),
                "inbound packet before authentication; dropped"
            );
            return;
        }

        if packet.is_request() {
            self.serve_request(packet);
            return;
        }

        let action = packet.action().to_owned();
        if let Err(e) = self.dispatcher.dispatch_event(packet).await {
            tracing::debug!(%action, error = %e, "event not handled");
        }
    }

    async fn on_connect(&self) {
        if let Some(lc) = self.lifecycle.upgrade() {
            lc.on_transport_connected();
        }
    }

    async fn on_disconnect(&self) {
        if let Some(lc) = self.lifecycle.upgrade() {
            lc.on_transport_disconnected();
        }
    }

    async fn on_error(&self, err: &TetherError) {
        if let Some(lc) = self.lifecycle.upgrade() {
            lc.on_transport_error(err);
        }
    }
}
