use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use tether_core::error::{Result, TetherError};
use tether_core::packet::Packet;

/// Handles backend requests for one action. The returned packet is sent back
/// as the correlated response.
#[async_trait]
pub trait RpcService: Send + Sync {
    fn action(&self) -> &'static str;
    async fn call(&self, request: Packet) -> Result<Packet>;
}

/// Handles one-way backend events for one action.
#[async_trait]
pub trait EventService: Send + Sync {
    fn action(&self) -> &'static str;
    async fn handle(&self, event: Packet) -> Result<()>;
}

/// Registry of RPC and event services keyed by action.
#[derive(Default)]
pub struct Dispatcher {
    rpc: DashMap<&'static str, Arc<dyn RpcService>>,
    events: DashMap<&'static str, Arc<dyn EventService>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_rpc(&self, svc: Arc<dyn RpcService>) {
        self.rpc.insert(svc.action(), svc);
    }

    pub fn register_event(&self, svc: Arc<dyn EventService>) {
        self.events.insert(svc.action(), svc);
    }

    pub fn registered_rpc_actions(&self) -> Vec<&'static str> {
        self.rpc.iter().map(|e| *e.key()).collect()
    }

    pub fn registered_event_actions(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| *e.key()).collect()
    }

    /// Run the service for `request`. Failures become an error response.
    pub async fn dispatch_rpc(&self, request: Packet) -> Packet {
        let action = request.action().to_owned();
        let handler = self.rpc.get(action.as_str()).map(|e| e.value().clone());
        let Some(handler) = handler else {
            tracing::debug!(%action, "no rpc service registered");
            return Packet::rpc_error(&format!("unknown action: {action}"));
        };

        match handler.call(request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(%action, error = %e, "rpc service failed");
                Packet::rpc_error(&e.to_string())
            }
        }
    }

    pub async fn dispatch_event(&self, event: Packet) -> Result<()> {
        let action = event.action().to_owned();
        let handler = self
            .events
            .get(action.as_str())
            .map(|e| e.value().clone())
            .ok_or_else(|| TetherError::Internal(format!("unknown event action: {action}")))?;
        handler.handle(event).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::{json, Value};
    use tether_core::packet::Fields;

    struct Fails;

    #[async_trait]
    impl RpcService for Fails {
        fn action(&self) -> &'static str {
            "plugin.fails"
        }
        async fn call(&self, _request: Packet) -> Result<Packet> {
            Err(TetherError::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn unknown_action_yields_error_packet() {
        let d = Dispatcher::new();
        let resp = d.dispatch_rpc(Packet::request("nope", Fields::new())).await;
        assert_eq!(
            resp.payload().get("error"),
            Some(&Value::String("unknown action: nope".into()))
        );
    }

    #[tokio::test]
    async fn service_error_is_reported_in_payload() {
        let d = Dispatcher::new();
        d.register_rpc(Arc::new(Fails));
        assert_eq!(d.registered_rpc_actions(), vec!["plugin.fails"]);

        let resp = d
            .dispatch_rpc(Packet::request("plugin.fails", Fields::new()))
            .await;
        assert_eq!(resp.payload().get("error"), Some(&json!("internal: boom")));
    }

    #[tokio::test]
    async fn unknown_event_is_an_error() {
        let d = Dispatcher::new();
        assert!(d
            .dispatch_event(Packet::event("nope", Fields::new()))
            .await
            .is_err());
    }
}
