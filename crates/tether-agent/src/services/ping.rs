use async_trait::async_trait;
use serde_json::Value;

use tether_core::error::Result;
use tether_core::packet::{Fields, Packet, PacketKind};

use crate::dispatch::RpcService;

pub const ACTION_PING: &str = "plugin.ping";

/// Answers liveness probes from the backend with `{"pong": true}`.
pub struct PingService;

#[async_trait]
impl RpcService for PingService {
    fn action(&self) -> &'static str {
        ACTION_PING
    }

    async fn call(&self, _request: Packet) -> Result<Packet> {
        let mut payload = Fields::new();
        payload.insert("pong".into(), Value::Bool(true));
        Ok(Packet::new(PacketKind::Rpc, None, Some(payload)))
    }
}
