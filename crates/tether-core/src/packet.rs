//! The packet envelope shared by both directions of the link.
//!
//! A `Packet` is immutable once built: builders produce fresh envelopes, and
//! `with_correlation` consumes the packet and returns a response-shaped copy.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, TetherError};

/// String-keyed structured data used for metadata and payload.
pub type Fields = Map<String, Value>;

/// Reserved metadata key: logical message name.
pub const META_ACTION: &str = "action";
/// Reserved metadata key: id of the request a response answers.
pub const META_CORRELATION_ID: &str = "correlation_id";
/// Reserved metadata key: advisory "a reply is expected".
pub const META_REQUIRES_RESPONSE: &str = "requires_response";

/// Action carried by the authentication request.
pub const ACTION_AUTH_REQUEST: &str = "plugin.auth.request";

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// One-way notification, no response expected.
    Event,
    /// Request/response.
    Rpc,
}

impl PacketKind {
    /// Wire representation (`packet_type`).
    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::Event => "EVENT",
            PacketKind::Rpc => "RPC",
        }
    }

    /// Parse the wire representation. Unknown values are rejected, never guessed.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "EVENT" => Ok(PacketKind::Event),
            "RPC" => Ok(PacketKind::Rpc),
            other => Err(TetherError::Protocol(format!("unknown packet_type: {other}"))),
        }
    }
}

/// Seconds since the unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Fresh random packet id.
pub fn new_packet_id() -> String {
    Uuid::new_v4().to_string()
}

/// Immutable message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    id: String,
    kind: PacketKind,
    metadata: Fields,
    payload: Fields,
    timestamp: u64,
}

impl Packet {
    /// Build a packet with a fresh id and the current timestamp.
    pub fn new(kind: PacketKind, metadata: Option<Fields>, payload: Option<Fields>) -> Self {
        Self::from_parts(new_packet_id(), kind, metadata, payload, now_secs())
    }

    /// Build a packet from explicit parts (decoding, tests).
    pub fn from_parts(
        id: impl Into<String>,
        kind: PacketKind,
        metadata: Option<Fields>,
        payload: Option<Fields>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            metadata: metadata.unwrap_or_default(),
            payload: payload.unwrap_or_default(),
            timestamp,
        }
    }

    /// One-way event for `action`.
    pub fn event(action: &str, payload: Fields) -> Self {
        Self::new(PacketKind::Event, Some(action_metadata(action)), Some(payload))
    }

    /// RPC request for `action`.
    pub fn request(action: &str, payload: Fields) -> Self {
        let mut metadata = action_metadata(action);
        metadata.insert(META_REQUIRES_RESPONSE.into(), Value::Bool(true));
        Self::new(PacketKind::Rpc, Some(metadata), Some(payload))
    }

    /// The designated authentication request carrying `token`.
    pub fn auth_request(token: &str) -> Self {
        let mut payload = Fields::new();
        payload.insert("token".into(), Value::String(token.to_owned()));
        Self::request(ACTION_AUTH_REQUEST, payload)
    }

    /// RPC error body (`{"error": message}`), to be sent through `respond`.
    pub fn rpc_error(message: &str) -> Self {
        let mut payload = Fields::new();
        payload.insert("error".into(), Value::String(message.to_owned()));
        Self::new(PacketKind::Rpc, None, Some(payload))
    }

    /// Turn this packet into a response to `request_id`.
    pub fn with_correlation(mut self, request_id: &str) -> Self {
        self.kind = PacketKind::Rpc;
        self.metadata
            .insert(META_CORRELATION_ID.into(), Value::String(request_id.to_owned()));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn metadata(&self) -> &Fields {
        &self.metadata
    }

    pub fn payload(&self) -> &Fields {
        &self.payload
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Logical action name, empty when absent.
    pub fn action(&self) -> &str {
        self.metadata
            .get(META_ACTION)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Non-empty correlation id, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata
            .get(META_CORRELATION_ID)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn requires_response(&self) -> bool {
        self.metadata
            .get(META_REQUIRES_RESPONSE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_event(&self) -> bool {
        self.kind == PacketKind::Event
    }

    pub fn is_request(&self) -> bool {
        self.kind == PacketKind::Rpc && self.correlation_id().is_none()
    }

    pub fn is_response(&self) -> bool {
        self.kind == PacketKind::Rpc && self.correlation_id().is_some()
    }

    pub fn is_auth_packet(&self) -> bool {
        self.action() == ACTION_AUTH_REQUEST
    }
}

fn action_metadata(action: &str) -> Fields {
    let mut metadata = Fields::new();
    metadata.insert(META_ACTION.into(), Value::String(action.to_owned()));
    metadata
}

/// Parsed reply to the authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub success: bool,
    pub server_id: String,
    pub message: String,
}

impl AuthResponse {
    pub fn from_packet(packet: &Packet) -> Self {
        let p = packet.payload();
        let text = |key: &str| {
            p.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        Self {
            success: p.get("success").and_then(Value::as_bool).unwrap_or(false),
            server_id: text("server_id"),
            message: text("message"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        match v {
            Value::Object(m) => m,
            _ => Fields::new(),
        }
    }

    #[test]
    fn missing_maps_normalize_to_empty() {
        let p = Packet::new(PacketKind::Event, None, None);
        assert!(p.metadata().is_empty());
        assert!(p.payload().is_empty());
        assert_eq!(p.action(), "");
        assert!(!p.id().is_empty());
    }

    #[test]
    fn request_and_response_are_exclusive() {
        let req = Packet::request("ping", Fields::new());
        assert!(req.is_request());
        assert!(!req.is_response());
        assert!(req.requires_response());

        let resp = Packet::new(PacketKind::Event, None, Some(fields(json!({"pong": true}))))
            .with_correlation(req.id());
        assert!(resp.is_response());
        assert!(!resp.is_request());
        assert!(!resp.is_event());
        assert_eq!(resp.correlation_id(), Some(req.id()));
    }

    #[test]
    fn empty_correlation_id_is_still_a_request() {
        let mut meta = Fields::new();
        meta.insert(META_CORRELATION_ID.into(), json!(""));
        let p = Packet::new(PacketKind::Rpc, Some(meta), None);
        assert!(p.is_request());
        assert_eq!(p.correlation_id(), None);
    }

    #[test]
    fn auth_packet_shape() {
        let p = Packet::auth_request("secret");
        assert!(p.is_auth_packet());
        assert!(p.is_request());
        assert_eq!(p.payload().get("token"), Some(&json!("secret")));
        assert!(!Packet::event("player.join", Fields::new()).is_auth_packet());
    }

    #[test]
    fn auth_response_parsing() {
        let ok = Packet::new(
            PacketKind::Rpc,
            None,
            Some(fields(json!({"success": true, "server_id": "srv-9"}))),
        );
        let r = AuthResponse::from_packet(&ok);
        assert!(r.success);
        assert_eq!(r.server_id, "srv-9");

        let denied = Packet::new(
            PacketKind::Rpc,
            None,
            Some(fields(json!({"success": false, "message": "bad token"}))),
        );
        let r = AuthResponse::from_packet(&denied);
        assert!(!r.success);
        assert_eq!(r.message, "bad token");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(PacketKind::parse("RPC"), Ok(PacketKind::Rpc));
        assert!(PacketKind::parse("rpc").is_err());
        assert!(PacketKind::parse("STREAM").is_err());
    }
}
