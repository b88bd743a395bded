//! Packet body (JSON).
//!
//! Shape: `{"packet_id", "packet_type", "metadata", "payload", "timestamp"}`.
//! Decoding tolerates missing optional keys; `packet_type` is mandatory.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TetherError};
use crate::packet::{new_packet_id, now_secs, Fields, Packet, PacketKind};

#[derive(Serialize)]
struct WireOut<'a> {
    packet_id: &'a str,
    packet_type: &'static str,
    metadata: &'a Fields,
    payload: &'a Fields,
    timestamp: u64,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(default)]
    packet_id: Option<String>,
    #[serde(default)]
    packet_type: Option<String>,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: Option<u64>,
}

/// Serialize a packet to its UTF-8 JSON body.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
    let wire = WireOut {
        packet_id: packet.id(),
        packet_type: packet.kind().as_str(),
        metadata: packet.metadata(),
        payload: packet.payload(),
        timestamp: packet.timestamp(),
    };
    serde_json::to_vec(&wire).map_err(|e| TetherError::Internal(format!("json encode failed: {e}")))
}

/// Parse a JSON body into a packet.
///
/// Non-object `metadata`/`payload` become empty maps, a missing timestamp
/// becomes "now" and a missing id gets a fresh one. A missing or unknown
/// `packet_type` is a protocol error.
pub fn decode_packet(body: &[u8]) -> Result<Packet> {
    let wire: WireIn = serde_json::from_slice(body)
        .map_err(|e| TetherError::Protocol(format!("invalid packet json: {e}")))?;

    let kind = match wire.packet_type.as_deref() {
        Some(s) => PacketKind::parse(s)?,
        None => return Err(TetherError::Protocol("missing packet_type".into())),
    };

    Ok(Packet::from_parts(
        wire.packet_id.unwrap_or_else(new_packet_id),
        kind,
        into_fields(wire.metadata),
        into_fields(wire.payload),
        wire.timestamp.unwrap_or_else(now_secs),
    ))
}

fn into_fields(v: Value) -> Option<Fields> {
    match v {
        Value::Object(m) => Some(m),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn decode_fills_defaults() {
        let p = decode_packet(br#"{"packet_type":"EVENT"}"#).unwrap();
        assert!(p.is_event());
        assert!(p.metadata().is_empty());
        assert!(p.payload().is_empty());
        assert!(!p.id().is_empty());
        assert!(p.timestamp() > 0);
    }

    #[test]
    fn decode_rejects_missing_kind() {
        let err = decode_packet(br#"{"packet_id":"a","payload":{}}"#).unwrap_err();
        assert_eq!(err.code().as_str(), "PROTOCOL");
    }

    #[test]
    fn non_object_maps_become_empty() {
        let p = decode_packet(br#"{"packet_type":"RPC","metadata":[1,2],"payload":"x"}"#).unwrap();
        assert!(p.metadata().is_empty());
        assert!(p.payload().is_empty());
    }

    #[test]
    fn encode_uses_wire_names() {
        let p = Packet::request("ping", Fields::new());
        let body = encode_packet(&p).unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["packet_id"], json!(p.id()));
        assert_eq!(v["packet_type"], json!("RPC"));
        assert_eq!(v["metadata"]["action"], json!("ping"));
        assert_eq!(v["timestamp"], json!(p.timestamp()));
    }
}
