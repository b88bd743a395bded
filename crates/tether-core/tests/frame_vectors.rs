//! Frame + packet decoding vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;

use bytes::BytesMut;

use tether_core::protocol::{next_packet, DEFAULT_MAX_FRAME_BYTES};

mod vector_loader;
use vector_loader::TestVector;

fn load(name: &str) -> TestVector {
    let s = fs::read_to_string(format!("tests/vectors/{name}")).unwrap();
    serde_json::from_str(&s).unwrap()
}

#[test]
fn frame_vectors() {
    let files = [
        "event_ok.json",
        "rpc_response_ok.json",
        "rpc_request_no_payload.json",
        "unknown_kind.json",
        "missing_kind.json",
        "zero_length.json",
        "oversized.json",
        "not_json.json",
    ];

    for f in files {
        let v = load(f);
        let mut buf = BytesMut::from(&v.frame.decode()[..]);
        let res = next_packet(&mut buf, DEFAULT_MAX_FRAME_BYTES);

        if let Some(err) = v.expect_error {
            let e = res.expect_err("expected error");
            assert_eq!(e.code().as_str(), err.code, "vector={}", v.description);
            continue;
        }

        let packet = res
            .expect("expected ok frame")
            .expect("expected a complete frame");
        let ex = v.expect.expect("missing expect block");

        assert_eq!(packet.id(), ex["packet_id"].as_str().unwrap(), "vector={}", v.description);
        assert_eq!(packet.kind().as_str(), ex["kind"].as_str().unwrap(), "vector={}", v.description);
        assert_eq!(packet.action(), ex["action"].as_str().unwrap(), "vector={}", v.description);
        assert_eq!(packet.correlation_id(), ex["correlation_id"].as_str(), "vector={}", v.description);
        assert_eq!(packet.timestamp(), ex["timestamp"].as_u64().unwrap(), "vector={}", v.description);
        assert_eq!(packet.payload().len() as u64, ex["payload_keys"].as_u64().unwrap(), "vector={}", v.description);
        assert!(buf.is_empty(), "vector={}", v.description);
    }
}
