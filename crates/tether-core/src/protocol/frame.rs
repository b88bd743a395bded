//! Length-prefixed framing (panic-free).
//!
//! Frame: `[u32 big-endian length N][N bytes body]`, `0 < N <= max`.
//!
//! Parsing rules:
//! - Never index (`buf[0]`); always go through `Buf` and `remaining()` checks.
//! - An invalid length is a protocol violation; the stream is never resynchronized.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TetherError};
use crate::packet::Packet;
use crate::protocol::json::{decode_packet, encode_packet};

/// Size of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default upper bound on a frame body (10 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

fn check_len(len: usize, max_frame_bytes: usize) -> Result<()> {
    if len == 0 {
        return Err(TetherError::Protocol("empty frame".into()));
    }
    if len > max_frame_bytes {
        return Err(TetherError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {max_frame_bytes}"
        )));
    }
    Ok(())
}

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8], max_frame_bytes: usize) -> Result<Bytes> {
    check_len(body.len(), max_frame_bytes)?;
    let len = u32::try_from(body.len())
        .map_err(|_| TetherError::Protocol("frame length overflows u32".into()))?;

    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    out.put_u32(len);
    out.put_slice(body);
    Ok(out.freeze())
}

/// Split one complete frame body off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. The length is validated as
/// soon as the prefix is available, before the body arrives.
pub fn decode_frame(buf: &mut BytesMut, max_frame_bytes: usize) -> Result<Option<Bytes>> {
    if buf.remaining() < LENGTH_PREFIX_BYTES {
        return Ok(None);
    }

    let mut peek: &[u8] = buf.as_ref();
    let len = peek.get_u32() as usize;
    check_len(len, max_frame_bytes)?;

    if buf.remaining() < LENGTH_PREFIX_BYTES + len {
        buf.reserve(LENGTH_PREFIX_BYTES + len - buf.remaining());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_BYTES);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Encode a packet straight into a frame.
pub fn frame_packet(packet: &Packet, max_frame_bytes: usize) -> Result<Bytes> {
    let body = encode_packet(packet)?;
    encode_frame(&body, max_frame_bytes)
}

/// Decode the next packet from `buf`, if a whole frame is buffered.
pub fn next_packet(buf: &mut BytesMut, max_frame_bytes: usize) -> Result<Option<Packet>> {
    match decode_frame(buf, max_frame_bytes)? {
        Some(body) => decode_packet(&body).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::packet::Fields;

    #[test]
    fn partial_prefix_waits() {
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(decode_frame(&mut buf, 16).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_body_waits_then_completes() {
        let frame = encode_frame(b"hello", 16).unwrap();
        let mut buf = BytesMut::from(&frame[..6]);
        assert!(decode_frame(&mut buf, 16).unwrap().is_none());
        buf.extend_from_slice(&frame[6..]);
        let body = decode_frame(&mut buf, 16).unwrap().unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_and_oversized_lengths_are_protocol_errors() {
        let mut zero = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert_eq!(decode_frame(&mut zero, 16).unwrap_err().code().as_str(), "PROTOCOL");

        let mut big = BytesMut::from(&[0u8, 0, 0, 17][..]);
        assert_eq!(decode_frame(&mut big, 16).unwrap_err().code().as_str(), "PROTOCOL");

        assert!(encode_frame(&[0u8; 17], 16).is_err());
        assert!(encode_frame(b"", 16).is_err());
    }

    #[test]
    fn back_to_back_frames() {
        let a = Packet::event("a", Fields::new());
        let b = Packet::event("b", Fields::new());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame_packet(&a, DEFAULT_MAX_FRAME_BYTES).unwrap());
        buf.extend_from_slice(&frame_packet(&b, DEFAULT_MAX_FRAME_BYTES).unwrap());

        assert_eq!(next_packet(&mut buf, DEFAULT_MAX_FRAME_BYTES).unwrap(), Some(a));
        assert_eq!(next_packet(&mut buf, DEFAULT_MAX_FRAME_BYTES).unwrap(), Some(b));
        assert_eq!(next_packet(&mut buf, DEFAULT_MAX_FRAME_BYTES).unwrap(), None);
    }
}
