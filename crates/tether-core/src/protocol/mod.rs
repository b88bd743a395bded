//! Wire protocol: JSON packet bodies inside length-prefixed frames.
//!
//! - `json`: total encode / strict-kind decode of the packet envelope.
//! - `frame`: 4-byte big-endian length prefix framing over a byte buffer.
//!
//! All parsers are panic-free: malformed input is reported as
//! `TetherError::Protocol` instead of panicking or indexing raw buffers.

pub mod frame;
pub mod json;

pub use frame::{
    decode_frame, encode_frame, frame_packet, next_packet, DEFAULT_MAX_FRAME_BYTES,
    LENGTH_PREFIX_BYTES,
};
pub use json::{decode_packet, encode_packet};
