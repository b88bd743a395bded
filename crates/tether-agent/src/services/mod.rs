//! Built-in services registered by the binary.

pub mod ping;

pub use ping::PingService;
