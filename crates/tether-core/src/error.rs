//! Shared error type across tether crates.

use thiserror::Error;

/// Stable error codes (used in logs, RPC error payloads and test vectors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Socket could not be established or broke.
    Connection,
    /// Malformed or oversized frame.
    Protocol,
    /// Outgoing queue stayed full past the offer timeout.
    QueueSaturated,
    /// No live connection to send on.
    NotConnected,
    /// Response without a matching pending request.
    CorrelationNotFound,
    /// A pending request with this id already exists.
    DuplicateCorrelation,
    /// Request exceeded its deadline.
    Timeout,
    /// Backend explicitly denied the credential.
    AuthRejected,
    /// Packet blocked by the authentication gate.
    Gated,
    /// Invalid configuration.
    Config,
    /// Unsupported config or protocol version.
    UnsupportedVersion,
    /// Internal error.
    Internal,
}

impl ErrorCode {
    /// String representation used in logs and error payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Connection => "CONNECTION",
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::QueueSaturated => "QUEUE_SATURATED",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::CorrelationNotFound => "CORRELATION_NOT_FOUND",
            ErrorCode::DuplicateCorrelation => "DUPLICATE_CORRELATION",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::AuthRejected => "AUTH_REJECTED",
            ErrorCode::Gated => "GATED",
            ErrorCode::Config => "CONFIG",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, TetherError>;

/// Unified error type used by core and agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TetherError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("outgoing queue saturated, packet dropped")]
    QueueSaturated,
    #[error("not connected")]
    NotConnected,
    #[error("no pending request for correlation id {0}")]
    CorrelationNotFound(String),
    #[error("pending request already registered for id {0}")]
    DuplicateCorrelation(String),
    #[error("request timed out")]
    Timeout,
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    #[error("packet blocked by auth gate: {0}")]
    Gated(&'static str),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("unsupported version")]
    UnsupportedVersion,
    #[error("internal: {0}")]
    Internal(String),
}

impl TetherError {
    /// Map to a stable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            TetherError::Connection(_) => ErrorCode::Connection,
            TetherError::Protocol(_) => ErrorCode::Protocol,
            TetherError::QueueSaturated => ErrorCode::QueueSaturated,
            TetherError::NotConnected => ErrorCode::NotConnected,
            TetherError::CorrelationNotFound(_) => ErrorCode::CorrelationNotFound,
            TetherError::DuplicateCorrelation(_) => ErrorCode::DuplicateCorrelation,
            TetherError::Timeout => ErrorCode::Timeout,
            TetherError::AuthenticationRejected(_) => ErrorCode::AuthRejected,
            TetherError::Gated(_) => ErrorCode::Gated,
            TetherError::Config(_) => ErrorCode::Config,
            TetherError::UnsupportedVersion => ErrorCode::UnsupportedVersion,
            TetherError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the error means the stream can no longer be trusted.
    /// The transport tears the session down on these; everything else is per-packet.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, TetherError::Connection(_) | TetherError::Protocol(_))
    }
}

impl From<std::io::Error> for TetherError {
    fn from(e: std::io::Error) -> Self {
        TetherError::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(TetherError::Connection("reset".into()).is_fatal_to_connection());
        assert!(TetherError::Protocol("oversized".into()).is_fatal_to_connection());
        assert!(!TetherError::QueueSaturated.is_fatal_to_connection());
        assert!(!TetherError::Timeout.is_fatal_to_connection());
        assert!(!TetherError::AuthenticationRejected("bad token".into()).is_fatal_to_connection());
    }

    #[test]
    fn io_errors_become_connection_errors() {
        let e: TetherError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(e.code(), ErrorCode::Connection);
        assert_eq!(e.code().as_str(), "CONNECTION");
    }
}
