use std::net::IpAddr;

use thiserror::Error;

// ---------------------------------------------------------------------------
// RTMP protocol errors
// ---------------------------------------------------------------------------

/// Errors raised while parsing or validating RTMP wire data.
///
/// These are always fatal to the session that produced them; the relay never
/// tries to resynchronize a corrupted chunk stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid peer version {0:#04x}, expected 0x03")]
    InvalidVersion(u8),

    #[error("amf: unsupported or invalid marker {0:#04x}")]
    InvalidMarker(u8),

    #[error("amf: value limit exceeded")]
    ValueLimit,

    #[error("amf: string too long")]
    StringTooLong,

    #[error("amf: object key limit exceeded")]
    ObjectKeyLimit,

    #[error("amf: truncated value")]
    Truncated,

    #[error("empty AMF3 payload")]
    EmptyAmf3,

    #[error("unsupported AMF3 payload")]
    UnsupportedAmf3,

    #[error("expected 'connect' command, got {0:?}")]
    ExpectedConnect(String),

    #[error("empty command message")]
    EmptyCommand,

    #[error("expected command message (type 17 or 20), got type {0}")]
    UnexpectedMessageType(u8),
}

// ---------------------------------------------------------------------------
// Relay errors
// ---------------------------------------------------------------------------

/// Top-level error for the relay engine.
///
/// Each variant is a distinct failure class so callers (and metrics) can
/// distinguish admission denials from protocol violations from upstream
/// trouble without string matching.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("rtmp: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limit exceeded for {0}")]
    RateLimited(IpAddr),

    #[error("connection limit: {0}")]
    ConnectionLimit(String),

    #[error("upstream selection: {0}")]
    UpstreamSelect(String),

    #[error("dial upstream: {0}")]
    UpstreamDial(String),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    /// True for graceful-shutdown terminations that should not be logged as
    /// session failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }

    /// Short stable label used as a metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Io(_) => "io",
            RelayError::Protocol(_) => "protocol",
            RelayError::Auth(_) => "auth",
            RelayError::RateLimited(_) => "rate_limit",
            RelayError::ConnectionLimit(_) => "connection_limit",
            RelayError::UpstreamSelect(_) => "upstream_select",
            RelayError::UpstreamDial(_) => "upstream_dial",
            RelayError::CircuitOpen => "circuit_open",
            RelayError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinct() {
        let errs = [
            RelayError::Config("x".into()),
            RelayError::Auth("x".into()),
            RelayError::RateLimited("1.1.1.1".parse().unwrap()),
            RelayError::ConnectionLimit("x".into()),
            RelayError::UpstreamSelect("x".into()),
            RelayError::UpstreamDial("x".into()),
            RelayError::CircuitOpen,
            RelayError::Cancelled,
        ];
        let mut kinds: Vec<&str> = errs.iter().map(|e| e.kind()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), errs.len());
    }

    #[test]
    fn test_cancelled_predicate() {
        assert!(RelayError::Cancelled.is_cancelled());
        assert!(!RelayError::CircuitOpen.is_cancelled());
    }
}
