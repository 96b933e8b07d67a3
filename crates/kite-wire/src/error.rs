//! Errors from the wire layer.

use kite_types::error::KiteError;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// The remote method ran and returned an error.
    #[error("{0}")]
    Remote(String),
}

impl WireError {
    /// True when the connection itself is unusable, as opposed to the remote
    /// method returning an error over a healthy connection.
    pub fn is_transport(&self) -> bool {
        !matches!(self, WireError::Remote(_))
    }
}

impl From<WireError> for KiteError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Bind { addr, source } => KiteError::Bind {
                addr,
                reason: source.to_string(),
            },
            WireError::Json(e) => KiteError::Serialization(e.to_string()),
            WireError::Encode(e) => KiteError::Serialization(e.to_string()),
            WireError::Decode(e) => KiteError::Serialization(e.to_string()),
            other => KiteError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_errors_are_not_transport_errors() {
        assert!(!WireError::Remote("bad args".into()).is_transport());
        assert!(WireError::ConnectionClosed.is_transport());
        assert!(WireError::HandshakeFailed("x".into()).is_transport());
    }

    #[test]
    fn test_bind_maps_to_fatal_kite_error() {
        let err: KiteError = WireError::Bind {
            addr: "127.0.0.1:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        }
        .into();
        assert!(err.is_fatal());
    }
}
