//! Shared error types for the Kite system.

use thiserror::Error;

/// Top-level error type for the Kite system.
#[derive(Error, Debug)]
pub enum KiteError {
    /// No peer with the requested kite name is known.
    #[error("kite {0} does not exist")]
    NoSuchKite(String),

    /// Kontrol refused the registration request.
    #[error("no permission to run")]
    RegistrationDenied,

    /// Kontrol answered with something we do not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The messenger could not deliver a request to Kontrol.
    #[error("Messenger error: {0}")]
    Messenger(String),

    /// The RPC listener could not be bound.
    #[error("RPC server could not be initialized on {addr}: {reason}")]
    Bind {
        /// Requested listen address.
        addr: String,
        /// Underlying failure.
        reason: String,
    },

    /// Dialing or talking to a peer failed at the transport level.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote peer executed the call and returned an error.
    #[error("[{kite}] call error: {message}")]
    Call {
        /// Kite name of the target group.
        kite: String,
        /// Error text returned by the remote method.
        message: String,
    },

    /// An asynchronous call did not complete in time.
    #[error("[{kite}] call to {method} timed out after {secs}s")]
    Timeout {
        /// Kite name of the target group.
        kite: String,
        /// Method that was called.
        method: String,
        /// Timeout that elapsed.
        secs: u64,
    },

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl KiteError {
    /// Whether this error must stop the node (it can no longer participate).
    pub fn is_fatal(&self) -> bool {
        matches!(self, KiteError::Bind { .. } | KiteError::Config(_))
    }
}

impl From<serde_json::Error> for KiteError {
    fn from(e: serde_json::Error) -> Self {
        KiteError::Serialization(e.to_string())
    }
}

/// Alias for results in the Kite system.
pub type KiteResult<T> = Result<T, KiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_names_target() {
        let err = KiteError::Call {
            kite: "devrim/fs".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "[devrim/fs] call error: boom");
    }

    #[test]
    fn test_fatal_classification() {
        let bind = KiteError::Bind {
            addr: "127.0.0.1:1".to_string(),
            reason: "in use".to_string(),
        };
        assert!(bind.is_fatal());
        assert!(!KiteError::NoSuchKite("a/b".to_string()).is_fatal());
        assert!(!KiteError::RegistrationDenied.is_fatal());
    }
}
