//! Error type for the MQTT transport.
//!
//! Setup problems (`ClientSetup`, `ConfigError`, `Io`) surface when a session
//! is built; `ClientTransfer` and `ClientConnection` surface while a session
//! is pumped or used for publishing. The agent treats every runtime variant
//! the same way: log it and drop the session so the next tick reconnects.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// A publish topic was empty or contained wildcards.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// The client could not be built (TLS material, options).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// `Config` failed validation.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The request could not be queued for the event loop.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// The event loop reported a network or protocol failure.
    ///
    /// Boxed because `rumqttc::ConnectionError` is large.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// Reading TLS material from disk failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::InvalidTopic("topic must not be empty".into());
        assert_eq!(err.to_string(), "Invalid topic: topic must not be empty");
    }

    #[test]
    fn test_transfer_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let transfer_err: TransferError = io_err.into();
        assert!(matches!(transfer_err, TransferError::Io(_)));
        assert!(transfer_err.to_string().contains("file not found"));
    }

    #[test]
    fn test_connection_error_is_boxed() {
        let err: TransferError = rumqttc::ConnectionError::NetworkTimeout.into();
        assert!(matches!(err, TransferError::ClientConnection(_)));
    }

    #[test]
    fn test_transfer_error_is_std_error() {
        let err: Box<dyn std::error::Error + Send + Sync> =
            Box::new(TransferError::ClientSetup("no ca".into()));
        assert_eq!(err.to_string(), "Client setup error: no ca");
    }
}
