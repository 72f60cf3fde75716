//! Error handling for the MQTT transport.
//!
//! `TransferError` is the single error type returned by every fallible
//! operation in this crate. The variants fall into three groups:
//!
//! **Setup errors** (caught at startup):
//! - `ClientSetup`: TLS material missing, malformed options
//! - `ConfigError`: validation failures in [`Config`](crate::Config)
//! - `Io`: certificate files that cannot be read
//!
//! **Connection errors** (network level, see [`TransferError::is_connection_error`]):
//! - `Connection`: the broker could not be reached or refused the session
//! - `ClientConnection`: raw event loop failure from rumqttc
//! - `ClientTransfer`: the request channel to the event loop is closed
//! - `Timeout`: connect or wait deadline elapsed
//! - `NotConnected`: an operation that needs a live session was called without one
//!
//! **Encoding errors**:
//! - `Serialization`: a payload could not be serialized or compressed
//!
//! Malformed inbound payloads never surface here. [`codec::decode`](crate::codec::decode)
//! absorbs them into a tagged `_raw` document instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The broker was unreachable, refused the CONNECT, or the session dropped
    /// before the operation completed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A deadline elapsed: either connecting to the broker or waiting for a
    /// response on a feedback leaf.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An operation requiring an established session was called while the
    /// transport was disconnected.
    #[error("Not connected to MQTT broker, call connect() first")]
    NotConnected,

    /// MQTT client initialization failed (TLS paths, options).
    ///
    /// # Example
    /// ```ignore
    /// // ClientSetup("Invalid TLS configuration: File does not exist: /etc/yardlink/ca.crt")
    /// ```
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The request channel to the event loop is closed, usually because the
    /// connection kernel is shutting down.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// Reconnect attempts exhausted.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Returns `true` for network-level failures, including timeouts.
    ///
    /// Callers that fail over between brokers use this to decide whether the
    /// next candidate is worth trying.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransferError::Connection(_)
                | TransferError::Timeout(_)
                | TransferError::NotConnected
                | TransferError::ClientTransfer(_)
                | TransferError::ClientConnection(_)
                | TransferError::RetriesPolicy(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout(_))
    }
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
        let err = TransferError::Timeout("no ack for get_controller".into());
        assert_eq!(err.to_string(), "Timeout: no ack for get_controller");
    }

    #[test]
    fn test_not_connected_display() {
        assert!(TransferError::NotConnected
            .to_string()
            .contains("call connect() first"));
    }

    #[test]
    fn test_transfer_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let transfer_err: TransferError = io_err.into();
        assert!(transfer_err.to_string().contains("file not found"));
        assert!(!transfer_err.is_connection_error());
    }

    #[test]
    fn test_connection_family() {
        assert!(TransferError::Connection("refused".into()).is_connection_error());
        assert!(TransferError::Timeout("connect".into()).is_connection_error());
        assert!(TransferError::NotConnected.is_connection_error());
        assert!(!TransferError::Serialization("x".into()).is_connection_error());
        assert!(!TransferError::ClientSetup("tls".into()).is_connection_error());
    }

    #[test]
    fn test_timeout_is_specialization() {
        let err = TransferError::Timeout("connect".into());
        assert!(err.is_timeout());
        assert!(err.is_connection_error());
        assert!(!TransferError::Connection("refused".into()).is_timeout());
    }

    #[test]
    fn test_transfer_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(TransferError::Serialization("test".into()));
        assert_eq!(err.to_string(), "Serialization error: test");
    }
}
