//! Error types for the SMTP server engine.

use std::io;

use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by the peer.
    #[error("Connection closed by peer")]
    Closed,

    /// A command line exceeded the 512-octet limit. The line has been
    /// consumed; the session may continue.
    #[error("Command line too long")]
    LineTooLong,
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load the TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load the TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Negotiated connection details were unavailable.
    #[error("TLS connection info missing: {0}")]
    ProtocolInfoMissing(String),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        assert_eq!(
            ConnectionError::Closed.to_string(),
            "Connection closed by peer"
        );
        assert_eq!(
            ConnectionError::LineTooLong.to_string(),
            "Command line too long"
        );
    }

    #[test]
    fn tls_error_display() {
        let err = TlsError::KeyLoad {
            path: "/path/to/key.pem".to_string(),
            reason: "invalid format".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to load TLS private key from /path/to/key.pem: invalid format"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let conn_err: ConnectionError = io_err.into();
        assert!(matches!(conn_err, ConnectionError::Io(_)));
    }
}
