//! Error types shared across the zetian crates.

use std::io;

use thiserror::Error;

/// Errors that can occur while parsing a mailbox address.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The address was empty or whitespace only.
    #[error("Empty address")]
    Empty,

    /// The address did not parse as an RFC 5321 mailbox.
    #[error("Invalid address {0:?}: {1}")]
    Invalid(String, String),

    /// RFC 5322 group syntax is not a valid path.
    #[error("Group syntax is not a valid mail path: {0:?}")]
    Group(String),
}

/// Errors that can occur during session handling.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Protocol error occurred during the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The client exceeded one of the session timers.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Errors that can occur in the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to the socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),

    /// Configuration rejected at startup.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while validating server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration field is missing.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A configuration value is invalid.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// I/O error during validation (e.g. reading TLS material).
    #[error("I/O error during validation: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn session_error_classification() {
        let err = SessionError::Shutdown;
        assert!(err.is_shutdown());
        assert!(!err.is_client_error());

        let err = SessionError::Protocol("Invalid command".to_string());
        assert!(!err.is_shutdown());
        assert!(err.is_client_error());

        let err = SessionError::Timeout(30);
        assert!(err.is_client_error());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::MissingField("certificate");
        assert_eq!(err.to_string(), "Missing required field: certificate");

        let err = ConfigError::InvalidConfiguration {
            field: "port".to_string(),
            reason: "must be between 1-65535".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration for port: must be between 1-65535"
        );
    }

    #[test]
    fn error_source_chain() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let bind_err = ListenerError::BindFailed {
            address: "0.0.0.0:25".to_string(),
            source: io_err,
        };

        assert!(bind_err.source().is_some());
        assert_eq!(
            bind_err.to_string(),
            "Failed to bind to 0.0.0.0:25: access denied"
        );
    }
}
