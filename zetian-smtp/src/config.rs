use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use serde::Deserialize;
use zetian_common::error::ConfigError;

/// TLS material and policy for STARTTLS or implicit TLS.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    /// PEM certificate chain.
    pub certificate: PathBuf,
    /// PEM private key (PKCS1, PKCS8 or SEC1).
    pub key: PathBuf,
    /// Acceptable protocol versions. Empty means the rustls defaults.
    #[serde(default)]
    pub protocols: Vec<TlsVersion>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    #[serde(alias = "tlsv1.2", alias = "tls1.2")]
    Tls12,
    #[serde(alias = "tlsv1.3", alias = "tls1.3")]
    Tls13,
}

/// Per-session timers, all in seconds.
///
/// These follow the RFC 5321 section 4.5.3.2 recommendations: the command
/// timer bounds the wait for one complete command line, the data timer
/// bounds each read during body reception, and the connection timer bounds
/// the whole session (0 disables it).
#[derive(Clone, Debug, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    #[serde(default = "default_connection_timeout")]
    pub connection_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            connection_secs: default_connection_timeout(),
        }
    }
}

const fn default_command_timeout() -> u64 {
    300 // 5 minutes per RFC 5321
}

const fn default_data_timeout() -> u64 {
    180 // 3 minutes per RFC 5321
}

const fn default_connection_timeout() -> u64 {
    1800 // 30 minutes
}

/// Everything an embedding application can tune on one listener.
///
/// Assemble directly, through [`ServerConfig::builder`], or deserialize
/// from the application's own configuration format; then let
/// [`ServerConfig::validate`] normalize and sanity-check the result.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub address: IpAddr,
    /// Listen port. 0 binds an ephemeral port.
    pub port: u16,
    /// Name advertised in the banner, EHLO response and trace headers.
    pub server_name: String,
    /// Override for the 220 banner text.
    pub banner: Option<String>,
    /// Override for the first EHLO response line.
    pub greeting: Option<String>,

    /// SIZE cap in bytes; 0 means unlimited.
    pub max_message_size: usize,
    /// Recipient cap per transaction.
    pub max_recipients: usize,
    /// Global concurrent-session cap; 0 means unlimited.
    pub max_connections: usize,
    /// Per-address concurrent-session cap; 0 means unlimited.
    pub max_connections_per_ip: usize,
    /// Consecutive non-2xx/3xx replies tolerated before the session is
    /// dropped with 421.
    pub max_retry_count: u32,

    pub timeouts: Timeouts,
    /// How long graceful shutdown waits for sessions to finish.
    pub shutdown_grace_secs: u64,

    pub pipelining: bool,
    pub eight_bit_mime: bool,
    pub binary_mime: bool,
    pub chunking: bool,
    pub smtp_utf8: bool,
    pub size_extension: bool,

    /// Refuse MAIL FROM until the session has authenticated.
    pub require_authentication: bool,
    /// Refuse everything but EHLO/HELO/STARTTLS/NOOP/QUIT until the
    /// session is secure.
    pub require_secure_connection: bool,
    /// Permit PLAIN/LOGIN over an unencrypted transport.
    pub allow_plaintext_authentication: bool,

    /// Handshake at accept time instead of via STARTTLS (port 465 usage).
    pub implicit_tls: bool,
    pub tls: Option<TlsContext>,

    /// SASL mechanisms to advertise and accept, uppercased.
    pub mechanisms: Vec<String>,

    /// Echo collaborator failure detail to clients instead of a generic
    /// phrase.
    pub detailed_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 25,
            server_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            banner: None,
            greeting: None,
            max_message_size: 0,
            max_recipients: 100,
            max_connections: 0,
            max_connections_per_ip: 0,
            max_retry_count: 5,
            timeouts: Timeouts::default(),
            shutdown_grace_secs: 10,
            pipelining: true,
            eight_bit_mime: true,
            binary_mime: false,
            chunking: true,
            smtp_utf8: false,
            size_extension: true,
            require_authentication: false,
            require_secure_connection: false,
            allow_plaintext_authentication: false,
            implicit_tls: false,
            tls: None,
            mechanisms: vec!["PLAIN".to_string(), "LOGIN".to_string()],
            detailed_errors: false,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    #[must_use]
    pub const fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Normalize and sanity-check the configuration.
    ///
    /// BINARYMIME requires CHUNKING, so the latter is switched on when
    /// needed. TLS material is checked for existence here rather than at
    /// the first handshake.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.mechanisms = self
            .mechanisms
            .iter()
            .map(|mechanism| mechanism.to_ascii_uppercase())
            .collect();

        if self.binary_mime && !self.chunking {
            self.chunking = true;
        }

        if self.max_retry_count == 0 {
            return Err(ConfigError::InvalidConfiguration {
                field: "max_retry_count".to_string(),
                reason: "must tolerate at least one error".to_string(),
            });
        }

        if self.server_name.is_empty() {
            return Err(ConfigError::MissingField("server_name"));
        }

        if (self.implicit_tls || self.require_secure_connection) && self.tls.is_none() {
            return Err(ConfigError::MissingField("tls"));
        }

        if let Some(tls) = self.tls.as_ref() {
            if !tls.certificate.try_exists()? {
                return Err(ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "Unable to find TLS Certificate {}",
                        tls.certificate.display()
                    ),
                )));
            }

            if !tls.key.try_exists()? {
                return Err(ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Unable to find TLS Key {}", tls.key.display()),
                )));
            }
        }

        Ok(())
    }
}

/// Ergonomic sugar over [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    #[must_use]
    pub const fn with_address(mut self, address: IpAddr) -> Self {
        self.config.address = address;
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.config.server_name = server_name.into();
        self
    }

    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = Some(banner.into());
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, recipients: usize) -> Self {
        self.config.max_recipients = recipients;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, connections: usize) -> Self {
        self.config.max_connections = connections;
        self
    }

    #[must_use]
    pub const fn with_max_connections_per_ip(mut self, connections: usize) -> Self {
        self.config.max_connections_per_ip = connections;
        self
    }

    #[must_use]
    pub const fn with_max_retry_count(mut self, count: u32) -> Self {
        self.config.max_retry_count = count;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    #[must_use]
    pub const fn with_pipelining(mut self, enabled: bool) -> Self {
        self.config.pipelining = enabled;
        self
    }

    #[must_use]
    pub const fn with_eight_bit_mime(mut self, enabled: bool) -> Self {
        self.config.eight_bit_mime = enabled;
        self
    }

    #[must_use]
    pub const fn with_binary_mime(mut self, enabled: bool) -> Self {
        self.config.binary_mime = enabled;
        self
    }

    #[must_use]
    pub const fn with_chunking(mut self, enabled: bool) -> Self {
        self.config.chunking = enabled;
        self
    }

    #[must_use]
    pub const fn with_smtp_utf8(mut self, enabled: bool) -> Self {
        self.config.smtp_utf8 = enabled;
        self
    }

    #[must_use]
    pub const fn with_size_extension(mut self, enabled: bool) -> Self {
        self.config.size_extension = enabled;
        self
    }

    #[must_use]
    pub const fn with_require_authentication(mut self, required: bool) -> Self {
        self.config.require_authentication = required;
        self
    }

    #[must_use]
    pub const fn with_require_secure_connection(mut self, required: bool) -> Self {
        self.config.require_secure_connection = required;
        self
    }

    #[must_use]
    pub const fn with_allow_plaintext_authentication(mut self, allowed: bool) -> Self {
        self.config.allow_plaintext_authentication = allowed;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.config.tls = Some(tls);
        self
    }

    #[must_use]
    pub const fn with_implicit_tls(mut self, implicit: bool) -> Self {
        self.config.implicit_tls = implicit;
        self
    }

    #[must_use]
    pub fn with_mechanisms(mut self, mechanisms: Vec<String>) -> Self {
        self.config.mechanisms = mechanisms;
        self
    }

    #[must_use]
    pub const fn with_detailed_errors(mut self, detailed: bool) -> Self {
        self.config.detailed_errors = detailed;
        self
    }

    #[must_use]
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
