use core::fmt::{self, Display, Formatter};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the client introduced itself. `Ehlo` unlocks the extended dialect.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Greeting {
    #[default]
    None,
    Helo(String),
    Ehlo(String),
}

impl Greeting {
    /// The domain the client greeted with, if it has greeted at all.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Helo(domain) | Self::Ehlo(domain) => Some(domain),
        }
    }

    /// Whether EHLO was used, enabling ESMTP extensions.
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        matches!(self, Self::Ehlo(_))
    }
}

impl Display for Greeting {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "",
            Self::Helo(_) => "HELO",
            Self::Ehlo(_) => "EHLO",
        })
    }
}

/// A read-only snapshot of one session, handed to collaborators (message
/// stores, mailbox filters, event listeners) alongside their payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Process-unique session identifier, stable for the connection lifetime.
    pub id: u64,
    /// Remote endpoint of the connection.
    pub peer: SocketAddr,
    /// Local endpoint the connection was accepted on.
    pub local: SocketAddr,
    /// When the connection was accepted.
    pub accepted_at: DateTime<Utc>,
    /// Whether the transport is TLS (implicit or via STARTTLS).
    pub secure: bool,
    /// Negotiated TLS protocol version, when secure.
    pub tls_protocol: Option<String>,
    /// Negotiated TLS cipher suite, when secure.
    pub tls_cipher: Option<String>,
    /// Authenticated identity, once AUTH has succeeded.
    pub authenticated: Option<String>,
    /// Client greeting state.
    pub greeting: Greeting,
}

impl SessionInfo {
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated.is_some()
    }

    /// The protocol token recorded in trace headers: `SMTP` for HELO
    /// sessions, `ESMTP` with `S`/`A` markers for TLS and AUTH.
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        match (
            self.greeting.is_extended(),
            self.secure,
            self.is_authenticated(),
        ) {
            (false, _, _) => "SMTP",
            (true, false, false) => "ESMTP",
            (true, true, false) => "ESMTPS",
            (true, false, true) => "ESMTPA",
            (true, true, true) => "ESMTPSA",
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Greeting, SessionInfo};

    fn info() -> SessionInfo {
        SessionInfo {
            id: 1,
            peer: "127.0.0.1:52000".parse().unwrap(),
            local: "127.0.0.1:25".parse().unwrap(),
            accepted_at: chrono::Utc::now(),
            secure: false,
            tls_protocol: None,
            tls_cipher: None,
            authenticated: None,
            greeting: Greeting::Ehlo("client.test".to_string()),
        }
    }

    #[test]
    fn greeting_domain() {
        assert_eq!(Greeting::None.domain(), None);
        assert_eq!(
            Greeting::Helo("a.example".to_string()).domain(),
            Some("a.example")
        );
        assert!(Greeting::Ehlo("a.example".to_string()).is_extended());
    }

    #[test]
    fn protocol_tokens() {
        let mut info = info();
        assert_eq!(info.protocol(), "ESMTP");

        info.secure = true;
        assert_eq!(info.protocol(), "ESMTPS");

        info.authenticated = Some("alice".to_string());
        assert_eq!(info.protocol(), "ESMTPSA");

        info.secure = false;
        assert_eq!(info.protocol(), "ESMTPA");

        info.greeting = Greeting::Helo("a".to_string());
        assert_eq!(info.protocol(), "SMTP");
    }
}
