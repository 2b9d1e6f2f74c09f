use core::fmt::{self, Display};

use crate::config::ServerConfig;

/// ESMTP keywords advertised in the EHLO response.
///
/// Each value renders as exactly one EHLO line. Assembly is state-aware:
/// what gets advertised depends on the configuration *and* on the session's
/// current security and authentication state (see [`advertised`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// PIPELINING (RFC 2920) - client may batch commands.
    Pipelining,

    /// 8BITMIME (RFC 1652) - bodies may contain octets above 0x7F.
    EightBitMime,

    /// BINARYMIME (RFC 3030) - unencoded binary bodies; requires CHUNKING.
    BinaryMime,

    /// CHUNKING (RFC 3030) - the BDAT alternative to DATA.
    Chunking,

    /// SIZE (RFC 1870) - advertises the message size cap.
    ///
    /// A value of 0 means no fixed maximum and renders as bare `SIZE`.
    Size(usize),

    /// SMTPUTF8 (RFC 6531) - UTF-8 addresses and headers.
    SmtpUtf8,

    /// STARTTLS (RFC 3207) - in-band upgrade to TLS.
    StartTls,

    /// AUTH (RFC 4954) with the mechanisms currently eligible.
    Auth(Vec<String>),
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::BinaryMime => fmt.write_str("BINARYMIME"),
            Self::Chunking => fmt.write_str("CHUNKING"),
            Self::Size(max) => {
                if *max == 0 {
                    fmt.write_str("SIZE")
                } else {
                    write!(fmt, "SIZE {max}")
                }
            }
            Self::SmtpUtf8 => fmt.write_str("SMTPUTF8"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Auth(mechanisms) => write!(fmt, "AUTH {}", mechanisms.join(" ")),
        }
    }
}

/// Mechanisms that may run over an unencrypted transport when the
/// configuration explicitly allows plaintext authentication.
pub const PLAINTEXT_MECHANISMS: [&str; 2] = ["PLAIN", "LOGIN"];

/// Assemble the extension list for one EHLO reply.
///
/// STARTTLS is offered only while a certificate is configured and the
/// session is not yet secure. AUTH lists the configured mechanisms
/// intersected with what the transport permits, and disappears entirely
/// once the session has authenticated.
#[must_use]
pub fn advertised(config: &ServerConfig, secure: bool, authenticated: bool) -> Vec<Extension> {
    let mut extensions = Vec::new();

    if config.pipelining {
        extensions.push(Extension::Pipelining);
    }
    if config.eight_bit_mime {
        extensions.push(Extension::EightBitMime);
    }
    if config.binary_mime {
        extensions.push(Extension::BinaryMime);
    }
    if config.chunking {
        extensions.push(Extension::Chunking);
    }
    if config.size_extension {
        extensions.push(Extension::Size(config.max_message_size));
    }
    if config.smtp_utf8 {
        extensions.push(Extension::SmtpUtf8);
    }
    if config.tls.is_some() && !secure {
        extensions.push(Extension::StartTls);
    }

    if !authenticated {
        let eligible: Vec<String> = config
            .mechanisms
            .iter()
            .filter(|mechanism| {
                secure
                    || (config.allow_plaintext_authentication
                        && PLAINTEXT_MECHANISMS.contains(&mechanism.as_str()))
            })
            .cloned()
            .collect();

        if !eligible.is_empty() {
            extensions.push(Extension::Auth(eligible));
        }
    }

    extensions
}

#[cfg(test)]
mod test {
    use super::{Extension, advertised};
    use crate::config::ServerConfig;

    fn keywords(config: &ServerConfig, secure: bool, authenticated: bool) -> Vec<String> {
        advertised(config, secure, authenticated)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn extension_display() {
        assert_eq!(Extension::Size(100_000_000).to_string(), "SIZE 100000000");
        assert_eq!(Extension::Size(0).to_string(), "SIZE");
        assert_eq!(Extension::EightBitMime.to_string(), "8BITMIME");
        assert_eq!(
            Extension::Auth(vec!["PLAIN".to_string(), "LOGIN".to_string()]).to_string(),
            "AUTH PLAIN LOGIN"
        );
    }

    #[test]
    fn plaintext_session_hides_auth_by_default() {
        let config = ServerConfig::default();
        let keywords = keywords(&config, false, false);

        assert!(keywords.contains(&"PIPELINING".to_string()));
        assert!(keywords.contains(&"8BITMIME".to_string()));
        assert!(keywords.contains(&"CHUNKING".to_string()));
        assert!(keywords.contains(&"SIZE".to_string()));
        assert!(!keywords.iter().any(|k| k.starts_with("AUTH")));
        // No certificate configured, so no STARTTLS either
        assert!(!keywords.contains(&"STARTTLS".to_string()));
    }

    #[test]
    fn plaintext_auth_is_limited_to_plain_and_login() {
        let mut config = ServerConfig::default();
        config.allow_plaintext_authentication = true;
        config.mechanisms = vec![
            "PLAIN".to_string(),
            "LOGIN".to_string(),
            "CRAM-MD5".to_string(),
        ];

        let plaintext_keywords = keywords(&config, false, false);
        assert!(plaintext_keywords.contains(&"AUTH PLAIN LOGIN".to_string()));

        // Over TLS the full configured list is eligible
        let tls_keywords = keywords(&config, true, false);
        assert!(tls_keywords.contains(&"AUTH PLAIN LOGIN CRAM-MD5".to_string()));
    }

    #[test]
    fn auth_disappears_after_authentication() {
        let mut config = ServerConfig::default();
        config.allow_plaintext_authentication = true;

        assert!(
            keywords(&config, true, true)
                .iter()
                .all(|k| !k.starts_with("AUTH"))
        );
    }

    #[test]
    fn advertised_set_is_exhaustive() {
        // Nothing beyond the enumerated ESMTP keywords ever appears;
        // notably no HELP line, which has its own 214 reply
        let mut config = ServerConfig::default();
        config.max_message_size = 10_485_760;

        assert_eq!(
            keywords(&config, false, false),
            ["PIPELINING", "8BITMIME", "CHUNKING", "SIZE 10485760"]
        );

        config.allow_plaintext_authentication = true;
        assert_eq!(
            keywords(&config, false, false),
            [
                "PIPELINING",
                "8BITMIME",
                "CHUNKING",
                "SIZE 10485760",
                "AUTH PLAIN LOGIN"
            ]
        );
    }

    #[test]
    fn size_advertises_the_cap() {
        let mut config = ServerConfig::default();
        config.max_message_size = 10_485_760;
        assert!(keywords(&config, false, false).contains(&"SIZE 10485760".to_string()));

        config.size_extension = false;
        assert!(
            keywords(&config, false, false)
                .iter()
                .all(|k| !k.starts_with("SIZE"))
        );
    }
}
