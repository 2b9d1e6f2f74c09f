//! SASL mechanisms and the credential verification boundary.
//!
//! Mechanisms are pure state machines: the session drives the wire side
//! (the `334` continuation convention, the `*` cancel line), feeds client
//! responses into [`Exchange::step`] and acts on the returned [`Step`].
//! This keeps every mechanism testable without I/O and lets embedders
//! register their own multi-step mechanisms.

use ahash::AHashMap;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

/// What a mechanism extracted from a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Authorization identity; usually empty, meaning "act as the
    /// authentication identity".
    pub authzid: Option<String>,
    /// Authentication identity (the username).
    pub authcid: String,
    pub password: String,
}

/// Outcome of verifying one set of credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success { identity: String },
    Fail { reason: String },
}

/// The external credential verification capability.
///
/// Must be safe to share across sessions. The reason string of a failure is
/// never echoed to the client; it only reaches logs and events.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credentials: &Credentials) -> AuthOutcome;
}

/// Refuses every credential. The default until an embedder wires a real
/// verifier, so a misconfigured server never admits anyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl CredentialVerifier for DenyAll {
    async fn verify(&self, _credentials: &Credentials) -> AuthOutcome {
        AuthOutcome::Fail {
            reason: "no credential verifier configured".to_string(),
        }
    }
}

/// Fixed username/password table, for tests and small deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: AHashMap<String, String>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, credentials: &Credentials) -> AuthOutcome {
        match self.users.get(&credentials.authcid) {
            Some(password) if *password == credentials.password => AuthOutcome::Success {
                identity: credentials.authcid.clone(),
            },
            _ => AuthOutcome::Fail {
                reason: "unknown user or bad password".to_string(),
            },
        }
    }
}

/// A step in a mechanism exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send `334 <text>` and feed the next client line back in.
    Challenge(String),
    /// The exchange is complete; verify these credentials.
    Credentials(Credentials),
}

/// Exchange-level failures; all map onto `501`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid base64 encoding")]
    Decode,

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// One in-flight exchange. Mechanisms with several round trips keep their
/// position here.
pub trait Exchange: Send {
    /// Feed the next client response. `None` means the AUTH command carried
    /// no initial response and nothing has been read yet.
    fn step(&mut self, input: Option<&[u8]>) -> Result<Step, AuthError>;
}

/// A registered SASL mechanism.
pub trait Mechanism: Send + Sync {
    /// Uppercase mechanism name as advertised after `AUTH`.
    fn name(&self) -> &str;

    /// Whether this mechanism may run over an unencrypted transport when
    /// the configuration allows plaintext authentication. Only PLAIN and
    /// LOGIN qualify; custom mechanisms default to TLS-only.
    fn plaintext_capable(&self) -> bool {
        false
    }

    fn begin(&self) -> Box<dyn Exchange>;
}

fn decode(input: &[u8]) -> Result<Vec<u8>, AuthError> {
    STANDARD.decode(input).map_err(|_| AuthError::Decode)
}

fn utf8(bytes: Vec<u8>) -> Result<String, AuthError> {
    String::from_utf8(bytes).map_err(|_| AuthError::Malformed("not UTF-8".to_string()))
}

/// SASL PLAIN (RFC 4616): a single response of three NUL-separated fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

impl Mechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn plaintext_capable(&self) -> bool {
        true
    }

    fn begin(&self) -> Box<dyn Exchange> {
        Box::new(PlainExchange { prompted: false })
    }
}

struct PlainExchange {
    prompted: bool,
}

impl Exchange for PlainExchange {
    fn step(&mut self, input: Option<&[u8]>) -> Result<Step, AuthError> {
        let Some(input) = input.filter(|input| !input.is_empty()) else {
            // No initial response; prompt once with an empty challenge
            if self.prompted {
                return Err(AuthError::Malformed("empty response".to_string()));
            }
            self.prompted = true;
            return Ok(Step::Challenge(String::new()));
        };

        let decoded = decode(input)?;
        let mut fields = decoded.split(|&byte| byte == 0);

        let (Some(authzid), Some(authcid), Some(password), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(AuthError::Malformed(
                "expected authzid NUL authcid NUL password".to_string(),
            ));
        };

        if authcid.is_empty() {
            return Err(AuthError::Malformed("empty authentication id".to_string()));
        }

        let authzid = utf8(authzid.to_vec())?;
        Ok(Step::Credentials(Credentials {
            authzid: (!authzid.is_empty()).then_some(authzid),
            authcid: utf8(authcid.to_vec())?,
            password: utf8(password.to_vec())?,
        }))
    }
}

/// The de-facto LOGIN mechanism: base64 `Username:` and `Password:`
/// prompts, one response each.
#[derive(Debug, Clone, Copy, Default)]
pub struct Login;

// base64 for "Username:" and "Password:"
const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

impl Mechanism for Login {
    fn name(&self) -> &str {
        "LOGIN"
    }

    fn plaintext_capable(&self) -> bool {
        true
    }

    fn begin(&self) -> Box<dyn Exchange> {
        Box::new(LoginExchange::Start)
    }
}

enum LoginExchange {
    Start,
    WantUsername,
    WantPassword { username: String },
}

impl Exchange for LoginExchange {
    fn step(&mut self, input: Option<&[u8]>) -> Result<Step, AuthError> {
        match self {
            Self::Start => match input.filter(|input| !input.is_empty()) {
                // An initial response to AUTH LOGIN is the username
                Some(input) => {
                    *self = Self::WantPassword {
                        username: utf8(decode(input)?)?,
                    };
                    Ok(Step::Challenge(PASSWORD_PROMPT.to_string()))
                }
                None => {
                    *self = Self::WantUsername;
                    Ok(Step::Challenge(USERNAME_PROMPT.to_string()))
                }
            },
            Self::WantUsername => {
                let input = input.ok_or_else(|| AuthError::Malformed("missing username".to_string()))?;
                *self = Self::WantPassword {
                    username: utf8(decode(input)?)?,
                };
                Ok(Step::Challenge(PASSWORD_PROMPT.to_string()))
            }
            Self::WantPassword { username } => {
                let input = input.ok_or_else(|| AuthError::Malformed("missing password".to_string()))?;
                let credentials = Credentials {
                    authzid: None,
                    authcid: username.clone(),
                    password: utf8(decode(input)?)?,
                };
                Ok(Step::Credentials(credentials))
            }
        }
    }
}

/// Per-server mechanism registry. Owned by the server instance; nothing is
/// process-global.
#[derive(Default, Clone)]
pub struct Mechanisms {
    inner: AHashMap<String, std::sync::Arc<dyn Mechanism>>,
}

impl Mechanisms {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// PLAIN and LOGIN, the two mechanisms every deployment starts from.
    #[must_use]
    pub fn builtin() -> Self {
        let mut mechanisms = Self::default();
        mechanisms.register(std::sync::Arc::new(Plain));
        mechanisms.register(std::sync::Arc::new(Login));
        mechanisms
    }

    pub fn register(&mut self, mechanism: std::sync::Arc<dyn Mechanism>) {
        self.inner
            .insert(mechanism.name().to_ascii_uppercase(), mechanism);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&std::sync::Arc<dyn Mechanism>> {
        self.inner.get(&name.to_ascii_uppercase())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Mechanisms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mechanisms")
            .field("registered", &self.names())
            .finish()
    }
}
