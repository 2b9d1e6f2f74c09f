use core::fmt::{self, Display, Formatter};

use ahash::AHashMap;
use phf::phf_map;
use thiserror::Error;
use zetian_common::{address::Address, status::Status};

#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn domain(&self) -> &str {
        match self {
            Self::Ehlo(domain) | Self::Helo(domain) => domain,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// ESMTP `key=value` parameters from MAIL and RCPT commands.
///
/// Keys are folded to uppercase; values are preserved verbatim and decoded
/// by whichever layer owns the parameter's semantics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MailParameters(AHashMap<String, Option<String>>);

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(tokens: &str) -> Result<Self, ParseError> {
        let mut parameters = AHashMap::new();

        for token in tokens.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(key, value)| (key, Some(value)));

            if key.is_empty() {
                return Err(ParseError::Syntax(format!("Malformed parameter {token:?}")));
            }

            if parameters
                .insert(key.to_ascii_uppercase(), value.map(str::to_string))
                .is_some()
            {
                return Err(ParseError::Syntax(format!("Duplicate parameter {key}")));
            }
        }

        Ok(Self(parameters))
    }

    /// Look up a parameter by its (case-insensitive) key.
    ///
    /// `Some(None)` means the key was present without a value, as in
    /// `SMTPUTF8`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.0
            .get(&key.to_ascii_uppercase())
            .map(|value| value.as_deref())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_uppercase())
    }

    #[must_use]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(HeloVariant),
    /// A `None` sender is the null reverse-path (`<>`), used for bounces.
    Mail {
        sender: Option<Address>,
        parameters: MailParameters,
    },
    Rcpt {
        recipient: Address,
        parameters: MailParameters,
    },
    Data,
    Bdat {
        size: usize,
        last: bool,
    },
    Rset,
    Quit,
    Noop,
    Vrfy(String),
    Expn(String),
    Help(Option<String>),
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    StartTls,
}

impl Command {
    /// Whether the server must flush buffered replies before reading the
    /// next command, even under PIPELINING (RFC 2920 section 3.1):
    /// DATA, BDAT, QUIT, STARTTLS and AUTH.
    #[must_use]
    pub const fn is_synchronizing(&self) -> bool {
        matches!(
            self,
            Self::Data | Self::Bdat { .. } | Self::Quit | Self::StartTls | Self::Auth { .. }
        )
    }

    /// The uppercased verb, for logs and events.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Helo(HeloVariant::Ehlo(_)) => "EHLO",
            Self::Helo(HeloVariant::Helo(_)) => "HELO",
            Self::Mail { .. } => "MAIL",
            Self::Rcpt { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Bdat { .. } => "BDAT",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
            Self::Noop => "NOOP",
            Self::Vrfy(_) => "VRFY",
            Self::Expn(_) => "EXPN",
            Self::Help(_) => "HELP",
            Self::Auth { .. } => "AUTH",
            Self::StartTls => "STARTTLS",
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => write!(fmt, "{v} {}", v.domain()),
            Self::Mail { sender, .. } => write!(
                fmt,
                "MAIL FROM:<{}>",
                sender.as_ref().map(Address::address).unwrap_or_default()
            ),
            Self::Rcpt { recipient, .. } => write!(fmt, "RCPT TO:<{recipient}>"),
            Self::Bdat { size, last } => {
                write!(fmt, "BDAT {size}{}", if *last { " LAST" } else { "" })
            }
            // Never echo the initial response, it carries credentials
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::Vrfy(arg) => write!(fmt, "VRFY {arg}"),
            Self::Expn(arg) => write!(fmt, "EXPN {arg}"),
            Self::Help(Some(arg)) => write!(fmt, "HELP {arg}"),
            _ => fmt.write_str(self.verb()),
        }
    }
}

/// Why a command line failed to parse, mapped onto the 500/501 split.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The verb is not in the whitelist.
    #[error("Syntax error, command unrecognized")]
    Unrecognized(String),

    /// The verb is known but its argument is malformed.
    #[error("Syntax error in parameters: {0}")]
    Syntax(String),
}

impl ParseError {
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::Unrecognized(_) => Status::SyntaxError,
            Self::Syntax(_) => Status::ParameterSyntaxError,
        }
    }
}

#[derive(Clone, Copy)]
enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Bdat,
    Rset,
    Quit,
    Noop,
    Vrfy,
    Expn,
    Help,
    Auth,
    StartTls,
}

static VERBS: phf::Map<&'static str, Verb> = phf_map! {
    "HELO" => Verb::Helo,
    "EHLO" => Verb::Ehlo,
    "MAIL" => Verb::Mail,
    "RCPT" => Verb::Rcpt,
    "DATA" => Verb::Data,
    "BDAT" => Verb::Bdat,
    "RSET" => Verb::Rset,
    "QUIT" => Verb::Quit,
    "NOOP" => Verb::Noop,
    "VRFY" => Verb::Vrfy,
    "EXPN" => Verb::Expn,
    "HELP" => Verb::Help,
    "AUTH" => Verb::Auth,
    "STARTTLS" => Verb::StartTls,
};

impl Command {
    /// Parse one command line (without the trailing CRLF).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(verb, rest)| (verb, rest.trim()));

        let Some(verb) = VERBS.get(verb.to_ascii_uppercase().as_str()) else {
            return Err(ParseError::Unrecognized(line.to_string()));
        };

        match verb {
            Verb::Helo | Verb::Ehlo => {
                if rest.is_empty() {
                    return Err(ParseError::Syntax(format!("Expected hostname in {line}")));
                }

                Ok(Self::Helo(if matches!(verb, Verb::Ehlo) {
                    HeloVariant::Ehlo(rest.to_string())
                } else {
                    HeloVariant::Helo(rest.to_string())
                }))
            }
            Verb::Mail => {
                let rest = strip_keyword(rest, "FROM:")
                    .ok_or_else(|| ParseError::Syntax(format!("Expected FROM: in {line}")))?;
                let (sender, parameters) = parse_path(rest)?;

                Ok(Self::Mail {
                    sender,
                    parameters: MailParameters::parse(parameters)?,
                })
            }
            Verb::Rcpt => {
                let rest = strip_keyword(rest, "TO:")
                    .ok_or_else(|| ParseError::Syntax(format!("Expected TO: in {line}")))?;
                let (recipient, parameters) = parse_path(rest)?;

                // The null path is only meaningful as a reverse-path
                let recipient = recipient
                    .ok_or_else(|| ParseError::Syntax("Null forward-path".to_string()))?;

                Ok(Self::Rcpt {
                    recipient,
                    parameters: MailParameters::parse(parameters)?,
                })
            }
            Verb::Bdat => {
                let mut tokens = rest.split_whitespace();
                let size = tokens
                    .next()
                    .and_then(|size| size.parse::<usize>().ok())
                    .ok_or_else(|| ParseError::Syntax(format!("Expected chunk size in {line}")))?;

                let last = match tokens.next() {
                    None => false,
                    Some(token) if token.eq_ignore_ascii_case("LAST") => true,
                    Some(token) => {
                        return Err(ParseError::Syntax(format!("Unexpected token {token:?}")));
                    }
                };

                if tokens.next().is_some() {
                    return Err(ParseError::Syntax(format!("Trailing tokens in {line}")));
                }

                Ok(Self::Bdat { size, last })
            }
            Verb::Auth => {
                let mut tokens = rest.split_whitespace();
                let mechanism = tokens
                    .next()
                    .ok_or_else(|| ParseError::Syntax("Expected mechanism name".to_string()))?
                    .to_ascii_uppercase();
                let initial = tokens.next().map(str::to_string);

                if tokens.next().is_some() {
                    return Err(ParseError::Syntax(format!("Trailing tokens in {line}")));
                }

                Ok(Self::Auth { mechanism, initial })
            }
            Verb::Data if rest.is_empty() => Ok(Self::Data),
            Verb::Rset if rest.is_empty() => Ok(Self::Rset),
            Verb::Quit if rest.is_empty() => Ok(Self::Quit),
            Verb::StartTls if rest.is_empty() => Ok(Self::StartTls),
            Verb::Data | Verb::Rset | Verb::Quit | Verb::StartTls => Err(ParseError::Syntax(
                format!("Unexpected argument in {line}"),
            )),
            Verb::Noop => Ok(Self::Noop),
            Verb::Vrfy => Ok(Self::Vrfy(rest.to_string())),
            Verb::Expn => Ok(Self::Expn(rest.to_string())),
            Verb::Help => Ok(Self::Help(
                (!rest.is_empty()).then(|| rest.to_string()),
            )),
        }
    }
}

/// Strip a leading keyword (`FROM:` / `TO:`) case-insensitively. Accepts a
/// space before the colon's payload, which some clients insert.
fn strip_keyword<'a>(rest: &'a str, keyword: &str) -> Option<&'a str> {
    if rest.len() >= keyword.len() && rest[..keyword.len()].eq_ignore_ascii_case(keyword) {
        Some(rest[keyword.len()..].trim_start())
    } else {
        None
    }
}

/// Split a path from its trailing parameters and parse it.
///
/// `<user@example.com> SIZE=100` → `(Some(address), "SIZE=100")`; the empty
/// path `<>` yields `None`.
fn parse_path(rest: &str) -> Result<(Option<Address>, &str), ParseError> {
    if let Some(rest) = rest.strip_prefix('<') {
        let (inside, after) = rest
            .split_once('>')
            .ok_or_else(|| ParseError::Syntax("Unterminated path".to_string()))?;

        if inside.is_empty() {
            return Ok((None, after.trim_start()));
        }

        let address = Address::parse(inside)
            .map_err(|err| ParseError::Syntax(err.to_string()))?;
        Ok((Some(address), after.trim_start()))
    } else {
        // Tolerate a bare address without angle brackets
        let (path, after) = rest
            .split_once(char::is_whitespace)
            .map_or((rest, ""), |(path, after)| (path, after.trim_start()));

        if path.is_empty() {
            return Err(ParseError::Syntax("Missing path".to_string()));
        }

        let address = Address::parse(path)
            .map_err(|err| ParseError::Syntax(err.to_string()))?;
        Ok((Some(address), after))
    }
}
