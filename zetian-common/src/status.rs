use core::fmt::{self, Display, Formatter};

/// SMTP reply codes emitted by the protocol engine.
///
/// The numeric value is the 3-digit code sent on the wire. Codes follow
/// RFC 5321, with the AUTH family from RFC 4954.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    SystemStatus,
    HelpMessage,
    ServiceReady,
    GoodBye,
    AuthSucceeded,
    Ok,
    CannotVerify,
    AuthContinue,
    StartMailInput,
    Unavailable,
    ActionAborted,
    InsufficientStorage,
    TlsUnavailable,
    SyntaxError,
    ParameterSyntaxError,
    NotImplemented,
    InvalidCommandSequence,
    ParameterNotImplemented,
    AuthRequired,
    AuthFailed,
    EncryptionRequired,
    MailboxUnavailable,
    ExceededStorage,
    TransactionFailed,
    Unknown(u16),
}

impl Status {
    /// Checks if the status is a positive completion or intermediate reply
    pub fn is_positive(self) -> bool {
        u16::from(self) < 400
    }

    /// Checks if the status is a temporary rejection
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u16::from(self))
    }

    /// Checks if the status is a permanent rejection
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            211 => Self::SystemStatus,
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSucceeded,
            250 => Self::Ok,
            252 => Self::CannotVerify,
            334 => Self::AuthContinue,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionAborted,
            452 => Self::InsufficientStorage,
            454 => Self::TlsUnavailable,
            500 => Self::SyntaxError,
            501 => Self::ParameterSyntaxError,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::AuthRequired,
            535 => Self::AuthFailed,
            538 => Self::EncryptionRequired,
            550 => Self::MailboxUnavailable,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        match value {
            Status::SystemStatus => 211,
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSucceeded => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::AuthContinue => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionAborted => 451,
            Status::InsufficientStorage => 452,
            Status::TlsUnavailable => 454,
            Status::SyntaxError => 500,
            Status::ParameterSyntaxError => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::ParameterNotImplemented => 504,
            Status::AuthRequired => 530,
            Status::AuthFailed => 535,
            Status::EncryptionRequired => 538,
            Status::MailboxUnavailable => 550,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn classification() {
        assert!(Status::Ok.is_positive());
        assert!(Status::StartMailInput.is_positive());
        assert!(Status::AuthContinue.is_positive());

        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());

        assert!(Status::MailboxUnavailable.is_permanent());
        assert!(!Status::MailboxUnavailable.is_temporary());

        assert!(Status::ExceededStorage.is_permanent());
        assert!(Status::ActionAborted.is_temporary());
    }

    #[test]
    fn round_trip() {
        for code in [220, 250, 334, 354, 421, 500, 503, 535, 538, 552, 554] {
            assert_eq!(u16::from(Status::from(code)), code);
        }

        assert_eq!(Status::from(299), Status::Unknown(299));
        assert_eq!(u16::from(Status::Unknown(299)), 299);
    }

    #[test]
    fn display_is_the_wire_code() {
        assert_eq!(Status::Ok.to_string(), "250");
        assert_eq!(Status::EncryptionRequired.to_string(), "538");
    }
}
