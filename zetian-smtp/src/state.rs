use crate::command::Command;

/// Protocol position of one session.
///
/// `Data` never dispatches commands (the body reader owns the stream) and a
/// closed session has left the loop, so neither appears here; the matrix
/// covers the states in which command lines are read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Connected, not yet greeted.
    #[default]
    Connected,
    /// EHLO or HELO accepted; no open transaction.
    Greeted,
    /// MAIL FROM accepted; no recipients yet.
    Mail,
    /// At least one RCPT TO accepted; DATA/BDAT may begin.
    Recipient,
}

impl State {
    /// The command matrix. Anything not permitted here is answered with
    /// `503 Bad sequence of commands` and leaves the state untouched.
    ///
    /// STARTTLS and AUTH clear this gate in `Connected`/`Greeted` but are
    /// additionally subject to advertisement rules (certificate present,
    /// TLS gating) enforced by their handlers.
    #[must_use]
    pub const fn permits(self, command: &Command) -> bool {
        match (self, command) {
            // QUIT and NOOP are acceptable at any point between commands
            (_, Command::Quit | Command::Noop) => true,

            // A new greeting is always allowed; mid-transaction it aborts
            // the transaction first
            (_, Command::Helo(_)) => true,

            (Self::Connected | Self::Greeted, Command::StartTls | Command::Auth { .. }) => true,

            (
                Self::Greeted,
                Command::Mail { .. }
                | Command::Rset
                | Command::Vrfy(_)
                | Command::Expn(_)
                | Command::Help(_),
            ) => true,

            (Self::Mail | Self::Recipient, Command::Rcpt { .. } | Command::Rset) => true,
            (Self::Recipient, Command::Data | Command::Bdat { .. }) => true,

            _ => false,
        }
    }

    /// Whether a mail transaction is open.
    #[must_use]
    pub const fn in_transaction(self) -> bool {
        matches!(self, Self::Mail | Self::Recipient)
    }
}

#[cfg(test)]
mod test {
    use super::State;
    use crate::command::Command;

    fn command(line: &str) -> Command {
        Command::parse(line).unwrap()
    }

    #[test]
    fn connected_permits_pre_transaction_commands() {
        let state = State::Connected;
        assert!(state.permits(&command("EHLO a.test")));
        assert!(state.permits(&command("HELO a.test")));
        assert!(state.permits(&command("QUIT")));
        assert!(state.permits(&command("NOOP")));
        assert!(state.permits(&command("STARTTLS")));
        assert!(state.permits(&command("AUTH PLAIN")));

        assert!(!state.permits(&command("MAIL FROM:<a@x.com>")));
        assert!(!state.permits(&command("RCPT TO:<b@y.com>")));
        assert!(!state.permits(&command("DATA")));
        assert!(!state.permits(&command("RSET")));
        assert!(!state.permits(&command("VRFY someone")));
    }

    #[test]
    fn greeted_opens_the_dialogue() {
        let state = State::Greeted;
        assert!(state.permits(&command("MAIL FROM:<a@x.com>")));
        assert!(state.permits(&command("RSET")));
        assert!(state.permits(&command("VRFY someone")));
        assert!(state.permits(&command("HELP")));
        assert!(state.permits(&command("STARTTLS")));
        assert!(state.permits(&command("AUTH PLAIN")));
        assert!(state.permits(&command("EHLO again.test")));

        assert!(!state.permits(&command("RCPT TO:<b@y.com>")));
        assert!(!state.permits(&command("DATA")));
        assert!(!state.permits(&command("BDAT 5")));
    }

    #[test]
    fn transaction_progression() {
        let state = State::Mail;
        assert!(state.permits(&command("RCPT TO:<b@y.com>")));
        assert!(state.permits(&command("RSET")));
        // No recipients yet
        assert!(!state.permits(&command("DATA")));
        assert!(!state.permits(&command("BDAT 5")));
        assert!(!state.permits(&command("MAIL FROM:<a@x.com>")));

        let state = State::Recipient;
        assert!(state.permits(&command("RCPT TO:<c@z.com>")));
        assert!(state.permits(&command("DATA")));
        assert!(state.permits(&command("BDAT 5 LAST")));
        assert!(!state.permits(&command("MAIL FROM:<a@x.com>")));
    }

    #[test]
    fn starttls_and_auth_are_blocked_mid_transaction() {
        for state in [State::Mail, State::Recipient] {
            assert!(!state.permits(&command("STARTTLS")));
            assert!(!state.permits(&command("AUTH PLAIN")));
        }
    }

    #[test]
    fn greeting_is_always_permitted() {
        for state in [
            State::Connected,
            State::Greeted,
            State::Mail,
            State::Recipient,
        ] {
            assert!(state.permits(&command("EHLO client.test")));
        }
    }

    #[test]
    fn transaction_states() {
        assert!(!State::Connected.in_transaction());
        assert!(!State::Greeted.in_transaction());
        assert!(State::Mail.in_transaction());
        assert!(State::Recipient.in_transaction());
    }
}
