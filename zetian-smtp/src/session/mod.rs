use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicU64},
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncWrite};
use zetian_common::{
    Signal,
    address::Address,
    envelope::{BodyType, Envelope},
    error::SessionError,
    incoming, internal, outgoing,
    session::{Greeting, SessionInfo},
    status::Status,
};

use crate::{
    auth::{AuthOutcome, Step},
    command::{Command, HeloVariant, MailParameters},
    config::ServerConfig,
    connection::{Connection, MAX_COMMAND_LINE},
    error::ConnectionError,
    events::ServerEvent,
    extensions,
    reply::Reply,
    server::Hooks,
    state::State,
};

mod data;
mod transaction;

pub(crate) use transaction::{Transaction, TransferMode};

/// Challenge/response round trips tolerated in one AUTH exchange before the
/// server gives up on the mechanism.
const MAX_AUTH_ROUNDS: usize = 8;

/// What the session loop should do after a dispatched command.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

enum Turn {
    Shutdown,
    TimedOut,
    Line(Result<Vec<u8>, ConnectionError>),
}

/// One accepted connection, from greeting to QUIT.
///
/// The session owns its transport, transaction and counters exclusively;
/// everything shared (store, filters, verifier, events) comes in through
/// [`Hooks`] and is assumed thread-safe.
pub(crate) struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    connection: Connection<Stream>,
    config: Arc<ServerConfig>,
    hooks: Arc<Hooks>,
    queue: Arc<AtomicU64>,
    info: SessionInfo,
    state: State,
    transaction: Option<Transaction>,
    /// Consecutive non-positive replies; reset by any 2xx/3xx.
    errors: u32,
    /// Messages accepted this session.
    messages: u64,
    last_code: u16,
    started: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(crate) fn create(
        id: u64,
        connection: Connection<Stream>,
        peer: SocketAddr,
        local: SocketAddr,
        config: Arc<ServerConfig>,
        hooks: Arc<Hooks>,
        queue: Arc<AtomicU64>,
    ) -> Self {
        let secure = connection.is_tls();

        Self {
            connection,
            config,
            hooks,
            queue,
            info: SessionInfo {
                id,
                peer,
                local,
                accepted_at: chrono::Utc::now(),
                secure,
                tls_protocol: None,
                tls_cipher: None,
                authenticated: None,
                greeting: Greeting::None,
            },
            state: State::Connected,
            transaction: None,
            errors: 0,
            messages: 0,
            last_code: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub(crate) const fn messages_accepted(&self) -> u64 {
        self.messages
    }

    #[tracing::instrument(level = "debug", skip_all, fields(session = self.info.id, peer = %self.info.peer))]
    pub(crate) async fn run(
        &mut self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!(level = DEBUG, "Connected");

        self.greet();
        self.connection.flush().await.map_err(fatal)?;

        loop {
            if self.lifetime_exceeded() {
                self.hangup(Status::Unavailable, "Connection timeout, closing")
                    .await;
                return Err(SessionError::Timeout(self.config.timeouts.connection_secs));
            }

            let turn = tokio::select! {
                _ = shutdown.recv() => Turn::Shutdown,
                result = tokio::time::timeout(
                    self.command_timeout(),
                    self.connection.read_line(MAX_COMMAND_LINE),
                ) => match result {
                    Ok(line) => Turn::Line(line),
                    Err(_) => Turn::TimedOut,
                },
            };

            let line = match turn {
                Turn::Shutdown => {
                    self.hangup(Status::Unavailable, "Service shutting down").await;
                    return Err(SessionError::Shutdown);
                }
                Turn::TimedOut => {
                    self.hangup(Status::Unavailable, "Timeout waiting for command")
                        .await;
                    return Err(SessionError::Timeout(self.config.timeouts.command_secs));
                }
                Turn::Line(Err(ConnectionError::LineTooLong)) => {
                    self.reply(Reply::new(Status::SyntaxError, "Line too long"));
                    if self.finish_turn(true).await? == Flow::Close {
                        return Ok(());
                    }
                    continue;
                }
                // The peer hanging up between commands is a normal ending
                Turn::Line(Err(ConnectionError::Closed)) => return Ok(()),
                Turn::Line(Err(ConnectionError::Io(err))) => {
                    return Err(SessionError::Connection(err));
                }
                Turn::Line(Ok(line)) => line,
            };

            let Ok(text) = std::str::from_utf8(&line) else {
                self.reply(Reply::new(Status::SyntaxError, "Commands must be text"));
                if self.finish_turn(true).await? == Flow::Close {
                    return Ok(());
                }
                continue;
            };

            let command = match Command::parse(text) {
                Ok(command) => command,
                Err(err) => {
                    incoming!(level = DEBUG, "{text}");
                    self.reply(Reply::new(err.status(), err.to_string()));
                    if self.finish_turn(true).await? == Flow::Close {
                        return Ok(());
                    }
                    continue;
                }
            };

            incoming!("{command}");

            let display = command.to_string();
            self.hooks.events.emit(&ServerEvent::CommandReceived {
                session_id: self.info.id,
                command: display.clone(),
            });

            let synchronize = command.is_synchronizing();

            let flow = if let Some(refusal) = self.gate(&command) {
                self.reply(refusal);
                Flow::Continue
            } else if self.state.permits(&command) {
                self.dispatch(command).await?
            } else {
                self.reply(Reply::new(
                    Status::InvalidCommandSequence,
                    "Bad sequence of commands",
                ));
                Flow::Continue
            };

            self.hooks.events.emit(&ServerEvent::CommandExecuted {
                session_id: self.info.id,
                command: display,
                code: self.last_code,
            });

            match flow {
                Flow::Close => {
                    self.connection.flush().await.map_err(fatal)?;
                    self.connection.shutdown().await;
                    return Ok(());
                }
                Flow::Continue => {
                    if self.finish_turn(synchronize).await? == Flow::Close {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn greet(&mut self) {
        let banner = self
            .config
            .banner
            .clone()
            .unwrap_or_else(|| format!("{} ESMTP ready", self.config.server_name));
        self.reply(Reply::new(Status::ServiceReady, banner));
    }

    /// Queue a reply and keep the consecutive-error counter current.
    fn reply(&mut self, reply: Reply) {
        outgoing!("{reply}");

        if reply.is_positive() {
            self.errors = 0;
        } else {
            self.errors += 1;
        }
        self.last_code = reply.code();
        self.connection.enqueue(&reply);
    }

    /// Apply the drop policy, then flush unless a pipelined batch is still
    /// draining. Synchronizing commands and disabled pipelining always
    /// flush.
    async fn finish_turn(&mut self, synchronize: bool) -> Result<Flow, SessionError> {
        if self.errors >= self.config.max_retry_count {
            internal!(
                level = WARN,
                "Dropping session after {} consecutive errors",
                self.errors
            );
            self.reply(Reply::new(
                Status::Unavailable,
                "Too many errors, closing transmission channel",
            ));
            self.connection.flush().await.map_err(fatal)?;
            self.connection.shutdown().await;
            return Ok(Flow::Close);
        }

        if synchronize || !self.config.pipelining || !self.connection.has_buffered_line() {
            self.connection.flush().await.map_err(fatal)?;
        }

        Ok(Flow::Continue)
    }

    /// Best-effort final reply before an abnormal close.
    async fn hangup(&mut self, status: Status, text: &str) {
        self.connection.enqueue(&Reply::new(status, text));
        let _ = self.connection.flush().await;
        self.connection.shutdown().await;
    }

    fn lifetime_exceeded(&self) -> bool {
        let limit = self.config.timeouts.connection_secs;
        limit > 0 && self.started.elapsed() >= Duration::from_secs(limit)
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.command_secs)
    }

    pub(super) fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.data_secs)
    }

    /// The secure-transport gate: when required, nothing but greeting,
    /// upgrade and session control runs in the clear.
    fn gate(&self, command: &Command) -> Option<Reply> {
        if self.config.require_secure_connection
            && !self.info.secure
            && !matches!(
                command,
                Command::Helo(_) | Command::StartTls | Command::Quit | Command::Noop
            )
        {
            return Some(Reply::new(
                Status::AuthRequired,
                "5.7.0 Must issue a STARTTLS command first",
            ));
        }

        None
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, SessionError> {
        match command {
            Command::Helo(variant) => {
                self.handle_helo(variant);
                Ok(Flow::Continue)
            }
            Command::Mail { sender, parameters } => {
                self.handle_mail(sender, parameters).await;
                Ok(Flow::Continue)
            }
            Command::Rcpt { recipient, .. } => {
                self.handle_rcpt(recipient).await;
                Ok(Flow::Continue)
            }
            Command::Data => self.handle_data().await,
            Command::Bdat { size, last } => self.handle_bdat(size, last).await,
            Command::Rset => {
                self.transaction = None;
                self.state = State::Greeted;
                self.reply(Reply::new(Status::Ok, "Ok"));
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.reply(Reply::new(
                    Status::GoodBye,
                    "Service closing transmission channel",
                ));
                Ok(Flow::Close)
            }
            Command::Noop => {
                self.reply(Reply::new(Status::Ok, "Ok"));
                Ok(Flow::Continue)
            }
            // Never confirm or deny mailbox existence
            Command::Vrfy(_) => {
                self.reply(Reply::new(
                    Status::CannotVerify,
                    "Cannot VRFY user, but will accept message and attempt delivery",
                ));
                Ok(Flow::Continue)
            }
            Command::Expn(_) => {
                self.reply(Reply::new(Status::CannotVerify, "Cannot expand list"));
                Ok(Flow::Continue)
            }
            Command::Help(_) => {
                self.reply(Reply::new(
                    Status::HelpMessage,
                    "Commands: EHLO HELO MAIL RCPT DATA BDAT RSET NOOP QUIT VRFY EXPN HELP AUTH STARTTLS",
                ));
                Ok(Flow::Continue)
            }
            Command::Auth { mechanism, initial } => self.handle_auth(mechanism, initial).await,
            Command::StartTls => self.handle_starttls().await,
        }
    }

    /// EHLO/HELO: greet (or re-greet), aborting any open transaction.
    fn handle_helo(&mut self, variant: HeloVariant) {
        if self.transaction.take().is_some() {
            internal!(level = DEBUG, "Transaction aborted by new greeting");
        }

        let domain = variant.domain().to_string();
        let identity = format!("{} greets {domain}", self.config.server_name);

        match variant {
            HeloVariant::Helo(_) => {
                self.info.greeting = Greeting::Helo(domain);
                self.reply(Reply::new(Status::Ok, identity));
            }
            HeloVariant::Ehlo(_) => {
                self.info.greeting = Greeting::Ehlo(domain);

                let mut lines = vec![self.config.greeting.clone().unwrap_or(identity)];
                lines.extend(
                    extensions::advertised(
                        &self.config,
                        self.info.secure,
                        self.info.is_authenticated(),
                    )
                    .iter()
                    .map(ToString::to_string),
                );
                self.reply(Reply::with_lines(Status::Ok, lines));
            }
        }

        self.state = State::Greeted;
    }

    async fn handle_mail(&mut self, sender: Option<Address>, parameters: MailParameters) {
        if self.config.require_authentication && !self.info.is_authenticated() {
            return self.reply(Reply::new(
                Status::AuthRequired,
                "5.7.0 Authentication required",
            ));
        }

        let mut envelope = Envelope::new(sender);

        for key in parameters.keys() {
            if !matches!(key, "SIZE" | "BODY" | "SMTPUTF8" | "AUTH") {
                return self.reply(Reply::new(
                    Status::ParameterSyntaxError,
                    format!("Unrecognized parameter {key}"),
                ));
            }
        }

        if let Some(value) = parameters.get("SIZE") {
            if !self.config.size_extension {
                return self.reply(Reply::new(
                    Status::ParameterSyntaxError,
                    "SIZE parameter not enabled",
                ));
            }

            let Some(size) = value.and_then(|value| value.parse::<usize>().ok()) else {
                return self.reply(Reply::new(
                    Status::ParameterSyntaxError,
                    "Invalid SIZE value",
                ));
            };

            // Fail fast before any RCPT gets collected
            if self.config.max_message_size > 0 && size > self.config.max_message_size {
                return self.reply(Reply::new(
                    Status::ExceededStorage,
                    format!(
                        "5.3.4 Message size exceeds limit of {} bytes",
                        self.config.max_message_size
                    ),
                ));
            }

            envelope.set_declared_size(size);
        }

        if let Some(value) = parameters.get("BODY") {
            let body_type = match value.map(str::to_ascii_uppercase).as_deref() {
                Some("7BIT") => BodyType::SevenBit,
                Some("8BITMIME") if self.config.eight_bit_mime => BodyType::EightBitMime,
                Some("BINARYMIME") if self.config.binary_mime => BodyType::BinaryMime,
                Some("8BITMIME") | Some("BINARYMIME") => {
                    return self.reply(Reply::new(
                        Status::ParameterSyntaxError,
                        "BODY type not enabled",
                    ));
                }
                _ => {
                    return self.reply(Reply::new(
                        Status::ParameterSyntaxError,
                        "Invalid BODY value",
                    ));
                }
            };
            envelope.set_body_type(body_type);
        }

        if parameters.contains("SMTPUTF8") {
            if !self.config.smtp_utf8 {
                return self.reply(Reply::new(
                    Status::ParameterSyntaxError,
                    "SMTPUTF8 not enabled",
                ));
            }
            envelope.set_utf8(true);
        }

        // The AUTH parameter is parsed but carries no trust here

        if !self
            .hooks
            .filter
            .can_accept_from(&self.info, envelope.sender(), envelope.declared_size())
            .await
        {
            return self.reply(Reply::new(Status::MailboxUnavailable, "Sender rejected"));
        }

        self.transaction = Some(Transaction::new(envelope));
        self.state = State::Mail;
        self.reply(Reply::new(Status::Ok, "Ok"));
    }

    async fn handle_rcpt(&mut self, recipient: Address) {
        let Some(transaction) = self.transaction.as_ref() else {
            return self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "No transaction in progress",
            ));
        };

        if transaction.envelope().recipients().len() >= self.config.max_recipients {
            return self.reply(Reply::new(
                Status::InsufficientStorage,
                "Too many recipients",
            ));
        }

        let sender = transaction.envelope().sender().cloned();

        if !self
            .hooks
            .filter
            .can_deliver_to(&self.info, &recipient, sender.as_ref())
            .await
        {
            return self.reply(Reply::new(Status::MailboxUnavailable, "Recipient rejected"));
        }

        if let Some(transaction) = self.transaction.as_mut() {
            transaction.envelope_mut().push_recipient(recipient);
        }
        self.state = State::Recipient;
        self.reply(Reply::new(Status::Ok, "Ok"));
    }

    async fn handle_auth(
        &mut self,
        mechanism: String,
        initial: Option<String>,
    ) -> Result<Flow, SessionError> {
        if self.info.is_authenticated() {
            self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "Already authenticated",
            ));
            return Ok(Flow::Continue);
        }

        let handler = if self.config.mechanisms.contains(&mechanism) {
            self.hooks.mechanisms.get(&mechanism).cloned()
        } else {
            None
        };
        let Some(handler) = handler else {
            self.reply(Reply::new(
                Status::ParameterNotImplemented,
                "5.5.4 Unrecognized authentication type",
            ));
            return Ok(Flow::Continue);
        };

        if !self.info.secure
            && !(self.config.allow_plaintext_authentication && handler.plaintext_capable())
        {
            self.reply(Reply::new(
                Status::EncryptionRequired,
                "5.7.11 Encryption required for authentication",
            ));
            return Ok(Flow::Continue);
        }

        self.hooks.events.emit(&ServerEvent::AuthAttempted {
            session_id: self.info.id,
            mechanism: mechanism.clone(),
        });

        // AUTH is a synchronization point; drain pending replies before the
        // first challenge
        self.connection.flush().await.map_err(fatal)?;

        let mut exchange = handler.begin();
        // "=" is the zero-length initial response (RFC 4954 section 4)
        let mut input: Option<Vec<u8>> = initial.map(|initial| {
            if initial == "=" {
                Vec::new()
            } else {
                initial.into_bytes()
            }
        });

        for _ in 0..MAX_AUTH_ROUNDS {
            match exchange.step(input.as_deref()) {
                Err(err) => {
                    self.reply(Reply::new(Status::ParameterSyntaxError, err.to_string()));
                    self.auth_failed(&mechanism);
                    return Ok(Flow::Continue);
                }
                Ok(Step::Challenge(challenge)) => {
                    self.reply(Reply::new(Status::AuthContinue, challenge));
                    self.connection.flush().await.map_err(fatal)?;

                    let line = match tokio::time::timeout(
                        self.command_timeout(),
                        self.connection.read_line(MAX_COMMAND_LINE),
                    )
                    .await
                    {
                        Err(_) => {
                            self.hangup(Status::Unavailable, "Timeout during authentication")
                                .await;
                            return Err(SessionError::Timeout(self.config.timeouts.command_secs));
                        }
                        Ok(Err(ConnectionError::LineTooLong)) => {
                            self.reply(Reply::new(Status::ParameterSyntaxError, "Response too long"));
                            self.auth_failed(&mechanism);
                            return Ok(Flow::Continue);
                        }
                        Ok(Err(ConnectionError::Closed)) => return Ok(Flow::Close),
                        Ok(Err(ConnectionError::Io(err))) => {
                            return Err(SessionError::Connection(err));
                        }
                        Ok(Ok(line)) => line,
                    };

                    if line == b"*" {
                        self.reply(Reply::new(
                            Status::ParameterSyntaxError,
                            "Authentication cancelled",
                        ));
                        self.auth_failed(&mechanism);
                        return Ok(Flow::Continue);
                    }

                    input = Some(line);
                }
                Ok(Step::Credentials(credentials)) => {
                    match self.hooks.verifier.verify(&credentials).await {
                        AuthOutcome::Success { identity } => {
                            internal!(level = INFO, "Authenticated as {identity}");
                            self.info.authenticated = Some(identity.clone());
                            self.reply(Reply::new(
                                Status::AuthSucceeded,
                                "2.7.0 Authentication successful",
                            ));
                            self.hooks.events.emit(&ServerEvent::AuthSucceeded {
                                session_id: self.info.id,
                                identity,
                            });
                        }
                        AuthOutcome::Fail { reason } => {
                            internal!(level = DEBUG, "Authentication failed: {reason}");
                            self.reply(Reply::new(
                                Status::AuthFailed,
                                "5.7.8 Authentication credentials invalid",
                            ));
                            self.auth_failed(&mechanism);
                        }
                    }
                    return Ok(Flow::Continue);
                }
            }
        }

        self.reply(Reply::new(
            Status::ParameterSyntaxError,
            "Authentication exchange too long",
        ));
        self.auth_failed(&mechanism);
        Ok(Flow::Continue)
    }

    fn auth_failed(&self, mechanism: &str) {
        self.hooks.events.emit(&ServerEvent::AuthFailed {
            session_id: self.info.id,
            mechanism: mechanism.to_string(),
        });
    }

    async fn handle_starttls(&mut self) -> Result<Flow, SessionError> {
        if self.info.secure {
            self.reply(Reply::new(Status::TlsUnavailable, "TLS already active"));
            return Ok(Flow::Continue);
        }

        let Some(tls) = self.config.tls.clone() else {
            self.reply(Reply::new(Status::TlsUnavailable, "TLS not available"));
            return Ok(Flow::Continue);
        };

        self.reply(Reply::new(Status::ServiceReady, "Ready to start TLS"));
        self.connection.flush().await.map_err(fatal)?;

        self.hooks.events.emit(&ServerEvent::TlsStarted {
            session_id: self.info.id,
        });

        match self.connection.upgrade(&tls).await {
            Ok(info) => {
                internal!(
                    level = DEBUG,
                    "Connection upgraded to {} with {}",
                    info.proto(),
                    info.cipher()
                );
                self.hooks.events.emit(&ServerEvent::TlsCompleted {
                    session_id: self.info.id,
                    protocol: info.proto(),
                    cipher: info.cipher(),
                });

                self.info.secure = true;
                self.info.tls_protocol = Some(info.proto());
                self.info.tls_cipher = Some(info.cipher());

                // Everything negotiated in the clear is void; the peer
                // must greet again
                self.info.greeting = Greeting::None;
                self.transaction = None;
                self.state = State::Connected;
                self.errors = 0;

                Ok(Flow::Continue)
            }
            Err(err) => {
                self.hooks.events.emit(&ServerEvent::TlsFailed {
                    session_id: self.info.id,
                    error: err.to_string(),
                });
                Err(SessionError::Protocol(format!(
                    "TLS handshake failed: {err}"
                )))
            }
        }
    }
}

/// Write-side failures are session-fatal.
fn fatal(err: ConnectionError) -> SessionError {
    match err {
        ConnectionError::Io(err) => SessionError::Connection(err),
        other => SessionError::Protocol(other.to_string()),
    }
}
