use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use zetian_common::{Signal, error::ListenerError, internal};

use crate::{
    admission::{AdmissionDenied, ConnectionGauge},
    config::ServerConfig,
    connection::{self, Connection},
    events::ServerEvent,
    server::Hooks,
    session::Session,
};

/// A bound accept loop: admission, session spawning, graceful shutdown.
pub struct Listener {
    listener: TcpListener,
    local: SocketAddr,
    config: Arc<ServerConfig>,
    hooks: Arc<Hooks>,
    queue: Arc<AtomicU64>,
    session_ids: Arc<AtomicU64>,
    gauge: ConnectionGauge,
    /// Present when this listener handshakes at accept time (implicit TLS).
    implicit_tls: Option<TlsAcceptor>,
}

impl Listener {
    pub(crate) async fn bind(
        config: Arc<ServerConfig>,
        hooks: Arc<Hooks>,
        queue: Arc<AtomicU64>,
        session_ids: Arc<AtomicU64>,
    ) -> Result<Self, ListenerError> {
        let socket = config.socket();
        let listener = TcpListener::bind(socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: socket.to_string(),
                source,
            })?;
        let local = listener.local_addr().map_err(ListenerError::AcceptFailed)?;

        let implicit_tls = if config.implicit_tls {
            match config.tls.as_ref() {
                Some(tls) => Some(connection::acceptor(tls).map_err(|err| {
                    ListenerError::Config(zetian_common::error::ConfigError::InvalidConfiguration {
                        field: "tls".to_string(),
                        reason: err.to_string(),
                    })
                })?),
                None => {
                    return Err(ListenerError::Config(
                        zetian_common::error::ConfigError::MissingField("tls"),
                    ));
                }
            }
        } else {
            None
        };

        Ok(Self {
            listener,
            local,
            config,
            hooks,
            queue,
            session_ids,
            gauge: ConnectionGauge::new(),
            implicit_tls,
        })
    }

    /// The bound address; useful when the configuration asked for port 0.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept until shutdown, then drain: stop accepting, let sessions
    /// finish within the grace period, force-close the rest.
    pub async fn serve(
        self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        internal!(level = INFO, "Serving SMTP on {}", self.local);

        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                connection = self.listener.accept() => {
                    match connection {
                        Ok((stream, peer)) => {
                            sessions.retain(|handle| !handle.is_finished());
                            self.accept(stream, peer, &mut sessions, &shutdown);
                        }
                        Err(err) => {
                            internal!(level = WARN, "Accept failed: {err}");
                        }
                    }
                }
            }
        }

        internal!(
            level = INFO,
            "SMTP listener {} received shutdown, draining {} sessions",
            self.local,
            sessions.iter().filter(|handle| !handle.is_finished()).count()
        );

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let aborts: Vec<_> = sessions.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(grace, join_all(sessions)).await.is_err() {
            internal!(level = WARN, "Grace period elapsed, force-closing sessions");
            for abort in aborts {
                abort.abort();
            }
        }

        Ok(())
    }

    /// Admission checks, then hand the connection to its own task.
    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        sessions: &mut Vec<JoinHandle<()>>,
        shutdown: &broadcast::Receiver<Signal>,
    ) {
        tracing::debug!("Connection received on {} from {peer}", self.local);

        if !self.hooks.limiter.is_allowed(peer.ip()) {
            self.hooks
                .events
                .emit(&ServerEvent::RateLimitExceeded { peer: peer.ip() });
            self.hooks.events.emit(&ServerEvent::ConnectionRejected {
                peer,
                reason: "rate limit exceeded".to_string(),
            });
            tokio::spawn(refuse(stream, "421 4.3.2 Rate limit exceeded"));
            return;
        }
        self.hooks.limiter.record_request(peer.ip());

        let permit = match self.gauge.try_acquire(
            peer.ip(),
            self.config.max_connections,
            self.config.max_connections_per_ip,
        ) {
            Ok(permit) => permit,
            Err(denied) => {
                let reason = match denied {
                    AdmissionDenied::TooManySessions => "too many concurrent sessions",
                    AdmissionDenied::TooManyFromIp => "too many sessions from address",
                };
                self.hooks.events.emit(&ServerEvent::ConnectionRejected {
                    peer,
                    reason: reason.to_string(),
                });
                tokio::spawn(refuse(stream, "421 4.3.2 Too many concurrent sessions"));
                return;
            }
        };

        self.hooks
            .events
            .emit(&ServerEvent::ConnectionAccepted { peer });

        let id = self
            .session_ids
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let config = Arc::clone(&self.config);
        let hooks = Arc::clone(&self.hooks);
        let queue = Arc::clone(&self.queue);
        let acceptor = self.implicit_tls.clone();
        let local = self.local;
        let shutdown = shutdown.resubscribe();

        sessions.push(tokio::spawn(async move {
            // Held for the lifetime of the task so admission slots free up
            // even when a session is aborted
            let _permit = permit;
            run_session(id, stream, peer, local, config, hooks, queue, acceptor, shutdown).await;
        }));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    config: Arc<ServerConfig>,
    hooks: Arc<Hooks>,
    queue: Arc<AtomicU64>,
    acceptor: Option<TlsAcceptor>,
    shutdown: broadcast::Receiver<Signal>,
) {
    let connection = if let Some(acceptor) = acceptor {
        let handshake = tokio::time::timeout(
            Duration::from_secs(config.timeouts.command_secs),
            acceptor.accept(stream),
        );
        match handshake.await {
            Ok(Ok(stream)) => Connection::tls(stream),
            Ok(Err(err)) => {
                internal!(level = DEBUG, "Implicit TLS handshake failed: {err}");
                hooks.events.emit(&ServerEvent::ErrorOccurred {
                    session_id: None,
                    error: format!("implicit TLS handshake failed: {err}"),
                });
                return;
            }
            Err(_) => {
                internal!(level = DEBUG, "Implicit TLS handshake timed out");
                return;
            }
        }
    } else {
        Connection::plain(stream)
    };

    let mut session = Session::create(id, connection, peer, local, config, Arc::clone(&hooks), queue);
    hooks.events.emit(&ServerEvent::SessionCreated {
        session: session.info().clone(),
    });

    let result = session.run(shutdown).await;
    match &result {
        Ok(()) => internal!(level = DEBUG, "Session {id} finished"),
        Err(err) if err.is_shutdown() => {
            internal!(level = DEBUG, "Session {id} closed by shutdown");
        }
        Err(err) => {
            internal!(level = DEBUG, "Session {id} ended: {err}");
            hooks.events.emit(&ServerEvent::ErrorOccurred {
                session_id: Some(id),
                error: err.to_string(),
            });
        }
    }

    hooks.events.emit(&ServerEvent::SessionCompleted {
        session_id: id,
        messages: session.messages_accepted(),
    });
}

/// One-line refusal for connections that never become sessions.
async fn refuse(mut stream: TcpStream, line: &'static str) {
    let _ = stream.write_all(format!("{line}\r\n").as_bytes()).await;
    let _ = stream.shutdown().await;
}
