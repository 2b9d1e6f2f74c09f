use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use zetian_common::session::SessionInfo;
use zetian_store::ReceivedMessage;

/// Everything observable about a running server.
///
/// Events are delivered synchronously on the emitting session's task, so
/// listeners must be fast and must not block; anything heavier belongs on a
/// channel of the listener's own.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionAccepted {
        peer: SocketAddr,
    },
    ConnectionRejected {
        peer: SocketAddr,
        reason: String,
    },
    SessionCreated {
        session: SessionInfo,
    },
    SessionCompleted {
        session_id: u64,
        messages: u64,
    },
    CommandReceived {
        session_id: u64,
        command: String,
    },
    CommandExecuted {
        session_id: u64,
        command: String,
        code: u16,
    },
    AuthAttempted {
        session_id: u64,
        mechanism: String,
    },
    AuthSucceeded {
        session_id: u64,
        identity: String,
    },
    AuthFailed {
        session_id: u64,
        mechanism: String,
    },
    TlsStarted {
        session_id: u64,
    },
    TlsCompleted {
        session_id: u64,
        protocol: String,
        cipher: String,
    },
    TlsFailed {
        session_id: u64,
        error: String,
    },
    DataTransferStarted {
        session_id: u64,
    },
    DataTransferCompleted {
        session_id: u64,
        bytes: usize,
    },
    RateLimitExceeded {
        peer: IpAddr,
    },
    ErrorOccurred {
        session_id: Option<u64>,
        error: String,
    },
}

/// A subscriber's say on a completed message, folded before the store runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageVerdict {
    #[default]
    Accept,
    Reject {
        code: u16,
        text: String,
    },
}

/// Observer interface for metrics, logging and policy layers.
///
/// Both methods have defaults, so a listener implements only what it needs.
/// The contract is fast and non-throwing; a listener that wants to veto a
/// message does so through the returned [`MessageVerdict`], never by
/// blocking the session.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ServerEvent) {
        let _ = event;
    }

    /// Consulted once per completed message, before the store is invoked.
    fn on_message_received(
        &self,
        session: &SessionInfo,
        message: &ReceivedMessage,
    ) -> MessageVerdict {
        let _ = (session, message);
        MessageVerdict::Accept
    }
}

/// Per-server listener registry. Owned by the [`crate::server::Server`]
/// instance; there is no process-global state.
#[derive(Clone, Default)]
pub struct Events {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl Events {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn emit(&self, event: &ServerEvent) {
        tracing::trace!(?event, "event");
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    /// Fold the subscribers' verdicts; the first `Reject` wins.
    pub(crate) fn message_verdict(
        &self,
        session: &SessionInfo,
        message: &ReceivedMessage,
    ) -> MessageVerdict {
        for listener in &self.listeners {
            if let MessageVerdict::Reject { code, text } =
                listener.on_message_received(session, message)
            {
                return MessageVerdict::Reject { code, text };
            }
        }
        MessageVerdict::Accept
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
