use std::sync::{Arc, atomic::AtomicU64};

use tokio::sync::broadcast;
use zetian_common::{Signal, error::ListenerError};
use zetian_store::{MessageStore, NullStore};

use crate::{
    auth::{CredentialVerifier, DenyAll, Mechanism, Mechanisms},
    config::ServerConfig,
    events::{EventListener, Events},
    filter::{AcceptAll, MailboxFilter},
    limiter::{NoLimit, RateLimiter},
    listener::Listener,
};

/// Every pluggable collaborator one server instance consumes. Shared with
/// each session through an `Arc`.
pub(crate) struct Hooks {
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) filter: Arc<dyn MailboxFilter>,
    pub(crate) verifier: Arc<dyn CredentialVerifier>,
    pub(crate) mechanisms: Mechanisms,
    pub(crate) limiter: Arc<dyn RateLimiter>,
    pub(crate) events: Events,
}

/// One configured SMTP receiver.
///
/// Collaborators default to the safe no-ops (`NullStore`, `AcceptAll`,
/// `DenyAll`, no rate limit); a deployment swaps in what it needs through
/// the builder. All registries are owned by this instance; two servers in
/// one process share nothing.
pub struct Server {
    config: Arc<ServerConfig>,
    hooks: Arc<Hooks>,
    /// Queue-id counter shared by every session of this server.
    queue: Arc<AtomicU64>,
    session_ids: Arc<AtomicU64>,
}

impl Server {
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured endpoint without accepting yet. Useful when the
    /// embedding application needs the ephemeral port before serving.
    pub async fn bind(&self) -> Result<Listener, ListenerError> {
        Listener::bind(
            Arc::clone(&self.config),
            Arc::clone(&self.hooks),
            Arc::clone(&self.queue),
            Arc::clone(&self.session_ids),
        )
        .await
    }

    /// Bind and serve until the shutdown signal fires.
    pub async fn serve(
        &self,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        self.bind().await?.serve(shutdown).await
    }
}

/// Assembles a [`Server`] from a configuration and collaborators.
pub struct ServerBuilder {
    config: ServerConfig,
    store: Arc<dyn MessageStore>,
    filter: Arc<dyn MailboxFilter>,
    verifier: Arc<dyn CredentialVerifier>,
    mechanisms: Mechanisms,
    limiter: Arc<dyn RateLimiter>,
    events: Events,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            store: Arc::new(NullStore),
            filter: Arc::new(AcceptAll),
            verifier: Arc::new(DenyAll),
            mechanisms: Mechanisms::builtin(),
            limiter: Arc::new(NoLimit),
            events: Events::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn MailboxFilter>) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Replace the whole mechanism registry (defaults to PLAIN + LOGIN).
    #[must_use]
    pub fn with_mechanisms(mut self, mechanisms: Mechanisms) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    /// Add one mechanism to the registry.
    #[must_use]
    pub fn register_mechanism(mut self, mechanism: Arc<dyn Mechanism>) -> Self {
        self.mechanisms.register(mechanism);
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Subscribe an event listener.
    #[must_use]
    pub fn subscribe(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.events.subscribe(listener);
        self
    }

    /// Validate the configuration and assemble the server.
    pub fn build(mut self) -> Result<Server, zetian_common::error::ConfigError> {
        self.config.validate()?;

        Ok(Server {
            config: Arc::new(self.config),
            hooks: Arc::new(Hooks {
                store: self.store,
                filter: self.filter,
                verifier: self.verifier,
                mechanisms: self.mechanisms,
                limiter: self.limiter,
                events: self.events,
            }),
            queue: Arc::new(AtomicU64::new(1)),
            session_ids: Arc::new(AtomicU64::new(0)),
        })
    }
}
