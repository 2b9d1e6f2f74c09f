//! The mailbox filter capability: protocol-level accept/reject hooks
//! consulted at MAIL FROM and RCPT TO.
//!
//! Filters never see message bodies; anything that needs the payload runs
//! as post-processing on the event side instead, so the data phase stays
//! free of buffering detours.

use ahash::AHashSet;
use async_trait::async_trait;
use zetian_common::{address::Address, session::SessionInfo};

/// Admission decisions for senders and recipients.
///
/// May suspend (verdicts often live behind sockets or databases), must be
/// cheap to share, and should answer quickly; the client is waiting on a
/// reply either way. A `false` from either hook turns into `550`.
#[async_trait]
pub trait MailboxFilter: Send + Sync {
    /// Consulted when MAIL FROM arrives; `sender` is `None` for the null
    /// reverse-path and `declared_size` carries the SIZE parameter.
    async fn can_accept_from(
        &self,
        session: &SessionInfo,
        sender: Option<&Address>,
        declared_size: Option<usize>,
    ) -> bool {
        let _ = (session, sender, declared_size);
        true
    }

    /// Consulted per RCPT TO. Earlier accepted recipients stay accepted
    /// regardless of this verdict.
    async fn can_deliver_to(
        &self,
        session: &SessionInfo,
        recipient: &Address,
        sender: Option<&Address>,
    ) -> bool {
        let _ = (session, recipient, sender);
        true
    }
}

/// Accepts everything; the default filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl MailboxFilter for AcceptAll {}

/// Domain-based allow/deny rules.
///
/// Deny lists are checked first. When an allow list is present, only its
/// domains pass; an absent allow list passes everything not denied.
/// Addresses without a domain (e.g. `postmaster`) pass unless an allow
/// list is in force.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    allowed_senders: Option<AHashSet<String>>,
    denied_senders: AHashSet<String>,
    allowed_recipients: Option<AHashSet<String>>,
    denied_recipients: AHashSet<String>,
}

impl DomainPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow_sender_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_senders
            .get_or_insert_with(AHashSet::new)
            .insert(domain.into().to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn deny_sender_domain(mut self, domain: impl Into<String>) -> Self {
        self.denied_senders
            .insert(domain.into().to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn allow_recipient_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_recipients
            .get_or_insert_with(AHashSet::new)
            .insert(domain.into().to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn deny_recipient_domain(mut self, domain: impl Into<String>) -> Self {
        self.denied_recipients
            .insert(domain.into().to_ascii_lowercase());
        self
    }

    fn domain_passes(
        domain: Option<&str>,
        allowed: Option<&AHashSet<String>>,
        denied: &AHashSet<String>,
    ) -> bool {
        let Some(domain) = domain.map(str::to_ascii_lowercase) else {
            return allowed.is_none();
        };

        if denied.contains(&domain) {
            return false;
        }

        allowed.is_none_or(|allowed| allowed.contains(&domain))
    }
}

#[async_trait]
impl MailboxFilter for DomainPolicy {
    async fn can_accept_from(
        &self,
        _session: &SessionInfo,
        sender: Option<&Address>,
        _declared_size: Option<usize>,
    ) -> bool {
        // The null reverse-path is always deliverable; refusing bounces
        // breaks the mail system
        let Some(sender) = sender else {
            return true;
        };

        Self::domain_passes(
            sender.domain(),
            self.allowed_senders.as_ref(),
            &self.denied_senders,
        )
    }

    async fn can_deliver_to(
        &self,
        _session: &SessionInfo,
        recipient: &Address,
        _sender: Option<&Address>,
    ) -> bool {
        Self::domain_passes(
            recipient.domain(),
            self.allowed_recipients.as_ref(),
            &self.denied_recipients,
        )
    }
}
