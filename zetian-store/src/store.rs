use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use zetian_common::session::SessionInfo;

use crate::{ReceivedMessage, StoreError};

/// The persistence capability the SMTP engine hands completed messages to.
///
/// Implementations must be safe to share across sessions; the engine makes
/// no further coordination. Failures are classified by [`StoreError`] and
/// mapped onto the SMTP reply sent after the final data terminator.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    async fn save(
        &self,
        session: &SessionInfo,
        message: &ReceivedMessage,
    ) -> Result<(), StoreError>;
}

/// In-memory store, primarily for testing and transient setups.
///
/// An optional capacity bounds memory growth; once full, writes fail
/// transiently so clients retry later.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    messages: Arc<Mutex<Vec<ReceivedMessage>>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Arc::default(),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of everything stored so far, in acceptance order.
    #[must_use]
    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(
        &self,
        _session: &SessionInfo,
        message: &ReceivedMessage,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(capacity) = self.capacity
            && messages.len() >= capacity
        {
            return Err(StoreError::Transient(format!(
                "Memory store capacity exceeded: {}/{capacity} messages",
                messages.len()
            )));
        }

        messages.push(message.clone());
        Ok(())
    }
}

/// Accepts and discards every message. Useful for protocol-only deployments
/// and benchmarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl MessageStore for NullStore {
    async fn save(
        &self,
        _session: &SessionInfo,
        message: &ReceivedMessage,
    ) -> Result<(), StoreError> {
        tracing::trace!(id = %message.id, bytes = message.len(), "Discarding message");
        Ok(())
    }
}

/// Recording store for tests: keeps everything, notifies waiters on each
/// save, and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct TestStore {
    messages: Arc<Mutex<Vec<ReceivedMessage>>>,
    notify: Arc<Notify>,
    fail_with: Arc<Mutex<Option<FailureMode>>>,
}

#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    Transient,
    Permanent,
}

impl TestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail with the given classification.
    pub fn fail_with(&self, mode: FailureMode) {
        *self
            .fail_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(mode);
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn message(&self, index: usize) -> Option<ReceivedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    /// Wait until at least `expected` messages have been stored.
    ///
    /// # Errors
    /// Returns an error if the timeout elapses first.
    pub async fn wait_for_count(
        &self,
        expected: usize,
        timeout: std::time::Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                if self.message_count() >= expected {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
    }
}

#[async_trait]
impl MessageStore for TestStore {
    async fn save(
        &self,
        _session: &SessionInfo,
        message: &ReceivedMessage,
    ) -> Result<(), StoreError> {
        let mode = *self
            .fail_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match mode {
            Some(FailureMode::Transient) => {
                Err(StoreError::Transient("store offline".to_string()))
            }
            Some(FailureMode::Permanent) => {
                Err(StoreError::Permanent("message refused".to_string()))
            }
            None => {
                self.messages
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message.clone());
                self.notify.notify_waiters();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use zetian_common::session::{Greeting, SessionInfo};

    use super::*;
    use crate::ReceivedMessage;

    fn session() -> SessionInfo {
        SessionInfo {
            id: 7,
            peer: "127.0.0.1:50000".parse().unwrap(),
            local: "127.0.0.1:25".parse().unwrap(),
            accepted_at: chrono::Utc::now(),
            secure: false,
            tls_protocol: None,
            tls_cipher: None,
            authenticated: None,
            greeting: Greeting::Ehlo("client.test".to_string()),
        }
    }

    fn message(id: &str) -> ReceivedMessage {
        ReceivedMessage::new(
            id.to_string(),
            7,
            zetian_common::envelope::Envelope::default(),
            b"Subject: t\r\n\r\nbody\r\n".to_vec().into(),
        )
    }

    #[tokio::test]
    async fn memory_store_accepts_until_capacity() {
        let store = MemoryStore::with_capacity(2);
        let session = session();

        store.save(&session, &message("1")).await.unwrap();
        store.save(&session, &message("2")).await.unwrap();

        let err = store.save(&session, &message("3")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn null_store_discards() {
        let store = NullStore;
        store.save(&session(), &message("1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_records_and_notifies() {
        let store = TestStore::new();
        let waiter = store.clone();
        let session = session();

        let handle = tokio::spawn(async move {
            waiter
                .wait_for_count(1, std::time::Duration::from_secs(5))
                .await
        });

        store.save(&session, &message("1")).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(store.message_count(), 1);
        assert_eq!(store.message(0).unwrap().id, "1");
    }

    #[tokio::test]
    async fn test_store_failure_modes() {
        let store = TestStore::new();
        let session = session();

        store.fail_with(FailureMode::Transient);
        assert!(
            store
                .save(&session, &message("1"))
                .await
                .unwrap_err()
                .is_transient()
        );

        store.fail_with(FailureMode::Permanent);
        assert!(
            !store
                .save(&session, &message("2"))
                .await
                .unwrap_err()
                .is_transient()
        );

        assert_eq!(store.message_count(), 0);
    }
}
