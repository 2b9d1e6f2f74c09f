use thiserror::Error;

/// Failure classification for the persistence boundary.
///
/// The SMTP engine maps `Transient` to a 4xx reply (the client should retry
/// later) and `Permanent` to a 5xx reply (the message is refused for good).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is temporarily unable to accept the message.
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// The store refuses the message permanently.
    #[error("Permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Returns `true` when the client should be told to retry (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod test {
    use super::StoreError;

    #[test]
    fn classification() {
        assert!(StoreError::Transient("disk full".to_string()).is_transient());
        assert!(!StoreError::Permanent("rejected".to_string()).is_transient());
    }

    #[test]
    fn display() {
        assert_eq!(
            StoreError::Transient("disk full".to_string()).to_string(),
            "Transient store failure: disk full"
        );
    }
}
