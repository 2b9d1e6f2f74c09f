use zetian_common::envelope::Envelope;

/// How the body of the current transaction is being transferred. Set by the
/// first DATA or BDAT command; the two must not be mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferMode {
    Data,
    Chunked,
}

/// One open mail transaction: the envelope built by MAIL FROM / RCPT TO and
/// any BDAT chunks accumulated so far.
#[derive(Debug)]
pub(crate) struct Transaction {
    envelope: Envelope,
    mode: Option<TransferMode>,
    buffer: Vec<u8>,
    /// The transaction is doomed (size cap breached mid-BDAT) but chunks
    /// keep arriving; consume and drop them until LAST restores framing.
    discarding: bool,
}

impl Transaction {
    pub(crate) const fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            mode: None,
            buffer: Vec::new(),
            discarding: false,
        }
    }

    pub(crate) const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub(crate) const fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    pub(crate) const fn mode(&self) -> Option<TransferMode> {
        self.mode
    }

    pub(crate) const fn set_mode(&mut self, mode: TransferMode) {
        self.mode = Some(mode);
    }

    pub(crate) const fn is_discarding(&self) -> bool {
        self.discarding
    }

    pub(crate) fn start_discarding(&mut self) {
        self.discarding = true;
        self.buffer = Vec::new();
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn append_chunk(&mut self, chunk: &[u8]) {
        if !self.discarding {
            self.buffer.extend_from_slice(chunk);
        }
    }

    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub(crate) fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

#[cfg(test)]
mod test {
    use zetian_common::envelope::Envelope;

    use super::{Transaction, TransferMode};

    #[test]
    fn chunks_accumulate_in_order() {
        let mut transaction = Transaction::new(Envelope::default());
        transaction.set_mode(TransferMode::Chunked);

        transaction.append_chunk(b"hello");
        transaction.append_chunk(b" world");

        assert_eq!(transaction.buffered_len(), 11);
        assert_eq!(transaction.take_buffer(), b"hello world");
    }

    #[test]
    fn discarding_drops_chunks() {
        let mut transaction = Transaction::new(Envelope::default());
        transaction.append_chunk(b"kept");
        transaction.start_discarding();
        transaction.append_chunk(b"dropped");

        assert!(transaction.is_discarding());
        assert_eq!(transaction.buffered_len(), 0);
    }

    #[test]
    fn mode_is_sticky() {
        let mut transaction = Transaction::new(Envelope::default());
        assert_eq!(transaction.mode(), None);

        transaction.set_mode(TransferMode::Chunked);
        assert_eq!(transaction.mode(), Some(TransferMode::Chunked));
    }
}
