use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zetian_common::envelope::Envelope;

/// A fully received message, as handed to the [`crate::MessageStore`].
///
/// `data` starts with the server-generated `Received:` trace header; the
/// bytes after it are exactly what the client transmitted (after
/// dot-unstuffing in DATA mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessage {
    /// Process-unique queue identifier, also echoed in the acceptance reply.
    pub id: String,
    /// The session this message arrived on.
    pub session_id: u64,
    /// Envelope of the completed transaction.
    pub envelope: Envelope,
    /// The raw message bytes, possibly 8-bit or binary.
    #[serde(skip)]
    pub data: Arc<[u8]>,
    /// When the final terminator (or last BDAT chunk) was received.
    pub received_at: DateTime<Utc>,
}

impl ReceivedMessage {
    #[must_use]
    pub fn new(id: String, session_id: u64, envelope: Envelope, data: Arc<[u8]>) -> Self {
        Self {
            id,
            session_id,
            envelope,
            data,
            received_at: Utc::now(),
        }
    }

    /// Number of raw bytes, trace header included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parse the RFC 5322 header block into a name/value view.
    ///
    /// Binary bodies are fine: parsing stops at the first empty line and
    /// never touches the payload.
    #[must_use]
    pub fn headers(&self) -> HeaderView {
        mailparse::parse_headers(&self.data).map_or_else(
            |_| HeaderView::default(),
            |(headers, _)| HeaderView {
                headers: headers
                    .iter()
                    .map(|header| (header.get_key(), header.get_value()))
                    .collect(),
            },
        )
    }
}

/// Parsed header pairs in transmission order, with case-insensitive lookup.
#[derive(Debug, Default, Clone)]
pub struct HeaderView {
    headers: Vec<(String, String)>,
}

impl HeaderView {
    /// The first header with the given name, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All headers in transmission order.
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.get("Subject")
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.get("Message-ID")
    }

    #[must_use]
    pub fn date(&self) -> Option<&str> {
        self.get("Date")
    }

    #[must_use]
    pub fn priority(&self) -> Option<&str> {
        self.get("Priority").or_else(|| self.get("X-Priority"))
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use zetian_common::envelope::Envelope;

    use super::ReceivedMessage;

    fn message(data: &[u8]) -> ReceivedMessage {
        ReceivedMessage::new(
            "00000001".to_string(),
            1,
            Envelope::default(),
            data.to_vec().into(),
        )
    }

    #[test]
    fn header_extraction() {
        let message = message(
            b"Received: from client.test by zetian.example with ESMTP id 1;\r\n\
              \tMon, 01 Jan 2024 00:00:00 +0000\r\n\
              Subject: greetings\r\n\
              Message-ID: <abc@client.test>\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              body\r\n",
        );

        let headers = message.headers();
        assert_eq!(headers.subject(), Some("greetings"));
        assert_eq!(headers.message_id(), Some("<abc@client.test>"));
        assert_eq!(headers.content_type(), Some("text/plain"));
        assert_eq!(headers.date(), None);
        assert!(headers.get("Received").is_some());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let message = message(b"Subject: hi\r\n\r\n");
        assert_eq!(message.headers().get("sUbJeCt"), Some("hi"));
    }

    #[test]
    fn binary_payload_is_tolerated() {
        let mut data = b"Subject: bin\r\n\r\n".to_vec();
        data.extend([0u8, 159, 146, 150, 255]);
        let message = message(&data);
        assert_eq!(message.headers().subject(), Some("bin"));
        assert_eq!(message.len(), data.len());
    }
}
