//! Body reception: DATA dot-stuffed streams and BDAT counted chunks, plus
//! message finalization (trace header, event verdicts, the store call).

use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncWrite};
use zetian_common::{
    envelope::BodyType, error::SessionError, internal, session::SessionInfo, status::Status,
};
use zetian_store::ReceivedMessage;

use super::{Flow, Session, TransferMode, fatal};
use crate::{
    error::ConnectionError,
    events::{MessageVerdict, ServerEvent},
    reply::Reply,
    state::State,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// DATA: `354`, then read until `<CRLF>.<CRLF>` under the data timer.
    pub(super) async fn handle_data(&mut self) -> Result<Flow, SessionError> {
        let Some(transaction) = self.transaction.as_ref() else {
            self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "No transaction in progress",
            ));
            return Ok(Flow::Continue);
        };

        if transaction.mode() == Some(TransferMode::Chunked) {
            self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "BDAT transaction in progress",
            ));
            return Ok(Flow::Continue);
        }

        // RFC 3030 section 3: binary messages have no line structure for
        // dot-stuffing to work with
        if transaction.envelope().body_type() == BodyType::BinaryMime {
            self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "BINARYMIME requires BDAT",
            ));
            return Ok(Flow::Continue);
        }

        if let Some(transaction) = self.transaction.as_mut() {
            transaction.set_mode(TransferMode::Data);
        }

        self.reply(Reply::new(
            Status::StartMailInput,
            "Start mail input; end with <CRLF>.<CRLF>",
        ));
        self.connection.flush().await.map_err(fatal)?;

        self.hooks.events.emit(&ServerEvent::DataTransferStarted {
            session_id: self.info.id,
        });

        let body = match tokio::time::timeout(
            self.data_timeout(),
            self.connection.read_data(self.config.max_message_size),
        )
        .await
        {
            Err(_) => {
                self.hangup(Status::Unavailable, "Timeout during message transfer")
                    .await;
                return Err(SessionError::Timeout(self.config.timeouts.data_secs));
            }
            Ok(Err(ConnectionError::Closed)) => {
                // End of stream before the terminator; nobody is left to
                // read a 451
                self.transaction = None;
                return Err(SessionError::Protocol(
                    "Connection closed during DATA".to_string(),
                ));
            }
            Ok(Err(ConnectionError::Io(err))) => return Err(SessionError::Connection(err)),
            Ok(Err(other)) => return Err(SessionError::Protocol(other.to_string())),
            Ok(Ok(body)) => body,
        };

        if body.oversized {
            self.transaction = None;
            self.state = State::Greeted;
            self.reply(Reply::new(
                Status::ExceededStorage,
                "5.3.4 Message size exceeds limit",
            ));
            return Ok(Flow::Continue);
        }

        let payload = unstuff(&body.bytes);
        self.finalize(payload).await;
        Ok(Flow::Continue)
    }

    /// BDAT: read exactly `size` bytes, then either acknowledge the chunk
    /// or, on LAST, finalize the message.
    pub(super) async fn handle_bdat(&mut self, size: usize, last: bool) -> Result<Flow, SessionError> {
        if !self.config.chunking {
            self.reply(Reply::new(Status::NotImplemented, "Command not implemented"));
            return Ok(Flow::Continue);
        }

        let Some(transaction) = self.transaction.as_ref() else {
            self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "No transaction in progress",
            ));
            return Ok(Flow::Continue);
        };

        if transaction.mode() == Some(TransferMode::Data) {
            self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "DATA transaction in progress",
            ));
            return Ok(Flow::Continue);
        }

        let first_chunk = transaction.mode().is_none();
        if let Some(transaction) = self.transaction.as_mut() {
            transaction.set_mode(TransferMode::Chunked);
        }
        if first_chunk {
            self.hooks.events.emit(&ServerEvent::DataTransferStarted {
                session_id: self.info.id,
            });
        }

        // The declared octets follow no matter what we think of them;
        // consume them to keep the command stream framed
        let chunk = match tokio::time::timeout(
            self.data_timeout(),
            self.connection.read_exact_chunk(size),
        )
        .await
        {
            Err(_) => {
                self.hangup(Status::Unavailable, "Timeout during chunk transfer")
                    .await;
                return Err(SessionError::Timeout(self.config.timeouts.data_secs));
            }
            Ok(Err(ConnectionError::Closed)) => {
                self.transaction = None;
                return Err(SessionError::Protocol(
                    "Connection closed during BDAT".to_string(),
                ));
            }
            Ok(Err(ConnectionError::Io(err))) => return Err(SessionError::Connection(err)),
            Ok(Err(other)) => return Err(SessionError::Protocol(other.to_string())),
            Ok(Ok(chunk)) => chunk,
        };

        let max = self.config.max_message_size;
        let Some(transaction) = self.transaction.as_mut() else {
            self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "No transaction in progress",
            ));
            return Ok(Flow::Continue);
        };

        if !transaction.is_discarding()
            && max > 0
            && transaction.buffered_len().saturating_add(chunk.len()) > max
        {
            // Keep consuming chunks so framing survives, but the message
            // itself is lost
            transaction.start_discarding();
        }
        transaction.append_chunk(&chunk);

        if transaction.is_discarding() {
            if last {
                self.transaction = None;
                self.state = State::Greeted;
            }
            self.reply(Reply::new(
                Status::ExceededStorage,
                "5.3.4 Message size exceeds limit",
            ));
            return Ok(Flow::Continue);
        }

        if last {
            let payload = transaction.take_buffer();
            self.finalize(payload).await;
        } else {
            self.reply(Reply::new(
                Status::Ok,
                format!("Chunk accepted, {} octets", chunk.len()),
            ));
        }

        Ok(Flow::Continue)
    }

    /// Shared tail of DATA and BDAT-LAST: stamp the trace header, let the
    /// subscribers vote, hand the message to the store and map the result
    /// onto the final reply. The transaction ends here no matter what.
    pub(super) async fn finalize(&mut self, payload: Vec<u8>) {
        let Some(transaction) = self.transaction.take() else {
            return self.reply(Reply::new(
                Status::InvalidCommandSequence,
                "No transaction in progress",
            ));
        };
        self.state = State::Greeted;

        let queue_id = format!("{:08X}", self.queue.fetch_add(1, Ordering::Relaxed));

        let mut data = received_header(&self.info, &self.config.server_name, &queue_id);
        data.extend_from_slice(&payload);
        let bytes = data.len();

        let message = ReceivedMessage::new(
            queue_id.clone(),
            self.info.id,
            transaction.into_envelope(),
            data.into(),
        );

        self.hooks.events.emit(&ServerEvent::DataTransferCompleted {
            session_id: self.info.id,
            bytes,
        });

        // Subscribers get the first word; the first rejection wins
        if let MessageVerdict::Reject { code, text } =
            self.hooks.events.message_verdict(&self.info, &message)
        {
            return self.reply(Reply::new(Status::from(code), text));
        }

        match self.hooks.store.save(&self.info, &message).await {
            Ok(()) => {
                internal!(level = INFO, "Message {queue_id} accepted ({bytes} bytes)");
                self.messages += 1;
                self.reply(Reply::new(
                    Status::Ok,
                    format!("2.6.0 Message accepted, queued as {queue_id}"),
                ));
            }
            Err(err) => {
                internal!(level = ERROR, "Store refused message {queue_id}: {err}");
                self.hooks.events.emit(&ServerEvent::ErrorOccurred {
                    session_id: Some(self.info.id),
                    error: err.to_string(),
                });

                let (status, fallback) = if err.is_transient() {
                    (Status::ActionAborted, "Temporary failure, try again later")
                } else {
                    (Status::TransactionFailed, "Message rejected")
                };
                let text = if self.config.detailed_errors {
                    err.to_string()
                } else {
                    fallback.to_string()
                };
                self.reply(Reply::new(status, text));
            }
        }
    }
}

/// Strip the leading dot from dot-stuffed lines (RFC 5321 section
/// 4.5.2). The terminator line itself never reaches this function.
pub(crate) fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut start_of_line = true;

    for &byte in body {
        if start_of_line && byte == b'.' {
            start_of_line = false;
            continue;
        }
        out.push(byte);
        start_of_line = byte == b'\n';
    }

    out
}

/// The RFC 5321 trace header prepended to every stored message. Bytes
/// after this header are exactly what the client transmitted.
pub(crate) fn received_header(info: &SessionInfo, server_name: &str, queue_id: &str) -> Vec<u8> {
    format!(
        "Received: from {from} ({peer})\r\n\tby {server_name} with {protocol} id {queue_id};\r\n\t{date}\r\n",
        from = info.greeting.domain().unwrap_or("unknown"),
        peer = info.peer.ip(),
        protocol = info.protocol(),
        date = chrono::Utc::now().to_rfc2822(),
    )
    .into_bytes()
}
