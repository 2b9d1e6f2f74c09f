use std::{fs::File, io::BufReader, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite,
        SupportedProtocolVersion,
        pki_types::{CertificateDer, PrivateKeyDer},
        version,
    },
    server::TlsStream,
};

use crate::{
    config::{TlsContext, TlsVersion},
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
    reply::Reply,
};

/// Maximum command line length in octets, CRLF included (RFC 5321
/// section 4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 512;

const FILL_SIZE: usize = 8192;

/// Negotiated TLS parameters, recorded on the session after an upgrade.
#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    ciphers: SupportedCipherSuite,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("protocol version".to_string()))?,
            ciphers: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("cipher suite".to_string()))?,
        })
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version.as_str().map(str::to_string).unwrap_or_default()
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.ciphers
            .suite()
            .as_str()
            .map(str::to_string)
            .unwrap_or_default()
    }
}

enum Transport<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Placeholder while a handshake owns the stream, and the terminal
    /// state after a failed upgrade. Reads as end-of-stream.
    Closed,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport<Stream> {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
            Self::Closed => Ok(0),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(buf).await,
            Self::Tls(stream) => stream.write_all(buf).await,
            Self::Closed => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await,
            Self::Tls(stream) => stream.flush().await,
            Self::Closed => Ok(()),
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
            Self::Closed => Ok(()),
        }
    }
}

/// The body bytes of one DATA phase, terminator excluded and dot-stuffing
/// still in place.
#[derive(Debug)]
pub(crate) struct DataBody {
    pub bytes: Vec<u8>,
    /// The payload overran the size cap; `bytes` is truncated and the
    /// remainder was drained up to the terminator.
    pub oversized: bool,
}

/// A bidirectional SMTP transport with line framing, buffered reads and
/// deferred reply writes (for PIPELINING).
///
/// The plain transport is replaced by TLS in place via [`Connection::upgrade`];
/// read buffers are dropped across the upgrade so that bytes a client
/// pre-sent before the handshake never survive into the secure channel.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    transport: Transport<Stream>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub(crate) fn plain(stream: Stream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            read_buf: Vec::new(),
            write_buf: Vec::new(),
        }
    }

    pub(crate) fn tls(stream: TlsStream<Stream>) -> Self {
        Self {
            transport: Transport::Tls(Box::new(stream)),
            read_buf: Vec::new(),
            write_buf: Vec::new(),
        }
    }

    pub(crate) const fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    async fn fill(&mut self) -> ConnectionResult<usize> {
        let mut chunk = [0u8; FILL_SIZE];
        let bytes_read = self.transport.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..bytes_read]);
        Ok(bytes_read)
    }

    /// Read one CRLF-terminated line, without the terminator.
    ///
    /// A line exceeding `limit` octets (CRLF included) is consumed in full
    /// and reported as [`ConnectionError::LineTooLong`], leaving the stream
    /// positioned at the next line.
    pub(crate) async fn read_line(&mut self, limit: usize) -> ConnectionResult<Vec<u8>> {
        loop {
            if let Some(pos) = find_crlf(&self.read_buf) {
                if pos + 2 > limit {
                    self.read_buf.drain(..pos + 2);
                    return Err(ConnectionError::LineTooLong);
                }

                let line = self.read_buf[..pos].to_vec();
                self.read_buf.drain(..pos + 2);
                return Ok(line);
            }

            if self.read_buf.len() > limit {
                self.discard_line().await?;
                return Err(ConnectionError::LineTooLong);
            }

            if self.fill().await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Consume the remainder of an over-long line through its CRLF.
    async fn discard_line(&mut self) -> ConnectionResult<()> {
        loop {
            if let Some(pos) = find_crlf(&self.read_buf) {
                self.read_buf.drain(..pos + 2);
                return Ok(());
            }

            // Keep a trailing CR in case the terminator is split across reads
            let keep = usize::from(self.read_buf.last() == Some(&b'\r'));
            let len = self.read_buf.len();
            self.read_buf.drain(..len - keep);

            if self.fill().await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Read a DATA-mode body up to (and excluding) the `<CRLF>.<CRLF>`
    /// terminator.
    ///
    /// With `max_size > 0`, accumulation stops at the cap but the stream is
    /// still drained through the terminator so the session can reply 552
    /// and carry on.
    pub(crate) async fn read_data(&mut self, max_size: usize) -> ConnectionResult<DataBody> {
        let mut body: Vec<u8> = Vec::new();
        let mut oversized = false;
        let mut trimmed = false;
        let mut search_from = 0;

        loop {
            if !self.read_buf.is_empty() {
                body.append(&mut self.read_buf);
            }

            // A terminator at the very start of the body is an empty message
            if !trimmed && body.starts_with(b".\r\n") {
                let leftover = body.split_off(3);
                self.read_buf = leftover;
                return Ok(DataBody {
                    bytes: Vec::new(),
                    oversized,
                });
            }

            if let Some(pos) = find_pattern(&body[search_from..], b"\r\n.\r\n") {
                let pos = search_from + pos;
                let leftover = body.split_off(pos + 5);
                self.read_buf = leftover;

                body.truncate(pos + 2);
                if oversized {
                    body.clear();
                }
                return Ok(DataBody {
                    bytes: body,
                    oversized,
                });
            }

            search_from = body.len().saturating_sub(4);

            if max_size > 0 && !oversized && body.len() > max_size {
                oversized = true;
            }

            if oversized {
                // The payload is doomed; keep only the tail needed to spot
                // the terminator across a read boundary
                body.drain(..body.len().saturating_sub(4));
                search_from = 0;
                trimmed = true;
            }

            if self.fill().await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Read exactly `size` bytes for one BDAT chunk. No framing, no
    /// terminator scanning.
    pub(crate) async fn read_exact_chunk(&mut self, size: usize) -> ConnectionResult<Vec<u8>> {
        while self.read_buf.len() < size {
            if self.fill().await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }

        let remainder = self.read_buf.split_off(size);
        let chunk = std::mem::replace(&mut self.read_buf, remainder);
        Ok(chunk)
    }

    /// Whether a complete command line is already buffered. Used to decide
    /// when a pipelined batch is exhausted and replies must be flushed.
    pub(crate) fn has_buffered_line(&self) -> bool {
        find_crlf(&self.read_buf).is_some()
    }

    /// Drop bytes the client sent ahead of a TLS handshake.
    pub(crate) fn discard_buffered(&mut self) {
        self.read_buf.clear();
    }

    /// Queue a reply. Nothing hits the wire until [`Connection::flush`].
    pub(crate) fn enqueue(&mut self, reply: &Reply) {
        self.write_buf.extend_from_slice(&reply.to_wire());
    }

    pub(crate) async fn flush(&mut self) -> ConnectionResult<()> {
        if !self.write_buf.is_empty() {
            let buffer = std::mem::take(&mut self.write_buf);
            self.transport.write_all(&buffer).await?;
        }
        self.transport.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.transport.shutdown().await;
    }

    /// Replace the transport with TLS in place.
    ///
    /// Any bytes buffered before the handshake are dropped: a client that
    /// pipelines data past STARTTLS is staging a plaintext injection. On
    /// handshake failure the connection becomes unusable and the session
    /// must close.
    pub(crate) async fn upgrade(&mut self, tls_context: &TlsContext) -> TlsResult<TlsInfo> {
        tracing::debug!("Upgrading connection ...");

        let acceptor = acceptor(tls_context)?;
        self.discard_buffered();
        self.write_buf.clear();

        match std::mem::replace(&mut self.transport, Transport::Closed) {
            Transport::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;
                self.transport = Transport::Tls(Box::new(stream));
                Ok(info)
            }
            transport @ Transport::Tls(_) => {
                self.transport = transport;
                Err(TlsError::Rustls(
                    "Connection is already encrypted".to_string(),
                ))
            }
            Transport::Closed => Err(TlsError::Rustls("Connection is closed".to_string())),
        }
    }
}

fn load_certs<P: AsRef<std::path::Path>>(path: &P) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn load_keys<P: AsRef<std::path::Path>>(path: &P) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = path.as_ref().display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

/// Build a TLS acceptor from PEM material and the configured protocol list.
/// Used both for STARTTLS upgrades and implicit-TLS accepts.
pub(crate) fn acceptor(tls_context: &TlsContext) -> TlsResult<TlsAcceptor> {
    let certs = load_certs(&tls_context.certificate).map_err(|e| TlsError::CertificateLoad {
        path: tls_context.certificate.display().to_string(),
        source: e,
    })?;
    let keys = load_keys(&tls_context.key)?;

    let builder = if tls_context.protocols.is_empty() {
        ServerConfig::builder()
    } else {
        let versions: Vec<&'static SupportedProtocolVersion> = tls_context
            .protocols
            .iter()
            .map(|proto| match proto {
                TlsVersion::Tls12 => &version::TLS12,
                TlsVersion::Tls13 => &version::TLS13,
            })
            .collect();
        ServerConfig::builder_with_protocol_versions(&versions)
    };

    let config = builder.with_no_client_auth().with_single_cert(certs, keys)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    find_pattern(buffer, b"\r\n")
}

fn find_pattern(buffer: &[u8], pattern: &[u8]) -> Option<usize> {
    buffer
        .windows(pattern.len())
        .position(|window| window == pattern)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;
    use zetian_common::status::Status;

    use super::{Connection, MAX_COMMAND_LINE, find_pattern};
    use crate::{error::ConnectionError, reply::Reply};

    fn connection(input: &[u8]) -> Connection<Cursor<Vec<u8>>> {
        Connection::plain(Cursor::new(input.to_vec()))
    }

    #[tokio::test]
    async fn reads_lines() {
        let mut conn = connection(b"EHLO client.test\r\nNOOP\r\n");

        assert_eq!(
            conn.read_line(MAX_COMMAND_LINE).await.unwrap(),
            b"EHLO client.test"
        );
        assert_eq!(conn.read_line(MAX_COMMAND_LINE).await.unwrap(), b"NOOP");
        assert!(matches!(
            conn.read_line(MAX_COMMAND_LINE).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn line_limit_is_inclusive_of_crlf() {
        // 510 octets of content + CRLF = exactly 512: accepted
        let line = "N".repeat(510);
        let mut conn = connection(format!("{line}\r\n").as_bytes());
        assert_eq!(conn.read_line(MAX_COMMAND_LINE).await.unwrap().len(), 510);

        // 511 octets of content + CRLF = 513: rejected, stream stays usable
        let line = "N".repeat(511);
        let mut conn = connection(format!("{line}\r\nNOOP\r\n").as_bytes());
        assert!(matches!(
            conn.read_line(MAX_COMMAND_LINE).await,
            Err(ConnectionError::LineTooLong)
        ));
        assert_eq!(conn.read_line(MAX_COMMAND_LINE).await.unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn grossly_oversized_lines_are_drained() {
        let line = "X".repeat(100_000);
        let mut conn = connection(format!("{line}\r\nQUIT\r\n").as_bytes());
        assert!(matches!(
            conn.read_line(MAX_COMMAND_LINE).await,
            Err(ConnectionError::LineTooLong)
        ));
        assert_eq!(conn.read_line(MAX_COMMAND_LINE).await.unwrap(), b"QUIT");
    }

    #[tokio::test]
    async fn data_body_stops_at_terminator() {
        let mut conn = connection(b"Subject: hi\r\n\r\nhello\r\n.\r\nQUIT\r\n");

        let body = conn.read_data(0).await.unwrap();
        assert!(!body.oversized);
        assert_eq!(body.bytes, b"Subject: hi\r\n\r\nhello\r\n");

        // Pipelined command after the terminator is preserved
        assert_eq!(conn.read_line(MAX_COMMAND_LINE).await.unwrap(), b"QUIT");
    }

    #[tokio::test]
    async fn empty_data_body() {
        let mut conn = connection(b".\r\nQUIT\r\n");
        let body = conn.read_data(0).await.unwrap();
        assert_eq!(body.bytes, b"");
        assert_eq!(conn.read_line(MAX_COMMAND_LINE).await.unwrap(), b"QUIT");
    }

    #[tokio::test]
    async fn oversized_data_is_drained_to_terminator() {
        let mut payload = b"Subject: big\r\n\r\n".to_vec();
        payload.extend(std::iter::repeat_n(b'x', 50_000));
        payload.extend_from_slice(b"\r\n.\r\nNOOP\r\n");

        let mut conn = connection(&payload);
        let body = conn.read_data(1024).await.unwrap();
        assert!(body.oversized);
        assert!(body.bytes.is_empty());
        assert_eq!(conn.read_line(MAX_COMMAND_LINE).await.unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn data_terminator_split_across_reads_is_found() {
        // Cursor reads return everything at once, so emulate the boundary
        // by feeding a body whose terminator falls beyond the first 8192
        // byte fill
        let mut payload = vec![b'y'; 8190];
        payload.extend_from_slice(b"\r\n.\r\n");
        let mut conn = connection(&payload);
        let body = conn.read_data(0).await.unwrap();
        assert_eq!(body.bytes.len(), 8192);
    }

    #[tokio::test]
    async fn bdat_chunks_are_exact() {
        let mut conn = connection(b"hello world");
        assert_eq!(conn.read_exact_chunk(5).await.unwrap(), b"hello");
        assert_eq!(conn.read_exact_chunk(6).await.unwrap(), b" world");
        assert!(matches!(
            conn.read_exact_chunk(1).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn replies_are_buffered_until_flush() {
        let mut conn = connection(b"");
        conn.enqueue(&Reply::new(Status::Ok, "Ok"));
        conn.enqueue(&Reply::new(Status::Ok, "Also ok"));

        conn.flush().await.unwrap();

        let Connection { transport, .. } = conn;
        let super::Transport::Plain(cursor) = transport else {
            panic!("expected plain transport");
        };
        assert_eq!(cursor.get_ref().as_slice(), b"250 Ok\r\n250 Also ok\r\n");
    }

    #[tokio::test]
    async fn buffered_line_detection() {
        let mut conn = connection(b"EHLO a\r\nMAIL FROM:<a@b.c>\r\n");
        assert!(!conn.has_buffered_line());

        let _ = conn.read_line(MAX_COMMAND_LINE).await.unwrap();
        assert!(conn.has_buffered_line());

        let _ = conn.read_line(MAX_COMMAND_LINE).await.unwrap();
        assert!(!conn.has_buffered_line());
    }

    #[test]
    fn pattern_search() {
        assert_eq!(find_pattern(b"abc\r\ndef", b"\r\n"), Some(3));
        assert_eq!(find_pattern(b"abc", b"\r\n"), None);
        assert_eq!(find_pattern(b"", b"\r\n"), None);
    }
}
