//! In-process test harness: a live server bound to a loopback port and a
//! raw-socket SMTP client speaking the wire protocol directly.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::broadcast,
};
use zetian_common::Signal;
use zetian_smtp::{Server, ServerBuilder, ServerConfig, auth::StaticCredentials};
use zetian_store::TestStore;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: TestStore,
    pub shutdown: broadcast::Sender<Signal>,
}

/// Baseline configuration every test starts from: loopback, ephemeral
/// port, a fixed server name.
pub fn config() -> ServerConfig {
    ServerConfig::builder()
        .with_address("127.0.0.1".parse().unwrap())
        .with_port(0)
        .with_server_name("zetian.example")
        .build()
}

pub async fn start(config: ServerConfig) -> TestServer {
    start_with(config, |builder| builder).await
}

/// Start a server with a recording store, a static alice/secret verifier
/// and any further builder customization the test needs.
pub async fn start_with(
    config: ServerConfig,
    customize: impl FnOnce(ServerBuilder) -> ServerBuilder,
) -> TestServer {
    let store = TestStore::new();
    let builder = Server::builder()
        .with_config(config)
        .with_store(Arc::new(store.clone()))
        .with_verifier(Arc::new(
            StaticCredentials::new().with_user("alice", "secret"),
        ));

    let server = customize(builder).build().expect("configuration is valid");
    let listener = server.bind().await.expect("bind loopback");
    let addr = listener.local_addr();

    let (shutdown, rx) = broadcast::channel(16);
    tokio::spawn(async move {
        let _ = listener.serve(rx).await;
    });

    TestServer {
        addr,
        store,
        shutdown,
    }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    /// Connect and consume the 220 greeting.
    pub async fn connect_and_greet(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        let greeting = client.line().await;
        assert!(greeting.starts_with("220 "), "greeting was {greeting:?}");
        client
    }

    /// Read one reply line, CRLF stripped. Panics on a closed stream.
    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.expect("read reply");
        assert!(read > 0, "connection closed while expecting a reply");
        line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()
    }

    /// Read one full (possibly multi-line) reply.
    pub async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let done = line.len() < 4 || line.as_bytes()[3] == b' ';
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write command");
    }

    pub async fn raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write bytes");
    }

    /// Send one command and return the first reply line.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.line().await
    }

    /// Send one command, asserting on the reply prefix.
    pub async fn expect(&mut self, line: &str, prefix: &str) -> String {
        let reply = self.cmd(line).await;
        assert!(
            reply.starts_with(prefix),
            "sent {line:?}, expected {prefix:?}, got {reply:?}"
        );
        reply
    }

    /// EHLO; returns every reply line with the code prefix stripped.
    pub async fn ehlo(&mut self, domain: &str) -> Vec<String> {
        self.send(&format!("EHLO {domain}")).await;
        let lines = self.reply().await;
        assert!(
            lines.iter().all(|line| line.starts_with("250")),
            "EHLO failed: {lines:?}"
        );
        lines
            .iter()
            .map(|line| line.get(4..).unwrap_or_default().to_string())
            .collect()
    }

    /// True once the server has closed its end.
    pub async fn closed(&mut self) -> bool {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .await
            .map_or(true, |read| read == 0)
    }
}
