// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use samgate::config::{AuthConfig, Config, MetricsConfig, UdpConfig};
use samgate::core::CommandLine;
use samgate::server::{self, RunningGateway};
use samgate::transport::MemoryNetwork;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// How long a test waits for any single line before failing.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A config bound to ephemeral localhost ports, with nothing written to disk.
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        keys_file: String::new(),
        udp: UdpConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        auth: AuthConfig {
            enabled: false,
            credentials_file: String::new(),
        },
        metrics: MetricsConfig {
            enabled: false,
            port: 0,
        },
        ..Config::default()
    }
}

/// TestGateway runs a complete gateway over an in-process network.
pub struct TestGateway {
    pub gateway: RunningGateway,
    pub network: Arc<MemoryNetwork>,
}

impl TestGateway {
    /// Creates a new gateway with the default test configuration
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Creates a new gateway with a custom configuration
    pub async fn with_config(config: Config) -> Self {
        // Initialize tracing (ignore error if already initialized)
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new("warn"))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();

        let network = MemoryNetwork::new();
        let gateway = server::spawn(config, network.clone(), network.clone())
            .await
            .expect("Failed to start gateway");
        Self { gateway, network }
    }

    /// Opens a raw command connection.
    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.gateway.command_addr).await
    }

    /// Opens a command connection and completes the handshake.
    pub async fn client(&self, version: &str) -> TestClient {
        let mut client = self.connect().await;
        let reply = client.hello(version).await;
        assert_eq!(field(&reply, "RESULT").as_deref(), Some("OK"), "{reply}");
        client
    }

    #[allow(dead_code)]
    pub fn datagram_addr(&self) -> SocketAddr {
        self.gateway
            .datagram_addr
            .expect("datagram side channel is disabled")
    }

    #[allow(dead_code)]
    pub async fn shutdown(self) {
        self.gateway.shutdown().await;
    }
}

/// One client connection speaking the line protocol.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect to gateway");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Writes `line` followed by a newline.
    pub async fn send(&mut self, line: &str) {
        self.send_bytes(format!("{line}\n").as_bytes()).await;
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer
            .write_all(bytes)
            .await
            .expect("Failed to write to gateway");
    }

    /// Writes a command line and its payload in one write.
    #[allow(dead_code)]
    pub async fn send_with_payload(&mut self, line: &str, payload: &[u8]) {
        let mut bytes = format!("{line}\n").into_bytes();
        bytes.extend_from_slice(payload);
        self.send_bytes(&bytes).await;
    }

    /// Reads one line, without its terminator.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for a line")
            .expect("Failed to read from gateway");
        assert!(n > 0, "connection closed while waiting for a line");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    #[allow(dead_code)]
    pub async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(READ_TIMEOUT, self.reader.read_exact(&mut buf))
            .await
            .expect("Timed out waiting for payload")
            .expect("Failed to read payload");
        buf
    }

    /// Sends a command and returns the single line it produces.
    pub async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_line().await
    }

    pub async fn hello(&mut self, version: &str) -> String {
        self.request(&format!("HELLO VERSION MIN={version} MAX={version}"))
            .await
    }

    /// Asserts the gateway closes the connection, skipping any lines still in flight.
    #[allow(dead_code)]
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(READ_TIMEOUT, async {
            let mut buf = [0u8; 1024];
            loop {
                match self.reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection was not closed");
    }

    /// Gives the connection back as one stream, for spliced data.
    #[allow(dead_code)]
    pub fn into_parts(self) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        (self.reader, self.writer)
    }
}

/// The value of `key` in a reply line.
pub fn field(line: &str, key: &str) -> Option<String> {
    CommandLine::parse(line)
        .ok()
        .and_then(|parsed| parsed.props.get(key).map(str::to_string))
}

/// Creates a session and returns the `DESTINATION=` value of the reply.
#[allow(dead_code)]
pub async fn create_session(client: &mut TestClient, options: &str) -> String {
    let reply = client
        .request(&format!("SESSION CREATE {options}"))
        .await;
    assert_eq!(field(&reply, "RESULT").as_deref(), Some("OK"), "{reply}");
    field(&reply, "DESTINATION").expect("SESSION STATUS without DESTINATION")
}

/// The public destination of the session owned by `client`.
#[allow(dead_code)]
pub async fn my_destination(client: &mut TestClient) -> String {
    let reply = client.request("NAMING LOOKUP NAME=ME").await;
    assert_eq!(field(&reply, "RESULT").as_deref(), Some("OK"), "{reply}");
    field(&reply, "VALUE").expect("NAMING REPLY without VALUE")
}
