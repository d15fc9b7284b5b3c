//! # Inverter Transport Layer
//!
//! The TCP session to the inverter. A `TcpConnection` is created once from the
//! configured endpoint and then opened and closed any number of times by the
//! acquisition loop.
//!
//! ## Link states
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                          |                  |
//!      +-------- failure ---------+---- I/O error ---+
//!      +------------------------ close() ------------+
//! ```
//!
//! Every send and receive is bounded by the configured timeout (10 s by default).
//! The connect attempt shares the same bound. Nothing in this module retries; the
//! caller decides when to try again.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sunspec_gateway::transport::{TcpConnection, Transport};
//! use sunspec_gateway::protocol::FrameCodec;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut link = TcpConnection::new("192.168.1.40", 502, Duration::from_secs(10));
//!     link.connect().await?;
//!
//!     let mut codec = FrameCodec::new(1);
//!     link.send(&codec.build_read_request(40000, 109)).await?;
//!     let frame = link.receive_frame().await?;
//!     println!("{} bytes, stats {:?}", frame.len(), link.stats());
//!
//!     link.close().await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::expected_frame_len;
use crate::utils::format::bytes_to_hex;

/// Maximum Modbus-TCP ADU (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Log a raw packet in hex
fn log_packet(direction: &str, data: &[u8], peer: &str) {
    info!("[MODBUS-TCP] {} {} {}", direction, peer, bytes_to_hex(data));
}

/// Cached state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub frames_sent: u64,
    pub reads: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Byte-stream session to one inverter
///
/// The acquisition loop is generic over this trait so that tests can script the
/// inverter side without sockets.
#[async_trait]
pub trait Transport: Send {
    /// Open the session
    ///
    /// Fails with a configuration error when the endpoint is incomplete and with a
    /// connection or timeout error when the peer cannot be reached. Does not retry.
    async fn connect(&mut self) -> GatewayResult<()>;

    /// Write the whole buffer, returning the number of bytes written
    async fn send(&mut self, data: &[u8]) -> GatewayResult<usize>;

    /// Read whatever is available, up to `max_len` bytes
    ///
    /// A zero-length read means the peer closed the session and is reported as a
    /// connection error.
    async fn receive(&mut self, max_len: usize) -> GatewayResult<Vec<u8>>;

    /// Read one complete Modbus-TCP ADU
    ///
    /// Keeps calling `receive` until the length announced in the MBAP header has
    /// arrived. Bytes beyond the announced length are dropped.
    async fn receive_frame(&mut self) -> GatewayResult<Vec<u8>> {
        let mut frame: Vec<u8> = Vec::with_capacity(MAX_TCP_FRAME_SIZE);

        loop {
            if let Some(total) = expected_frame_len(&frame) {
                if total > MAX_TCP_FRAME_SIZE {
                    return Err(GatewayError::frame(format!(
                        "Response frame too large: {} bytes",
                        total
                    )));
                }
                if frame.len() >= total {
                    frame.truncate(total);
                    return Ok(frame);
                }
            }

            let wanted = MAX_TCP_FRAME_SIZE.saturating_sub(frame.len()).max(1);
            let chunk = self.receive(wanted).await?;
            frame.extend_from_slice(&chunk);
        }
    }

    /// Close the session; closing a closed session is a no-op
    async fn close(&mut self) -> GatewayResult<()>;

    /// Cached link state, no probing
    fn is_connected(&self) -> bool;

    fn stats(&self) -> TransportStats;
}

/// TCP session to the inverter
pub struct TcpConnection {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    state: LinkState,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpConnection {
    /// Create a closed connection to `host:port`
    pub fn new<S: Into<String>>(host: S, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            stream: None,
            state: LinkState::Disconnected,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Create a closed connection with packet logging switched on or off
    pub fn with_packet_logging<S: Into<String>>(
        host: S,
        port: u16,
        timeout: Duration,
        enable_logging: bool,
    ) -> Self {
        let mut connection = Self::new(host, port, timeout);
        connection.packet_logging = enable_logging;
        connection
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Drop the socket after an I/O failure
    fn mark_broken(&mut self) {
        self.stream = None;
        self.state = LinkState::Disconnected;
        self.stats.errors += 1;
    }
}

#[async_trait]
impl Transport for TcpConnection {
    async fn connect(&mut self) -> GatewayResult<()> {
        if self.host.trim().is_empty() {
            return Err(GatewayError::configuration("Inverter host is not configured"));
        }
        if self.port == 0 {
            return Err(GatewayError::configuration("Inverter port is not configured"));
        }

        if let Some(mut stale) = self.stream.take() {
            let _ = stale.shutdown().await;
        }

        self.state = LinkState::Connecting;
        debug!("Connecting to {}", self.peer());

        let attempt = timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await;

        match attempt {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY on {}: {}", self.peer(), e);
                }
                self.stream = Some(stream);
                self.state = LinkState::Connected;
                self.stats.connects += 1;
                info!("Connected to inverter at {}", self.peer());
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = LinkState::Disconnected;
                self.stats.connect_failures += 1;
                Err(GatewayError::connection(format!(
                    "Failed to connect to {}: {}",
                    self.peer(),
                    e
                )))
            }
            Err(_) => {
                self.state = LinkState::Disconnected;
                self.stats.connect_failures += 1;
                self.stats.timeouts += 1;
                Err(GatewayError::timeout(
                    format!("connect to {}", self.peer()),
                    self.timeout_ms(),
                ))
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> GatewayResult<usize> {
        let io_timeout = self.timeout;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(GatewayError::connection("Not connected")),
        };

        match timeout(io_timeout, stream.write_all(data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_broken();
                return Err(GatewayError::connection(format!("Send failed: {}", e)));
            }
            Err(_) => {
                self.mark_broken();
                self.stats.timeouts += 1;
                return Err(GatewayError::timeout("send request", self.timeout_ms()));
            }
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        if self.packet_logging {
            log_packet("send", data, &self.peer());
        }

        Ok(data.len())
    }

    async fn receive(&mut self, max_len: usize) -> GatewayResult<Vec<u8>> {
        let io_timeout = self.timeout;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(GatewayError::connection("Not connected")),
        };

        let mut buffer = vec![0u8; max_len.max(1)];
        let read = match timeout(io_timeout, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => {
                self.mark_broken();
                return Err(GatewayError::connection("Connection closed by peer"));
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.mark_broken();
                return Err(GatewayError::connection(format!("Receive failed: {}", e)));
            }
            Err(_) => {
                self.mark_broken();
                self.stats.timeouts += 1;
                return Err(GatewayError::timeout("receive response", self.timeout_ms()));
            }
        };

        buffer.truncate(read);
        self.stats.reads += 1;
        self.stats.bytes_received += read as u64;
        if self.packet_logging {
            log_packet("receive", &buffer, &self.peer());
        }

        Ok(buffer)
    }

    async fn close(&mut self) -> GatewayResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed connection to {}", self.peer());
        }
        self.state = LinkState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
