//! # Gateway Error Handling
//!
//! Error types for the SunSpec acquisition pipeline, covering the TCP session to the
//! inverter, the Modbus-TCP envelope, the SunSpec register payload, and the gateway
//! configuration.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **Connection Errors**: connect refused, peer closed the socket, link not open
//! - **I/O Errors**: socket failures surfaced by the operating system
//! - **Timeout Errors**: send or receive exceeded the configured socket timeout
//!
//! ### Protocol Errors
//! - **Frame Errors**: malformed MBAP envelope, truncated response, unexpected
//!   transaction id or function code
//! - **Exception Responses**: standard Modbus exception codes from the inverter
//! - **Parse Errors**: the register payload is not a SolarEdge SunSpec block
//!
//! ### System Errors
//! - **Configuration Errors**: host unset, port zero, unreadable config file
//! - **Internal Errors**: hand-off channel closed and similar invariant breaks
//!
//! ## Error Recovery
//!
//! The acquisition loop never gives up: every error is answered by closing the
//! session and reconnecting. The classification helpers are there for callers that
//! want to log or count failures by kind.
//!
//! ```rust
//! use sunspec_gateway::{GatewayError, GatewayResult};
//!
//! fn describe(result: GatewayResult<Vec<u8>>) {
//!     match result {
//!         Ok(frame) => println!("received {} bytes", frame.len()),
//!         Err(error) if error.is_transport_error() => {
//!             println!("link problem, reconnecting: {}", error);
//!         }
//!         Err(error) => println!("bad response: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error types
///
/// Each variant carries enough context to produce a useful log line; none of them
/// is fatal to the acquisition loop.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// I/O related errors
    ///
    /// Low-level socket failures reported by the operating system.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// Connection establishment failures and a session lost mid-cycle.
    ///
    /// # Examples
    /// - Connection refused by the inverter
    /// - Peer closed the socket (zero-length read)
    /// - Send attempted while disconnected
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// A socket operation exceeded its configured timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Frame errors
    ///
    /// The Modbus-TCP envelope of a response is malformed.
    ///
    /// # Examples
    /// - Response shorter than the MBAP header
    /// - Non-zero protocol identifier
    /// - Byte count larger than the data received
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Modbus exception response
    ///
    /// The inverter answered with function code | 0x80.
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Register payload errors
    ///
    /// The payload does not hold a SunSpec block: wrong magic identifier or
    /// too few bytes. The block is discarded and nothing is published.
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Configuration errors
    ///
    /// # Examples
    /// - Inverter host not configured
    /// - Port 0
    /// - Config file with unknown extension
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Maps the standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse { message: message.into() }
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is likely to clear on its own
    ///
    /// Transport failures usually do (inverter rebooting, Wi-Fi roaming), as do the
    /// Acknowledge and Busy exceptions. A payload that fails to parse or a missing
    /// host will keep failing until something outside the gateway changes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sunspec_gateway::GatewayError;
    ///
    /// assert!(GatewayError::timeout("receive", 10_000).is_recoverable());
    /// assert!(!GatewayError::parse("bad magic").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol or payload issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. } | Self::Exception { .. } | Self::Parse { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
