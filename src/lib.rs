//! # SunSpec Gateway - Modbus-TCP Acquisition for SolarEdge Inverters
//!
//! Periodically pulls the SunSpec common and inverter block from a SolarEdge
//! inverter over Modbus-TCP, converts the raw registers into engineering units and
//! hands the latest reading to whoever consumes it.
//!
//! ## Features
//!
//! - **Async**: one tokio task per inverter, timed socket I/O
//! - **Self-healing**: every failure closes the session and the loop reconnects
//! - **Latest-value hand-off**: single-slot `watch` mailbox, never blocks the poller
//! - **Strict decoding**: MBAP envelope and SunSpec magic checked before anything
//!   is published
//! - **Simulator**: built-in Modbus-TCP inverter for tests and bench setups
//!
//! ## Register Block
//!
//! | Registers | Content |
//! |-----------|---------|
//! | 40000-40003 | SunSpec id `SunS`, DID, length |
//! | 40004-40067 | Manufacturer, model, version, serial number |
//! | 40069 | Phase configuration (101/102/103) |
//! | 40071-40106 | AC/DC values, each group with a scale factor |
//! | 40107-40108 | Operating state, vendor state |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sunspec_gateway::{AcquisitionLoop, GatewayConfig, GatewayResult};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> GatewayResult<()> {
//!     let config = GatewayConfig::load("gateway.yaml")?;
//!
//!     let (acquisition, mut measurements) = AcquisitionLoop::new(
//!         config.connection(),
//!         config.inverter.unit_id,
//!         config.poll_settings(),
//!     );
//!     let (_stop_tx, stop_rx) = watch::channel(false);
//!     tokio::spawn(acquisition.run(stop_rx));
//!
//!     loop {
//!         let m = measurements.changed().await?;
//!         println!("{} W, {} Wh lifetime", m.ac_power, m.ac_energy_wh);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │ AcquisitionLoop │─────►│    Mailbox      │──► consumers
//! └─────────────────┘      └─────────────────┘
//!          │                        ▲
//! ┌─────────────────┐      ┌─────────────────┐
//! │   FrameCodec    │      │  Measurement    │
//! └─────────────────┘      └─────────────────┘
//!          │                        ▲
//! ┌─────────────────┐      ┌─────────────────┐
//! │   Transport     │─────►│ RawRegisterBlock│
//! │   (TCP, async)  │      │    (decode)     │
//! └─────────────────┘      └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus-TCP framing for the read-registers exchange
pub mod protocol;

/// SunSpec register block layout and decoding
pub mod sunspec;

/// Scale-factor conversion to engineering units
pub mod measurement;

/// TCP session to the inverter
pub mod transport;

/// Latest-value hand-off to consumers
pub mod mailbox;

/// The polling task
pub mod acquisition;

pub mod config;

/// Averages and daily production derived from the measurement stream
pub mod aggregate;

pub mod telemetry;

/// Modbus-TCP inverter simulator
pub mod simulator;

/// Utility functions and performance monitoring
pub mod utils;

// Re-export main types for convenience
pub use acquisition::{AcquisitionLoop, LoopState, PollSettings};
pub use aggregate::{Aggregator, DailyEnergy, RollingAverage};
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use mailbox::{MeasurementPublisher, MeasurementSubscriber};
pub use measurement::Measurement;
pub use protocol::{FrameCodec, ModbusFunction};
pub use simulator::{InverterSimulator, SimulatorConfig};
pub use sunspec::RawRegisterBlock;
pub use telemetry::TelemetryDocument;
pub use transport::{LinkState, TcpConnection, Transport, TransportStats};
pub use utils::{OperationTimer, PerformanceMetrics};

/// Default timeout for socket operations (10 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Pause between two reads of the register block
pub const POLL_INTERVAL_MS: u64 = 1000;

/// Pause before retrying a failed initial connect
pub const RECONNECT_DELAY_MS: u64 = 2500;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default Modbus unit id of a SolarEdge inverter
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("SunSpec Gateway v{} - Modbus-TCP acquisition for SolarEdge inverters", VERSION)
}
