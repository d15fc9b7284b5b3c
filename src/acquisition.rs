//! # Acquisition Loop
//!
//! Drives one inverter session forever: connect, then poll the SunSpec block once
//! per interval and hand every converted measurement to the mailbox.
//!
//! ## Behaviour
//!
//! - **AwaitingConnection**: one connect attempt; on failure wait the reconnect
//!   delay (2.5 s) and try again, without bound.
//! - **Polling**: sleep the poll interval (1 s). If the link is down make a single
//!   connect attempt and read regardless of its outcome. Send the read request,
//!   receive, decode, convert and publish. Any failure closes the session and the
//!   previously published measurement stays untouched.
//!
//! The loop never returns an error. It stops only when the shutdown signal flips to
//! `true`, which is checked at the top of every iteration and during both sleeps.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokio::sync::watch;
//! use sunspec_gateway::acquisition::{AcquisitionLoop, PollSettings};
//! use sunspec_gateway::transport::TcpConnection;
//!
//! #[tokio::main]
//! async fn main() {
//!     let link = TcpConnection::new("192.168.1.40", 502, Duration::from_secs(10));
//!     let (acquisition, mut measurements) = AcquisitionLoop::new(link, 1, PollSettings::default());
//!     let (stop_tx, stop_rx) = watch::channel(false);
//!
//!     let worker = tokio::spawn(acquisition.run(stop_rx));
//!     if let Ok(m) = measurements.changed().await {
//!         println!("AC power {} W", m.ac_power);
//!     }
//!
//!     let _ = stop_tx.send(true);
//!     let _ = worker.await;
//! }
//! ```

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::GatewayResult;
use crate::mailbox::{self, MeasurementPublisher, MeasurementSubscriber};
use crate::measurement::Measurement;
use crate::protocol::{FrameCodec, SlaveId};
use crate::sunspec::{RawRegisterBlock, SUNSPEC_BASE_ADDRESS, SUNSPEC_REGISTER_COUNT};
use crate::transport::Transport;
use crate::utils::{logging, OperationTimer, PerformanceMetrics};

/// Loop timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Pause between two reads
    pub interval: Duration,
    /// Pause after a failed initial connect
    pub reconnect_delay: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(crate::POLL_INTERVAL_MS),
            reconnect_delay: Duration::from_millis(crate::RECONNECT_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingConnection,
    Polling,
}

/// Owns the transport, the codec and the working measurement
pub struct AcquisitionLoop<T: Transport> {
    transport: T,
    codec: FrameCodec,
    settings: PollSettings,
    publisher: MeasurementPublisher,
    working: Measurement,
    state: LoopState,
    metrics: PerformanceMetrics,
}

impl<T: Transport> AcquisitionLoop<T> {
    /// Create the loop and the subscriber its measurements go to
    pub fn new(transport: T, unit_id: SlaveId, settings: PollSettings) -> (Self, MeasurementSubscriber) {
        let (publisher, subscriber) = mailbox::channel();

        let acquisition = Self {
            transport,
            codec: FrameCodec::new(unit_id),
            settings,
            publisher,
            working: Measurement::default(),
            state: LoopState::AwaitingConnection,
            metrics: PerformanceMetrics::new(),
        };

        (acquisition, subscriber)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn subscribe(&self) -> MeasurementSubscriber {
        self.publisher.subscribe()
    }

    /// One read cycle on the current session
    ///
    /// Sends the block request, waits for the complete response, decodes and
    /// converts it, then publishes. Leaves the session as it is on error; closing
    /// is the caller's decision.
    pub async fn poll_once(&mut self) -> GatewayResult<Measurement> {
        let request = self
            .codec
            .build_read_request(SUNSPEC_BASE_ADDRESS, SUNSPEC_REGISTER_COUNT);
        self.transport.send(&request).await?;

        let frame = self.transport.receive_frame().await?;
        let response = self.codec.parse_read_response(&frame)?;
        let raw = RawRegisterBlock::decode(&response.data)?;

        self.working.apply(&raw);
        self.publisher.publish(self.working.clone());

        Ok(self.working.clone())
    }

    /// Run until `shutdown` turns `true`
    ///
    /// Closes the session before returning and hands back the cycle metrics.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PerformanceMetrics {
        info!(
            "Acquisition loop started (interval {:?}, reconnect delay {:?})",
            self.settings.interval, self.settings.reconnect_delay
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.state {
                LoopState::AwaitingConnection => match self.transport.connect().await {
                    Ok(()) => {
                        self.state = LoopState::Polling;
                        self.publisher.set_connected(true);
                    }
                    Err(e) => {
                        warn!(
                            "Connect failed: {}, retrying in {:?}",
                            e, self.settings.reconnect_delay
                        );
                        if sleep_or_stop(self.settings.reconnect_delay, &mut shutdown).await {
                            break;
                        }
                    }
                },
                LoopState::Polling => {
                    if sleep_or_stop(self.settings.interval, &mut shutdown).await {
                        break;
                    }
                    self.cycle().await;
                }
            }
        }

        let _ = self.transport.close().await;
        self.publisher.set_connected(false);
        self.publisher.publish_metrics(&self.metrics);
        info!("Acquisition loop stopped");

        self.metrics
    }

    async fn cycle(&mut self) {
        if !self.transport.is_connected() {
            self.metrics.record_reconnect();
            // The read below runs whatever the outcome; it fails fast when down
            if let Err(e) = self.transport.connect().await {
                debug!("Reconnect failed: {}", e);
            }
        }

        let timer = OperationTimer::start("poll");
        match self.poll_once().await {
            Ok(_) => self.metrics.record_success(timer.stop()),
            Err(e) => {
                warn!("Poll failed: {}", e);
                let _ = self.transport.close().await;
                self.metrics.record_failure(timer.stop_and_log(false));
            }
        }

        self.publisher.set_connected(self.transport.is_connected());
        self.publisher.publish_metrics(&self.metrics);
        logging::log_cycle(&self.metrics);
    }
}

/// Sleep for `period`, returning `true` early if a stop was requested
///
/// A dropped shutdown sender means nobody can stop the loop any more; it keeps
/// running.
async fn sleep_or_stop(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let stop_requested = async {
        loop {
            if shutdown.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if *shutdown.borrow_and_update() {
                return;
            }
        }
    };

    tokio::select! {
        _ = sleep(period) => false,
        _ = stop_requested => true,
    }
}
