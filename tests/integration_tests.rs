//! Integration Tests for the SunSpec Gateway
//!
//! The acquisition loop against a scripted in-memory inverter (paused clock) and
//! against real TCP peers: hand-written responders and the bundled simulator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tokio_test::assert_ok;

use sunspec_gateway::*;

/// What the scripted inverter does with the next request
#[derive(Debug, Clone)]
enum Behavior {
    Serve(RawRegisterBlock),
    WrongMagic,
    CloseOnReceive,
}

#[derive(Debug)]
struct MockState {
    behavior: Behavior,
    failing_connects: usize,
    connect_times: Vec<Instant>,
    closes: usize,
    requests: Vec<Vec<u8>>,
}

impl MockState {
    fn new(behavior: Behavior) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            behavior,
            failing_connects: 0,
            connect_times: Vec::new(),
            closes: 0,
            requests: Vec::new(),
        }))
    }
}

/// In-memory inverter; answers in small chunks to exercise frame reassembly
struct MockInverter {
    state: Arc<Mutex<MockState>>,
    connected: bool,
    pending: Vec<u8>,
}

impl MockInverter {
    fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self {
            state,
            connected: false,
            pending: Vec::new(),
        }
    }
}

fn response_frame(request: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![request[0], request[1], 0x00, 0x00];
    frame.extend_from_slice(&((payload.len() + 3) as u16).to_be_bytes());
    frame.extend_from_slice(&[request[6], 0x03, payload.len() as u8]);
    frame.extend_from_slice(payload);
    frame
}

fn block_with_power(ac_power: i16, ac_power_sf: i16) -> RawRegisterBlock {
    RawRegisterBlock {
        ac_power,
        ac_power_sf,
        ..Default::default()
    }
}

#[async_trait]
impl Transport for MockInverter {
    async fn connect(&mut self) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        state.connect_times.push(Instant::now());
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(GatewayError::connection("Connection refused"));
        }
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> GatewayResult<usize> {
        if !self.connected {
            return Err(GatewayError::connection("Not connected"));
        }

        let mut state = self.state.lock().unwrap();
        state.requests.push(data.to_vec());
        self.pending = match &state.behavior {
            Behavior::Serve(block) => response_frame(data, &block.encode()),
            Behavior::WrongMagic => {
                let mut payload = RawRegisterBlock::default().encode();
                payload[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
                response_frame(data, &payload)
            }
            Behavior::CloseOnReceive => Vec::new(),
        };
        Ok(data.len())
    }

    async fn receive(&mut self, max_len: usize) -> GatewayResult<Vec<u8>> {
        if !self.connected {
            return Err(GatewayError::connection("Not connected"));
        }
        if self.pending.is_empty() {
            self.connected = false;
            return Err(GatewayError::connection("Connection closed by peer"));
        }
        let n = self.pending.len().min(max_len).min(64);
        Ok(self.pending.drain(..n).collect())
    }

    async fn close(&mut self) -> GatewayResult<()> {
        self.connected = false;
        self.pending.clear();
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Failed connects are retried no sooner than the reconnect delay, without bound
#[tokio::test(start_paused = true)]
async fn test_connect_retry_spacing() {
    let state = MockState::new(Behavior::Serve(block_with_power(500, 0)));
    state.lock().unwrap().failing_connects = 5;

    let (acquisition, mut measurements) =
        AcquisitionLoop::new(MockInverter::new(state.clone()), 1, PollSettings::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    let measurement = assert_ok!(measurements.changed().await);
    assert_eq!(measurement.ac_power, 500.0);

    {
        let state = state.lock().unwrap();
        assert_eq!(state.connect_times.len(), 6);
        for pair in state.connect_times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(2500));
        }
    }

    stop_tx.send(true).unwrap();
    assert_ok!(worker.await);
}

/// A lost session closes the transport and leaves the last measurement in place
#[tokio::test(start_paused = true)]
async fn test_receive_failure_keeps_last_measurement() {
    let state = MockState::new(Behavior::Serve(block_with_power(1234, -1)));

    let (acquisition, mut measurements) =
        AcquisitionLoop::new(MockInverter::new(state.clone()), 1, PollSettings::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    let first = assert_ok!(measurements.changed().await);
    assert!((first.ac_power - 123.4).abs() < 1e-3);
    assert!(measurements.is_connected());

    state.lock().unwrap().behavior = Behavior::CloseOnReceive;
    sleep(Duration::from_millis(5500)).await;

    assert!(!measurements.has_changed());
    assert_eq!(measurements.latest(), Some(first));
    {
        let state = state.lock().unwrap();
        assert!(state.closes >= 3);
        // One reconnect attempt per failed cycle
        assert!(state.connect_times.len() >= 3);
    }

    stop_tx.send(true).unwrap();
    let metrics = assert_ok!(worker.await);
    assert_eq!(metrics.successful_cycles, 1);
    assert!(metrics.failed_cycles >= 3);
    assert!(metrics.reconnects >= 2);
}

/// A foreign register block is rejected without stopping the loop
#[tokio::test(start_paused = true)]
async fn test_wrong_magic_closes_and_recovers() {
    let state = MockState::new(Behavior::WrongMagic);

    let (acquisition, mut measurements) =
        AcquisitionLoop::new(MockInverter::new(state.clone()), 1, PollSettings::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    sleep(Duration::from_millis(3500)).await;
    assert!(measurements.latest().is_none());
    assert!(state.lock().unwrap().closes >= 2);

    state.lock().unwrap().behavior = Behavior::Serve(block_with_power(42, 1));
    let measurement = assert_ok!(timeout(Duration::from_secs(5), measurements.changed()).await);
    assert_eq!(assert_ok!(measurement).ac_power, 420.0);

    stop_tx.send(true).unwrap();
    assert_ok!(worker.await);
}

/// Every request carries the next transaction id and the fixed block address
#[tokio::test(start_paused = true)]
async fn test_request_sequence() {
    let state = MockState::new(Behavior::Serve(block_with_power(1, 0)));

    let (acquisition, _measurements) =
        AcquisitionLoop::new(MockInverter::new(state.clone()), 7, PollSettings::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    sleep(Duration::from_millis(3500)).await;
    stop_tx.send(true).unwrap();
    assert_ok!(worker.await);

    let state = state.lock().unwrap();
    assert_eq!(state.requests.len(), 3);
    for (i, request) in state.requests.iter().enumerate() {
        let tid = (i + 1) as u16;
        let mut expected = tid.to_be_bytes().to_vec();
        expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x9C, 0x40, 0x00, 0x6D]);
        assert_eq!(request, &expected);
    }
}

/// Scripted TCP responder: AC power 500 with scale factor 0 arrives within a poll
#[tokio::test]
async fn test_end_to_end_scripted_responder() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let payload = block_with_power(500, 0).encode();
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            let response = response_frame(&request, &payload);
            // Split the answer to force reassembly on the gateway side
            let (head, tail) = response.split_at(100);
            if socket.write_all(head).await.is_err() {
                break;
            }
            let _ = socket.flush().await;
            sleep(Duration::from_millis(5)).await;
            if socket.write_all(tail).await.is_err() {
                break;
            }
        }
    });

    let link = TcpConnection::new("127.0.0.1", port, Duration::from_secs(2));
    let (acquisition, mut measurements) = AcquisitionLoop::new(link, 1, PollSettings::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    let measurement = assert_ok!(timeout(Duration::from_secs(3), measurements.changed()).await);
    assert_eq!(assert_ok!(measurement).ac_power, 500.0);
    assert!(measurements.is_connected());

    stop_tx.send(true).unwrap();
    assert_ok!(worker.await);
}

/// A peer that hangs up right after accept makes the loop close and reconnect
#[tokio::test]
async fn test_end_to_end_peer_closes_immediately() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    let settings = PollSettings {
        interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
    };
    let link = TcpConnection::new("127.0.0.1", port, Duration::from_secs(2));
    let (acquisition, measurements) = AcquisitionLoop::new(link, 1, settings);
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    let deadline = Instant::now() + Duration::from_secs(5);
    while accepts.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }

    assert!(accepts.load(Ordering::SeqCst) >= 3);
    assert!(measurements.latest().is_none());

    stop_tx.send(true).unwrap();
    let metrics = assert_ok!(worker.await);
    assert_eq!(metrics.successful_cycles, 0);
    assert!(metrics.failed_cycles >= 2);
}

/// A responder that answers once and then goes quiet: the read times out, the loop
/// reconnects and the published measurement stays the one that arrived
#[tokio::test]
async fn test_end_to_end_silent_responder_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            tokio::spawn(async move {
                let payload = block_with_power(500, 0).encode();
                let mut request = [0u8; 12];
                let mut answered = !first;
                // Swallow requests, answer only the very first one
                while socket.read_exact(&mut request).await.is_ok() {
                    if !answered {
                        answered = true;
                        if socket.write_all(&response_frame(&request, &payload)).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    let settings = PollSettings {
        interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
    };
    let link = TcpConnection::new("127.0.0.1", port, Duration::from_millis(200));
    let (acquisition, mut measurements) = AcquisitionLoop::new(link, 1, settings);
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    let measurement = assert_ok!(timeout(Duration::from_secs(3), measurements.changed()).await);
    assert_eq!(assert_ok!(measurement).ac_power, 500.0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while accepts.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert!(accepts.load(Ordering::SeqCst) >= 2);

    assert!(!measurements.has_changed());
    assert_eq!(measurements.latest().unwrap().ac_power, 500.0);

    stop_tx.send(true).unwrap();
    let metrics = assert_ok!(worker.await);
    assert_eq!(metrics.successful_cycles, 1);
    assert!(metrics.failed_cycles >= 1);
    assert!(metrics.reconnects >= 1);
}

/// Nothing listening: the loop keeps retrying and never publishes
#[tokio::test]
async fn test_unreachable_inverter() {
    // Grab a free port and release it again
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let settings = PollSettings {
        interval: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(50),
    };
    let link = TcpConnection::new("127.0.0.1", port, Duration::from_millis(500));
    let (acquisition, measurements) = AcquisitionLoop::new(link, 1, settings);
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    sleep(Duration::from_millis(300)).await;
    assert!(measurements.latest().is_none());
    assert!(!measurements.is_connected());

    stop_tx.send(true).unwrap();
    let metrics = assert_ok!(timeout(Duration::from_secs(2), worker).await);
    assert_eq!(assert_ok!(metrics).total_cycles, 0);
}

/// Simulator, loop, aggregation and telemetry document together
#[tokio::test]
async fn test_simulator_to_telemetry() {
    utils::logging::init_test_logger();

    let mut simulator = assert_ok!(InverterSimulator::new("127.0.0.1:0"));
    simulator
        .set_image(RawRegisterBlock {
            manufacturer: sunspec::to_fixed("SolarEdge "),
            phase: 101,
            ac_power: 500,
            ac_power_sf: 0,
            ac_energy_wh: 9_000,
            ac_energy_wh_sf: 0,
            ac_frequency: 5001,
            ac_frequency_sf: -2,
            status: 4,
            ..Default::default()
        })
        .await;
    let addr = assert_ok!(simulator.start().await);

    let config = GatewayConfig::from_yaml_str(&format!(
        "inverter:\n  host: 127.0.0.1\n  port: {}\npolling:\n  interval_ms: 200\n",
        addr.port()
    ))
    .unwrap();

    let (acquisition, mut measurements) =
        AcquisitionLoop::new(config.connection(), config.inverter.unit_id, config.poll_settings());
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(acquisition.run(stop_rx));

    let mut measurement = assert_ok!(assert_ok!(
        timeout(Duration::from_secs(3), measurements.changed()).await
    ));
    assert_eq!(measurement.manufacturer, "SolarEdge ");
    assert_eq!(measurement.phase, 101);
    assert!((measurement.ac_frequency - 50.01).abs() < 1e-3);

    let mut aggregator = Aggregator::new(config.poll_settings().interval);
    aggregator.apply(&mut measurement, &chrono::Local::now());

    let json = assert_ok!(TelemetryDocument::new(&measurement, Duration::from_secs(12)).to_json());
    let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(doc["I_AC_Power"], 500.0);
    assert_eq!(doc["I_AC_Energy_WH"], 9000.0);
    assert_eq!(doc["I_AC_Energy_WH_24H"], 0.0);
    assert_eq!(doc["I_Status"], 4);
    assert_eq!(doc["esp_uptime"], 12);

    stop_tx.send(true).unwrap();
    assert_ok!(worker.await);

    let stats = simulator.stats().await;
    assert!(stats.successful_requests >= 1);
    assert_eq!(stats.exception_responses, 0);
    simulator.stop().await;
}
