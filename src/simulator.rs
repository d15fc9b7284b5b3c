/// SolarEdge inverter simulator
///
/// A minimal Modbus-TCP server holding one SunSpec register image. It answers Read
/// Holding Registers (0x03) inside 40000..=40108 and returns exception responses
/// for everything else. Used by the integration tests and the `inverter_simulator`
/// binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{expected_frame_len, ModbusFunction, MBAP_HEADER_SIZE};
use crate::sunspec::{RawRegisterBlock, SUNSPEC_BASE_ADDRESS, SUNSPEC_REGISTER_COUNT};
use crate::transport::MAX_TCP_FRAME_SIZE;
use crate::utils::validation;

/// Exception codes the simulator answers with
const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Simulator statistics
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub exception_responses: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub bind_address: SocketAddr,
    /// Idle time after which a client is dropped
    pub request_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_TCP_PORT)),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Modbus-TCP server serving a SunSpec register image
pub struct InverterSimulator {
    config: SimulatorConfig,
    image: Arc<Mutex<RawRegisterBlock>>,
    stats: Arc<Mutex<SimulatorStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl InverterSimulator {
    /// Create a simulator for `bind_address` serving the default image
    pub fn new(bind_address: &str) -> GatewayResult<Self> {
        let bind_address = bind_address.parse().map_err(|e| {
            GatewayError::configuration(format!("Invalid bind address '{}': {}", bind_address, e))
        })?;

        Ok(Self::with_config(SimulatorConfig {
            bind_address,
            ..Default::default()
        }))
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        Self {
            config,
            image: Arc::new(Mutex::new(RawRegisterBlock::default())),
            stats: Arc::new(Mutex::new(SimulatorStats::default())),
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Replace the served register image
    pub async fn set_image(&self, image: RawRegisterBlock) {
        *self.image.lock().await = image;
    }

    /// Shared handle for updating the image while serving
    pub fn image(&self) -> Arc<Mutex<RawRegisterBlock>> {
        self.image.clone()
    }

    /// Bound address once started; resolves port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub async fn stats(&self) -> SimulatorStats {
        self.stats.lock().await.clone()
    }

    /// Bind and start accepting clients in the background
    pub async fn start(&mut self) -> GatewayResult<SocketAddr> {
        if self.is_running() {
            return Err(GatewayError::internal("Simulator is already running"));
        }

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            GatewayError::connection(format!(
                "Failed to bind to {}: {}",
                self.config.bind_address, e
            ))
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.local_addr = Some(local_addr);

        info!("Inverter simulator listening on {}", local_addr);

        let image = self.image.clone();
        let stats = self.stats.clone();
        let request_timeout = self.config.request_timeout;
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("Accepted connection from {}", addr);

                                let image = image.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(stream, addr, image, stats, shutdown_rx, request_timeout).await;
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping simulator");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and drop every client
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
            info!("Inverter simulator stopped");
        }
    }

    async fn handle_client(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        image: Arc<Mutex<RawRegisterBlock>>,
        stats: Arc<Mutex<SimulatorStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Duration,
    ) {
        info!("Client connected: {}", peer_addr);
        stats.lock().await.connections_count += 1;

        let mut buffer = vec![0u8; MAX_TCP_FRAME_SIZE];
        let mut pending: Vec<u8> = Vec::with_capacity(MAX_TCP_FRAME_SIZE);

        'session: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }

                result = timeout(request_timeout, stream.read(&mut buffer)) => {
                    let bytes_read = match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => {
                            error!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Read timeout from {}", peer_addr);
                            break;
                        }
                    };

                    stats.lock().await.bytes_received += bytes_read as u64;
                    pending.extend_from_slice(&buffer[..bytes_read]);

                    // Serve every complete request buffered so far
                    while let Some(total) = expected_frame_len(&pending) {
                        if total > MAX_TCP_FRAME_SIZE || total < MBAP_HEADER_SIZE + 1 {
                            warn!("Dropping client {}: bad request length {}", peer_addr, total);
                            break 'session;
                        }
                        if pending.len() < total {
                            break;
                        }

                        let request: Vec<u8> = pending.drain(..total).collect();
                        let snapshot = image.lock().await.clone();

                        let response = match Self::process_request(&request, &snapshot) {
                            Ok(response) => response,
                            Err(e) => {
                                warn!("Dropping client {}: {}", peer_addr, e);
                                break 'session;
                            }
                        };

                        if let Err(e) = stream.write_all(&response).await {
                            error!("Failed to send response to {}: {}", peer_addr, e);
                            break 'session;
                        }

                        let mut stats = stats.lock().await;
                        stats.total_requests += 1;
                        stats.bytes_sent += response.len() as u64;
                        if response[7] & 0x80 != 0 {
                            stats.exception_responses += 1;
                        } else {
                            stats.successful_requests += 1;
                        }
                    }
                }
            }
        }

        info!("Client {} disconnected", peer_addr);
    }

    /// Answer one complete request ADU
    ///
    /// Malformed envelopes are errors (the client is dropped); valid envelopes
    /// always get a response, possibly an exception.
    pub fn process_request(frame: &[u8], image: &RawRegisterBlock) -> GatewayResult<Vec<u8>> {
        if frame.len() < MBAP_HEADER_SIZE + 1 {
            return Err(GatewayError::frame("Frame too short"));
        }

        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        let unit_id = frame[6];
        let function_code = frame[7];

        if protocol_id != 0 {
            return Err(GatewayError::frame("Invalid protocol ID"));
        }
        if length < 2 || frame.len() < MBAP_HEADER_SIZE - 1 + length {
            return Err(GatewayError::frame("Incomplete frame"));
        }

        debug!(
            "Processing request: TID={}, Function=0x{:02x}, Unit={}",
            transaction_id, function_code, unit_id
        );

        let data = &frame[MBAP_HEADER_SIZE + 1..MBAP_HEADER_SIZE - 1 + length];

        let pdu = match ModbusFunction::from_u8(function_code) {
            Ok(ModbusFunction::ReadHoldingRegisters) => Self::read_holding_registers(data, image),
            _ => Err(ILLEGAL_FUNCTION),
        };

        let (function, body) = match pdu {
            Ok(body) => (function_code, body),
            Err(exception_code) => (function_code | 0x80, vec![exception_code]),
        };

        let response_length = body.len() + 2;
        let mut response = Vec::with_capacity(MBAP_HEADER_SIZE - 1 + response_length);
        response.extend_from_slice(&transaction_id.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&(response_length as u16).to_be_bytes());
        response.push(unit_id);
        response.push(function);
        response.extend_from_slice(&body);

        Ok(response)
    }

    /// Byte count followed by the requested slice of the image
    fn read_holding_registers(data: &[u8], image: &RawRegisterBlock) -> Result<Vec<u8>, u8> {
        if data.len() < 4 {
            return Err(ILLEGAL_DATA_VALUE);
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);

        if validation::validate_register_count(quantity).is_err() {
            return Err(ILLEGAL_DATA_VALUE);
        }
        if !validation::within_block(address, quantity, SUNSPEC_BASE_ADDRESS, SUNSPEC_REGISTER_COUNT) {
            return Err(ILLEGAL_DATA_ADDRESS);
        }

        let bytes = image.encode();
        let start = (address - SUNSPEC_BASE_ADDRESS) as usize * 2;
        let end = start + quantity as usize * 2;

        let mut body = Vec::with_capacity(1 + end - start);
        body.push((end - start) as u8);
        body.extend_from_slice(&bytes[start..end]);
        Ok(body)
    }
}
