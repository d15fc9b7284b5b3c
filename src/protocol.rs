/// Modbus-TCP framing for the SunSpec read path
///
/// This module contains the function codes, the MBAP envelope layout, and the
/// `FrameCodec` that builds read-holding-registers requests and unwraps the
/// matching responses.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// MBAP header: transaction id (2) + protocol id (2) + length (2) + unit id (1)
pub const MBAP_HEADER_SIZE: usize = 7;

/// Bytes ahead of the register data in a read response: MBAP + function code + byte count
pub const READ_RESPONSE_PREFIX: usize = MBAP_HEADER_SIZE + 2;

/// Size of a read-registers request ADU
pub const READ_REQUEST_SIZE: usize = MBAP_HEADER_SIZE + 5;

/// Protocol identifier, always 0 for Modbus
const PROTOCOL_ID: u16 = 0;

/// Bit set on the function code of an exception response
const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> GatewayResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(GatewayError::frame(format!("Invalid function code: 0x{:02X}", value))),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Unwrapped read-holding-registers response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub transaction_id: u16,
    pub unit_id: SlaveId,
    pub function: ModbusFunction,
    /// Register data, exactly `byte count` bytes
    pub data: Vec<u8>,
}

/// Builds request ADUs and unwraps response ADUs for one Modbus-TCP session
///
/// The codec owns the transaction-id counter. The first request carries id 1 and
/// every request advances the counter by one, wrapping at 16 bits.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    unit_id: SlaveId,
    transaction_id: u16,
    in_flight: Option<u16>,
}

impl FrameCodec {
    /// Create a codec addressing `unit_id`
    pub fn new(unit_id: SlaveId) -> Self {
        Self {
            unit_id,
            transaction_id: 1,
            in_flight: None,
        }
    }

    /// Unit id written into every request
    pub fn unit_id(&self) -> SlaveId {
        self.unit_id
    }

    /// Transaction id the next request will carry
    pub fn next_transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Transaction id of the last request built, if any
    pub fn in_flight(&self) -> Option<u16> {
        self.in_flight
    }

    /// Build a Read Holding Registers (0x03) request
    ///
    /// Uses the current transaction id and then advances the counter.
    pub fn build_read_request(&mut self, address: ModbusAddress, count: u16) -> Vec<u8> {
        let transaction_id = self.transaction_id;
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.in_flight = Some(transaction_id);

        // unit id + function code + address (2) + quantity (2)
        let pdu_length: u16 = 6;

        let mut frame = Vec::with_capacity(READ_REQUEST_SIZE);
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        frame.extend_from_slice(&pdu_length.to_be_bytes());
        frame.push(self.unit_id);
        frame.push(ModbusFunction::ReadHoldingRegisters.to_u8());
        frame.extend_from_slice(&address.to_be_bytes());
        frame.extend_from_slice(&count.to_be_bytes());

        frame
    }

    /// Unwrap a read-registers response
    ///
    /// Checks the envelope (protocol id, length, transaction id of the request in
    /// flight, function code) and returns the register data that follows the
    /// 9-byte prefix. Exception responses become `GatewayError::Exception`.
    pub fn parse_read_response(&self, frame: &[u8]) -> GatewayResult<ResponseFrame> {
        if frame.len() < READ_RESPONSE_PREFIX {
            return Err(GatewayError::frame(format!(
                "Frame too short: {} bytes",
                frame.len()
            )));
        }

        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        let unit_id = frame[6];
        let function_code = frame[7];

        if protocol_id != PROTOCOL_ID {
            return Err(GatewayError::frame(format!("Invalid protocol ID: {}", protocol_id)));
        }

        if frame.len() < MBAP_HEADER_SIZE - 1 + length {
            return Err(GatewayError::frame("Incomplete frame"));
        }

        if let Some(expected) = self.in_flight {
            if transaction_id != expected {
                return Err(GatewayError::frame(format!(
                    "Transaction id mismatch: expected {}, got {}",
                    expected, transaction_id
                )));
            }
        }

        if unit_id != self.unit_id {
            debug!("Response from unit {} (requested unit {})", unit_id, self.unit_id);
        }

        if function_code & EXCEPTION_FLAG != 0 {
            return Err(GatewayError::exception(function_code & !EXCEPTION_FLAG, frame[8]));
        }

        let function = ModbusFunction::from_u8(function_code)?;
        if function != ModbusFunction::ReadHoldingRegisters {
            return Err(GatewayError::frame(format!("Unexpected function: {}", function)));
        }

        let byte_count = frame[8] as usize;
        if frame.len() < READ_RESPONSE_PREFIX + byte_count {
            return Err(GatewayError::frame(format!(
                "Byte count {} exceeds received data ({} bytes)",
                byte_count,
                frame.len() - READ_RESPONSE_PREFIX
            )));
        }

        Ok(ResponseFrame {
            transaction_id,
            unit_id,
            function,
            data: frame[READ_RESPONSE_PREFIX..READ_RESPONSE_PREFIX + byte_count].to_vec(),
        })
    }
}

/// Total ADU length announced by a (possibly partial) frame
///
/// Returns `None` until the length field of the MBAP header has arrived.
pub fn expected_frame_len(partial: &[u8]) -> Option<usize> {
    if partial.len() < MBAP_HEADER_SIZE - 1 {
        return None;
    }
    let length = u16::from_be_bytes([partial[4], partial[5]]) as usize;
    Some(MBAP_HEADER_SIZE - 1 + length)
}
