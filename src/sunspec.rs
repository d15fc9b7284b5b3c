/// SolarEdge SunSpec register block
///
/// The inverter exposes the SunSpec common model followed by the inverter model as
/// one run of 109 holding registers starting at 40000. A single read covers all of
/// it; this module turns those 218 bytes into a `RawRegisterBlock` and back.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use log::debug;

use crate::error::{GatewayError, GatewayResult};

/// First register of the block
pub const SUNSPEC_BASE_ADDRESS: u16 = 40000;

/// Number of registers in the block
pub const SUNSPEC_REGISTER_COUNT: u16 = 109;

/// Size of the block on the wire
pub const SUNSPEC_BLOCK_SIZE: usize = SUNSPEC_REGISTER_COUNT as usize * 2;

/// "SunS" signature at register 40000
pub const SUNSPEC_MAGIC: u32 = 0x5375_6e53;

/// Raw register values, host byte order
///
/// Field names follow the SolarEdge SunSpec implementation note. Scale factors are
/// signed exponents: the engineering value of a paired register is `raw * 10^sf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRegisterBlock {
    /// 40000, must be `SUNSPEC_MAGIC`
    pub sunspec_id: u32,
    /// 40002, 1 = SunSpec common block
    pub sunspec_did: u16,
    /// 40003, length of the common block in registers
    pub sunspec_length: u16,
    pub manufacturer: [u8; 32],
    pub model: [u8; 32],
    /// 40036..40043, not used by SolarEdge
    pub reserved0: [u8; 16],
    pub version: [u8; 16],
    pub serial_number: [u8; 32],
    /// 40068, Modbus unit id
    pub device_address: u16,
    /// 40069, 101 single phase, 102 split phase, 103 three phase
    pub phase: u16,
    /// 40070, length of the inverter model block
    pub model_length: u16,

    pub ac_current: u16,
    pub ac_current_a: u16,
    pub ac_current_b: u16,
    pub ac_current_c: u16,
    pub ac_current_sf: i16,

    pub ac_voltage_ab: u16,
    pub ac_voltage_bc: u16,
    pub ac_voltage_ca: u16,
    pub ac_voltage_an: u16,
    pub ac_voltage_bn: u16,
    pub ac_voltage_cn: u16,
    pub ac_voltage_sf: i16,

    pub ac_power: i16,
    pub ac_power_sf: i16,
    pub ac_frequency: u16,
    pub ac_frequency_sf: i16,
    pub ac_va: i16,
    pub ac_va_sf: i16,
    pub ac_var: i16,
    pub ac_var_sf: i16,
    pub ac_pf: i16,
    pub ac_pf_sf: i16,

    /// 40093..40094, lifetime production in Wh
    pub ac_energy_wh: u32,
    pub ac_energy_wh_sf: i16,

    pub dc_current: u16,
    pub dc_current_sf: i16,
    pub dc_voltage: u16,
    pub dc_voltage_sf: i16,
    pub dc_power: i16,
    pub dc_power_sf: i16,

    /// 40102
    pub reserved1: u16,
    /// 40103, heat sink temperature
    pub temp_sink: i16,
    /// 40104..40105
    pub reserved2: u32,
    pub temp_sf: i16,

    /// 40107, operating state
    pub status: u16,
    /// 40108, vendor operating state and error codes
    pub status_vendor: u16,
}

impl Default for RawRegisterBlock {
    fn default() -> Self {
        Self {
            sunspec_id: SUNSPEC_MAGIC,
            sunspec_did: 1,
            sunspec_length: 65,
            manufacturer: [0; 32],
            model: [0; 32],
            reserved0: [0; 16],
            version: [0; 16],
            serial_number: [0; 32],
            device_address: 1,
            phase: 103,
            model_length: 50,
            ac_current: 0,
            ac_current_a: 0,
            ac_current_b: 0,
            ac_current_c: 0,
            ac_current_sf: 0,
            ac_voltage_ab: 0,
            ac_voltage_bc: 0,
            ac_voltage_ca: 0,
            ac_voltage_an: 0,
            ac_voltage_bn: 0,
            ac_voltage_cn: 0,
            ac_voltage_sf: 0,
            ac_power: 0,
            ac_power_sf: 0,
            ac_frequency: 0,
            ac_frequency_sf: 0,
            ac_va: 0,
            ac_va_sf: 0,
            ac_var: 0,
            ac_var_sf: 0,
            ac_pf: 0,
            ac_pf_sf: 0,
            ac_energy_wh: 0,
            ac_energy_wh_sf: 0,
            dc_current: 0,
            dc_current_sf: 0,
            dc_voltage: 0,
            dc_voltage_sf: 0,
            dc_power: 0,
            dc_power_sf: 0,
            reserved1: 0,
            temp_sink: 0,
            reserved2: 0,
            temp_sf: 0,
            status: 0,
            status_vendor: 0,
        }
    }
}

fn read_string<const N: usize>(cursor: &mut Cursor<&[u8]>) -> std::io::Result<[u8; N]> {
    let mut field = [0u8; N];
    cursor.read_exact(&mut field)?;
    // The last byte is always overwritten, even when the name fills the field.
    field[N - 1] = 0;
    Ok(field)
}

/// Text of a fixed-width string register, up to the first NUL
pub fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Copy `text` into a fixed-width string register, NUL padded
pub fn to_fixed<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

impl RawRegisterBlock {
    /// Decode the register data of a read response
    ///
    /// The magic identifier is checked before anything else is read; a block that
    /// fails the check yields `GatewayError::Parse` and no fields at all.
    pub fn decode(payload: &[u8]) -> GatewayResult<Self> {
        if payload.len() < SUNSPEC_BLOCK_SIZE {
            return Err(GatewayError::parse(format!(
                "SunSpec block needs {} bytes, got {}",
                SUNSPEC_BLOCK_SIZE,
                payload.len()
            )));
        }

        let mut cursor = Cursor::new(&payload[..SUNSPEC_BLOCK_SIZE]);

        let sunspec_id = cursor.read_u32::<BigEndian>()?;
        if sunspec_id != SUNSPEC_MAGIC {
            debug!("Received wrong SunSpec id: {:08x}", sunspec_id);
            return Err(GatewayError::parse(format!(
                "Wrong SunSpec id 0x{:08X}, expected 0x{:08X}",
                sunspec_id, SUNSPEC_MAGIC
            )));
        }

        Ok(Self {
            sunspec_id,
            sunspec_did: cursor.read_u16::<BigEndian>()?,
            sunspec_length: cursor.read_u16::<BigEndian>()?,
            manufacturer: read_string::<32>(&mut cursor)?,
            model: read_string::<32>(&mut cursor)?,
            reserved0: {
                let mut reserved = [0u8; 16];
                cursor.read_exact(&mut reserved)?;
                reserved
            },
            version: read_string::<16>(&mut cursor)?,
            serial_number: read_string::<32>(&mut cursor)?,
            device_address: cursor.read_u16::<BigEndian>()?,
            phase: cursor.read_u16::<BigEndian>()?,
            model_length: cursor.read_u16::<BigEndian>()?,

            ac_current: cursor.read_u16::<BigEndian>()?,
            ac_current_a: cursor.read_u16::<BigEndian>()?,
            ac_current_b: cursor.read_u16::<BigEndian>()?,
            ac_current_c: cursor.read_u16::<BigEndian>()?,
            ac_current_sf: cursor.read_i16::<BigEndian>()?,

            ac_voltage_ab: cursor.read_u16::<BigEndian>()?,
            ac_voltage_bc: cursor.read_u16::<BigEndian>()?,
            ac_voltage_ca: cursor.read_u16::<BigEndian>()?,
            ac_voltage_an: cursor.read_u16::<BigEndian>()?,
            ac_voltage_bn: cursor.read_u16::<BigEndian>()?,
            ac_voltage_cn: cursor.read_u16::<BigEndian>()?,
            ac_voltage_sf: cursor.read_i16::<BigEndian>()?,

            ac_power: cursor.read_i16::<BigEndian>()?,
            ac_power_sf: cursor.read_i16::<BigEndian>()?,
            ac_frequency: cursor.read_u16::<BigEndian>()?,
            ac_frequency_sf: cursor.read_i16::<BigEndian>()?,
            ac_va: cursor.read_i16::<BigEndian>()?,
            ac_va_sf: cursor.read_i16::<BigEndian>()?,
            ac_var: cursor.read_i16::<BigEndian>()?,
            ac_var_sf: cursor.read_i16::<BigEndian>()?,
            ac_pf: cursor.read_i16::<BigEndian>()?,
            ac_pf_sf: cursor.read_i16::<BigEndian>()?,

            ac_energy_wh: cursor.read_u32::<BigEndian>()?,
            ac_energy_wh_sf: cursor.read_i16::<BigEndian>()?,

            dc_current: cursor.read_u16::<BigEndian>()?,
            dc_current_sf: cursor.read_i16::<BigEndian>()?,
            dc_voltage: cursor.read_u16::<BigEndian>()?,
            dc_voltage_sf: cursor.read_i16::<BigEndian>()?,
            dc_power: cursor.read_i16::<BigEndian>()?,
            dc_power_sf: cursor.read_i16::<BigEndian>()?,

            reserved1: cursor.read_u16::<BigEndian>()?,
            temp_sink: cursor.read_i16::<BigEndian>()?,
            reserved2: cursor.read_u32::<BigEndian>()?,
            temp_sf: cursor.read_i16::<BigEndian>()?,

            status: cursor.read_u16::<BigEndian>()?,
            status_vendor: cursor.read_u16::<BigEndian>()?,
        })
    }

    /// Wire image of the block, as an inverter would serve it
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SUNSPEC_BLOCK_SIZE);
        out.extend_from_slice(&self.sunspec_id.to_be_bytes());
        out.extend_from_slice(&self.sunspec_did.to_be_bytes());
        out.extend_from_slice(&self.sunspec_length.to_be_bytes());
        out.extend_from_slice(&self.manufacturer);
        out.extend_from_slice(&self.model);
        out.extend_from_slice(&self.reserved0);
        out.extend_from_slice(&self.version);
        out.extend_from_slice(&self.serial_number);

        let words: [u16; 3] = [self.device_address, self.phase, self.model_length];
        let ac: [u16; 34] = [
            self.ac_current,
            self.ac_current_a,
            self.ac_current_b,
            self.ac_current_c,
            self.ac_current_sf as u16,
            self.ac_voltage_ab,
            self.ac_voltage_bc,
            self.ac_voltage_ca,
            self.ac_voltage_an,
            self.ac_voltage_bn,
            self.ac_voltage_cn,
            self.ac_voltage_sf as u16,
            self.ac_power as u16,
            self.ac_power_sf as u16,
            self.ac_frequency,
            self.ac_frequency_sf as u16,
            self.ac_va as u16,
            self.ac_va_sf as u16,
            self.ac_var as u16,
            self.ac_var_sf as u16,
            self.ac_pf as u16,
            self.ac_pf_sf as u16,
            (self.ac_energy_wh >> 16) as u16,
            self.ac_energy_wh as u16,
            self.ac_energy_wh_sf as u16,
            self.dc_current,
            self.dc_current_sf as u16,
            self.dc_voltage,
            self.dc_voltage_sf as u16,
            self.dc_power as u16,
            self.dc_power_sf as u16,
            self.reserved1,
            self.temp_sink as u16,
            (self.reserved2 >> 16) as u16,
        ];
        let tail: [u16; 4] = [
            self.reserved2 as u16,
            self.temp_sf as u16,
            self.status,
            self.status_vendor,
        ];

        for word in words.iter().chain(ac.iter()).chain(tail.iter()) {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn manufacturer_str(&self) -> String {
        fixed_str(&self.manufacturer)
    }

    pub fn model_str(&self) -> String {
        fixed_str(&self.model)
    }

    pub fn version_str(&self) -> String {
        fixed_str(&self.version)
    }

    pub fn serial_number_str(&self) -> String {
        fixed_str(&self.serial_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> RawRegisterBlock {
        RawRegisterBlock {
            manufacturer: to_fixed("SolarEdge "),
            model: to_fixed("SE5000H"),
            version: to_fixed("0004.0014.0036"),
            serial_number: to_fixed("7E0A1B2C"),
            ac_current: 2150,
            ac_current_sf: -2,
            ac_power: -1200,
            ac_power_sf: 0,
            ac_energy_wh: 12_345_678,
            ac_energy_wh_sf: -1,
            temp_sink: 4123,
            temp_sf: -2,
            status: 4,
            status_vendor: 0x8001,
            ..Default::default()
        }
    }

    #[test]
    fn test_block_size_matches_register_count() {
        assert_eq!(sample_block().encode().len(), SUNSPEC_BLOCK_SIZE);
        assert_eq!(SUNSPEC_BLOCK_SIZE, 218);
    }

    #[test]
    fn test_decode_fields_at_register_offsets() {
        let bytes = sample_block().encode();

        // "SunS" at 40000
        assert_eq!(&bytes[0..4], b"SunS");
        // phase indicator at 40069
        let phase_offset = (40069 - 40000) * 2;
        assert_eq!(&bytes[phase_offset..phase_offset + 2], &103u16.to_be_bytes());
        // status vendor is the final register, 40108
        assert_eq!(&bytes[216..218], &[0x80, 0x01]);

        let block = RawRegisterBlock::decode(&bytes).unwrap();
        assert_eq!(block.ac_current, 2150);
        assert_eq!(block.ac_current_sf, -2);
        assert_eq!(block.ac_power, -1200);
        assert_eq!(block.ac_energy_wh, 12_345_678);
        assert_eq!(block.ac_energy_wh_sf, -1);
        assert_eq!(block.temp_sink, 4123);
        assert_eq!(block.status_vendor, 0x8001);
        assert_eq!(block.model_str(), "SE5000H");
        assert_eq!(block.manufacturer_str(), "SolarEdge ");
    }

    #[test]
    fn test_decode_is_pure() {
        let bytes = sample_block().encode();
        let first = RawRegisterBlock::decode(&bytes).unwrap();
        let second = RawRegisterBlock::decode(&bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_string_fields_lose_last_byte() {
        let mut block = sample_block();
        block.version = [b'9'; 16];

        let decoded = RawRegisterBlock::decode(&block.encode()).unwrap();
        assert_eq!(decoded.version[15], 0);
        assert_eq!(decoded.version_str(), "9".repeat(15));
    }

    #[test]
    fn test_magic_mismatch_is_parse_error() {
        let mut bytes = sample_block().encode();
        bytes[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());

        match RawRegisterBlock::decode(&bytes) {
            Err(GatewayError::Parse { message }) => assert!(message.contains("DEADBEEF")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_short_payload_is_parse_error() {
        let bytes = sample_block().encode();
        assert!(matches!(
            RawRegisterBlock::decode(&bytes[..200]),
            Err(GatewayError::Parse { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = sample_block().encode();
        bytes.extend_from_slice(&[0xAA; 4]);
        assert!(RawRegisterBlock::decode(&bytes).is_ok());
    }
}
