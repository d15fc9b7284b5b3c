//! Engineering-unit measurements
//!
//! Applies the SunSpec scale factors to a decoded `RawRegisterBlock`. Conversion
//! cannot fail: every block that passed decoding converts.

use serde::{Deserialize, Serialize};

use crate::sunspec::{fixed_str, RawRegisterBlock};

/// `raw * 10^sf` as f32
#[inline]
pub fn scale<T: Into<f64>>(raw: T, sf: i16) -> f32 {
    (raw.into() * 10f64.powi(sf as i32)) as f32
}

/// Converted inverter readings
///
/// Serialized field names match the register names used in the published
/// telemetry document. The aggregation fields at the end are owned by downstream
/// consumers; conversion leaves them untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "C_Manufacturer")]
    pub manufacturer: String,
    #[serde(rename = "C_Model")]
    pub model: String,
    #[serde(rename = "C_Version")]
    pub version: String,
    #[serde(rename = "C_SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "C_SunSpec_Phase")]
    pub phase: u16,

    /// Amps
    #[serde(rename = "I_AC_Current")]
    pub ac_current: f32,
    #[serde(rename = "I_AC_CurrentA")]
    pub ac_current_a: f32,
    #[serde(rename = "I_AC_CurrentB")]
    pub ac_current_b: f32,
    #[serde(rename = "I_AC_CurrentC")]
    pub ac_current_c: f32,

    /// Volts, line to line
    #[serde(rename = "I_AC_VoltageAB")]
    pub ac_voltage_ab: f32,
    #[serde(rename = "I_AC_VoltageBC")]
    pub ac_voltage_bc: f32,
    #[serde(rename = "I_AC_VoltageCA")]
    pub ac_voltage_ca: f32,

    /// Volts, line to neutral
    #[serde(rename = "I_AC_VoltageAN")]
    pub ac_voltage_an: f32,
    #[serde(rename = "I_AC_VoltageBN")]
    pub ac_voltage_bn: f32,
    #[serde(rename = "I_AC_VoltageCN")]
    pub ac_voltage_cn: f32,

    /// Watts
    #[serde(rename = "I_AC_Power")]
    pub ac_power: f32,
    /// Hertz
    #[serde(rename = "I_AC_Frequency")]
    pub ac_frequency: f32,
    /// VA
    #[serde(rename = "I_AC_VA")]
    pub ac_va: f32,
    /// VAR
    #[serde(rename = "I_AC_VAR")]
    pub ac_var: f32,
    /// Percent
    #[serde(rename = "I_AC_PF")]
    pub ac_pf: f32,
    /// Lifetime production, Wh
    #[serde(rename = "I_AC_Energy_WH")]
    pub ac_energy_wh: f32,

    #[serde(rename = "I_DC_Current")]
    pub dc_current: f32,
    #[serde(rename = "I_DC_Voltage")]
    pub dc_voltage: f32,
    #[serde(rename = "I_DC_Power")]
    pub dc_power: f32,

    /// Degrees C
    #[serde(rename = "I_Temp_Sink")]
    pub temp_sink: f32,
    #[serde(rename = "I_Status")]
    pub status: u16,
    #[serde(rename = "I_Status_Vendor")]
    pub status_vendor: u16,

    /// Lifetime energy at the last local day boundary
    #[serde(skip)]
    pub energy_wh_at_day_start: f32,
    /// Smoothed AC power, short window
    #[serde(skip)]
    pub avg_power_1h: f32,
    #[serde(skip)]
    pub power_1h_ready: bool,
    /// Smoothed AC power, long window
    #[serde(skip)]
    pub avg_power_24h: f32,
    #[serde(skip)]
    pub power_24h_ready: bool,
}

impl Measurement {
    /// Convert a freshly decoded block
    pub fn from_registers(raw: &RawRegisterBlock) -> Self {
        let mut measurement = Self::default();
        measurement.apply(raw);
        measurement
    }

    /// Overwrite the acquired fields from `raw`, keeping the aggregation fields
    pub fn apply(&mut self, raw: &RawRegisterBlock) {
        self.manufacturer = fixed_str(&raw.manufacturer);
        self.model = fixed_str(&raw.model);
        self.version = fixed_str(&raw.version);
        self.serial_number = fixed_str(&raw.serial_number);
        self.phase = raw.phase;

        self.ac_current = scale(raw.ac_current, raw.ac_current_sf);
        self.ac_current_a = scale(raw.ac_current_a, raw.ac_current_sf);
        self.ac_current_b = scale(raw.ac_current_b, raw.ac_current_sf);
        self.ac_current_c = scale(raw.ac_current_c, raw.ac_current_sf);

        self.ac_voltage_ab = scale(raw.ac_voltage_ab, raw.ac_voltage_sf);
        self.ac_voltage_bc = scale(raw.ac_voltage_bc, raw.ac_voltage_sf);
        self.ac_voltage_ca = scale(raw.ac_voltage_ca, raw.ac_voltage_sf);
        self.ac_voltage_an = scale(raw.ac_voltage_an, raw.ac_voltage_sf);
        self.ac_voltage_bn = scale(raw.ac_voltage_bn, raw.ac_voltage_sf);
        self.ac_voltage_cn = scale(raw.ac_voltage_cn, raw.ac_voltage_sf);

        self.ac_power = scale(raw.ac_power, raw.ac_power_sf);
        self.ac_frequency = scale(raw.ac_frequency, raw.ac_frequency_sf);
        self.ac_va = scale(raw.ac_va, raw.ac_va_sf);
        self.ac_var = scale(raw.ac_var, raw.ac_var_sf);
        self.ac_pf = scale(raw.ac_pf, raw.ac_pf_sf);
        self.ac_energy_wh = scale(raw.ac_energy_wh, raw.ac_energy_wh_sf);

        self.dc_current = scale(raw.dc_current, raw.dc_current_sf);
        self.dc_voltage = scale(raw.dc_voltage, raw.dc_voltage_sf);
        self.dc_power = scale(raw.dc_power, raw.dc_power_sf);

        self.temp_sink = scale(raw.temp_sink, raw.temp_sf);

        self.status = raw.status;
        self.status_vendor = raw.status_vendor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sunspec::to_fixed;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_scale_factor() {
        assert!(approx(scale(1234u16, -2), 12.34));
        assert!(approx(scale(500i16, 0), 500.0));
        assert!(approx(scale(-75i16, 1), -750.0));
        assert!(approx(scale(4_294_967_295u32, -3), 4_294_967.5));
    }

    #[test]
    fn test_convert_groups_share_scale_factor() {
        let raw = RawRegisterBlock {
            manufacturer: to_fixed("SolarEdge "),
            ac_current: 1234,
            ac_current_a: 411,
            ac_current_b: 412,
            ac_current_c: 411,
            ac_current_sf: -2,
            ac_voltage_an: 2301,
            ac_voltage_sf: -1,
            ac_power: 500,
            ac_power_sf: 0,
            ac_frequency: 4999,
            ac_frequency_sf: -2,
            ac_pf: -9850,
            ac_pf_sf: -2,
            ac_energy_wh: 1_234_567,
            ac_energy_wh_sf: 0,
            temp_sink: 4512,
            temp_sf: -2,
            status: 4,
            status_vendor: 17,
            ..Default::default()
        };

        let m = Measurement::from_registers(&raw);
        assert_eq!(m.manufacturer, "SolarEdge ");
        assert_eq!(m.phase, 103);
        assert!(approx(m.ac_current, 12.34));
        assert!(approx(m.ac_current_b, 4.12));
        assert!(approx(m.ac_voltage_an, 230.1));
        assert_eq!(m.ac_power, 500.0);
        assert!(approx(m.ac_frequency, 49.99));
        assert!(approx(m.ac_pf, -98.5));
        assert_eq!(m.ac_energy_wh, 1_234_567.0);
        assert!(approx(m.temp_sink, 45.12));
        assert_eq!(m.status, 4);
        assert_eq!(m.status_vendor, 17);
    }

    #[test]
    fn test_apply_keeps_aggregation_fields() {
        let mut m = Measurement {
            energy_wh_at_day_start: 1000.0,
            avg_power_1h: 321.0,
            power_1h_ready: true,
            ..Default::default()
        };

        m.apply(&RawRegisterBlock {
            ac_power: 42,
            ..Default::default()
        });

        assert_eq!(m.ac_power, 42.0);
        assert_eq!(m.energy_wh_at_day_start, 1000.0);
        assert_eq!(m.avg_power_1h, 321.0);
        assert!(m.power_1h_ready);
    }
}
