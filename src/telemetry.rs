//! Telemetry document
//!
//! The JSON payload a publisher (MQTT or otherwise) sends for every measurement:
//! gateway uptime, identity strings and every converted register under its
//! register name, plus today's production.

use std::time::Duration;

use serde::Serialize;

use crate::error::GatewayResult;
use crate::measurement::Measurement;

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryDocument<'a> {
    /// Seconds since the gateway started
    #[serde(rename = "esp_uptime")]
    pub uptime: u64,
    #[serde(flatten)]
    pub measurement: &'a Measurement,
    /// Lifetime energy minus the day-start baseline
    #[serde(rename = "I_AC_Energy_WH_24H")]
    pub energy_wh_today: f32,
}

impl<'a> TelemetryDocument<'a> {
    pub fn new(measurement: &'a Measurement, uptime: Duration) -> Self {
        Self {
            uptime: uptime.as_secs(),
            measurement,
            energy_wh_today: measurement.ac_energy_wh - measurement.energy_wh_at_day_start,
        }
    }

    pub fn to_json(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
