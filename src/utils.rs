/// Utility functions and helpers for the acquisition pipeline
///
/// Poll-cycle metrics, an operation timer, request validation and formatting
/// helpers shared by the transport, the loop and the binaries.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult};

/// Performance metrics for poll cycles
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub reconnects: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cycle that published a measurement
    pub fn record_success(&mut self, duration: Duration) {
        self.total_cycles += 1;
        self.successful_cycles += 1;
        self.total_duration += duration;

        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));

        self.update_average();
    }

    /// Record a cycle that ended in close-and-retry
    pub fn record_failure(&mut self, duration: Duration) {
        self.total_cycles += 1;
        self.failed_cycles += 1;
        self.total_duration += duration;

        self.update_average();
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }

    fn update_average(&mut self) {
        if self.total_cycles > 0 {
            self.avg_duration = self.total_duration / self.total_cycles as u32;
        }
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        (self.successful_cycles as f64 / self.total_cycles as f64) * 100.0
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
///
/// Uses the tokio clock so that durations follow paused time in tests.
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            debug!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Request validation
pub mod validation {
    use super::*;

    /// Validate unit id (1-247)
    pub fn validate_unit_id(unit_id: u8) -> GatewayResult<()> {
        if unit_id == 0 || unit_id > 247 {
            return Err(GatewayError::configuration(format!(
                "Invalid unit ID: {} (must be 1-247)",
                unit_id
            )));
        }
        Ok(())
    }

    /// Validate register count for read operations
    pub fn validate_register_count(count: u16) -> GatewayResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(GatewayError::configuration(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Check that `[start, start + count)` lies inside `[base, base + len)`
    pub fn within_block(start: u16, count: u16, base: u16, len: u16) -> bool {
        let start = start as u32;
        let end = start + count as u32;
        start >= base as u32 && end <= base as u32 + len as u32
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as space separated upper-case hex
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        let encoded = hex::encode_upper(bytes);
        let mut out = String::with_capacity(bytes.len() * 3);
        for (i, pair) in encoded.as_bytes().chunks(2).enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(std::str::from_utf8(pair).unwrap_or("??"));
        }
        out
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// One-line summary of the poll metrics
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "cycles={} ok={} ({:.1}%) failed={} reconnects={} avg={} min={} max={}",
            metrics.total_cycles,
            metrics.successful_cycles,
            metrics.success_rate(),
            metrics.failed_cycles,
            metrics.reconnects,
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}

/// Logging utilities
pub mod logging {
    use super::*;

    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    /// Log the outcome of a poll cycle
    pub fn log_cycle(metrics: &PerformanceMetrics) {
        if metrics.total_cycles > 0 && metrics.total_cycles % 60 == 0 {
            info!("Poll statistics: {}", format::format_metrics(metrics));
        }
    }
}
