//! Poll metrics, validation and formatting helpers
//!
//! Shared by the poll services and the monitor binary.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{BusError, BusResult};

/// Timing and success statistics of a poll loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollMetrics {
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PollMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful poll cycle
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_polls += 1;
        self.record(duration);
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
    }

    /// Record a failed poll cycle
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_polls += 1;
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_polls += 1;
        self.total_duration += duration;
        self.avg_duration = self.total_duration / self.total_polls as u32;
    }

    /// Success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        (self.successful_polls as f64 / self.total_polls as f64) * 100.0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring a poll cycle
pub struct OperationTimer {
    start: Instant,
    operation_name: &'static str,
}

impl OperationTimer {
    pub fn start(operation_name: &'static str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
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

    /// Modbus slave address (1-247)
    pub fn validate_slave_id(slave_id: u8) -> BusResult<()> {
        if slave_id == 0 || slave_id > 247 {
            return Err(BusError::configuration(format!(
                "Invalid slave ID: {} (must be 1-247)",
                slave_id
            )));
        }
        Ok(())
    }

    /// Register quantity within `1..=max` and inside the 16-bit address space
    pub fn validate_register_range(start: u16, count: u16, max: u16) -> BusResult<()> {
        if count == 0 || count > max {
            return Err(BusError::configuration(format!(
                "Invalid register count: {} (must be 1-{})",
                count, max
            )));
        }
        if start as u32 + count as u32 > 65536 {
            return Err(BusError::configuration(format!(
                "Register range {}+{} exceeds address space",
                start, count
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else if millis < 3_600_000 {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        } else {
            let hours = millis / 3_600_000;
            let mins = (millis % 3_600_000) / 60_000;
            format!("{}h {}m", hours, mins)
        }
    }

    /// One-line summary of poll metrics
    pub fn format_metrics(metrics: &PollMetrics) -> String {
        format!(
            "polls={} ok={} ({:.1}%) failed={} avg={} max={}",
            metrics.total_polls,
            metrics.successful_polls,
            metrics.success_rate(),
            metrics.failed_polls,
            format_duration(metrics.avg_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}

/// Logger initialisation
pub mod logging {
    use super::*;

    /// Initialise env_logger for binaries, defaulting to `info`
    pub fn init_logger() {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
        info!("Logger initialised");
    }

    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
