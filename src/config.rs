//! Link and service configuration
//!
//! Every section has defaults matching the field installation (19200 8N1 for the
//! BMU link, 9600 8N1 for the remote-control Modbus slave, `can0` at a 100 ms
//! command period), so a config file only lists what differs. Durations are stored
//! as `*_ms` integers and exposed through [`Duration`] accessors.
//!
//! ```toml
//! [bmu]
//! serial = { port_name = "/dev/ttyUSB0", baud_rate = 19200 }
//!
//! [remote]
//! serial = { port_name = "/dev/ttyUSB1" }
//! slave_id = 1
//!
//! [can]
//! interface = "can0"
//! profile = "control_module"
//!
//! [watchdog]
//! period_ms = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoder::DecodeProfile;
use crate::error::{BusError, BusResult};

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Serial stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(s: StopBits) -> Self {
        match s {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Hex-dump every packet on this port
    pub packet_logging: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: default_port_name(),
            baud_rate: 19200,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::One,
            read_timeout_ms: 2000,
            write_timeout_ms: 1000,
            packet_logging: false,
        }
    }
}

#[cfg(windows)]
fn default_port_name() -> String {
    "COM3".to_string()
}

#[cfg(not(windows))]
fn default_port_name() -> String {
    "/dev/ttyUSB0".to_string()
}

impl SerialConfig {
    /// Settings used by the remote-control Modbus slave
    pub fn modbus_default() -> Self {
        Self {
            baud_rate: 9600,
            read_timeout_ms: 500,
            write_timeout_ms: 500,
            ..Self::default()
        }
    }

    pub fn with_port<S: Into<String>>(mut self, port_name: S) -> Self {
        self.port_name = port_name.into();
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_timeouts(mut self, read_ms: u64, write_ms: u64) -> Self {
        self.read_timeout_ms = read_ms;
        self.write_timeout_ms = write_ms;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn tokio_data_bits(&self) -> BusResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(BusError::configuration(format!("Unsupported data bits: {}", other))),
        }
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.port_name.is_empty() {
            return Err(BusError::configuration("Serial port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(BusError::configuration("Baud rate must be positive"));
        }
        self.tokio_data_bits().map(|_| ())
    }
}

/// BMU frame protocol link and its poll service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BmuConfig {
    pub serial: SerialConfig,
    /// Device address placed in bytes 2 and 5 of every request
    pub address: u8,
    pub poll_period_ms: u64,
    /// Delay after writing a request before reading starts
    pub settle_delay_ms: u64,
    /// No valid frame for this long faults the link
    pub data_timeout_ms: u64,
    /// Consecutive empty or bad reads that fault the link
    pub max_consecutive_failures: u32,
}

impl Default for BmuConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            address: 0x60,
            poll_period_ms: 500,
            settle_delay_ms: 50,
            data_timeout_ms: 10_000,
            max_consecutive_failures: 3,
        }
    }
}

impl BmuConfig {
    pub fn with_serial(mut self, serial: SerialConfig) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }
}

/// Remote-control Modbus slave and its poll service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub serial: SerialConfig,
    pub slave_id: u8,
    pub start_register: u16,
    pub register_count: u16,
    pub poll_period_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::modbus_default(),
            slave_id: 1,
            start_register: 0x0001,
            register_count: 4,
            poll_period_ms: 200,
        }
    }
}

impl RemoteConfig {
    pub fn with_serial(mut self, serial: SerialConfig) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_slave_id(mut self, slave_id: u8) -> Self {
        self.slave_id = slave_id;
        self
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

/// CAN interface and telemetry decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    pub interface: String,
    /// Socket read timeout; bounds how long shutdown waits for the receive thread
    pub read_timeout_ms: u64,
    pub profile: DecodeProfile,
    /// Minimum spacing between "telemetry changed" notifications
    pub notify_interval_ms: u64,
    /// Raw frames kept for inspection
    pub history_len: usize,
    /// Hex-dump every frame sent and received
    pub packet_logging: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            read_timeout_ms: 100,
            profile: DecodeProfile::default(),
            notify_interval_ms: 100,
            history_len: 200,
            packet_logging: false,
        }
    }
}

impl CanConfig {
    pub fn with_interface<S: Into<String>>(mut self, interface: S) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn with_profile(mut self, profile: DecodeProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }
}

/// Command watchdog timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub period_ms: u64,
    /// CAN id of the outgoing control frame
    pub command_id: u32,
    /// Skip Active ticks whose command has zero demand and no flags set
    pub suppress_blank_frames: bool,
    /// Age after which the mirrored command on the bus counts as stale
    pub staleness_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            period_ms: 100,
            command_id: 0x191,
            suppress_blank_frames: false,
            staleness_timeout_ms: 500,
        }
    }
}

impl WatchdogConfig {
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_blank_suppression(mut self, suppress: bool) -> Self {
        self.suppress_blank_frames = suppress;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms)
    }
}

/// Top-level configuration file
///
/// Links without a section are not started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargebusConfig {
    pub bmu: Option<BmuConfig>,
    pub remote: Option<RemoteConfig>,
    pub can: Option<CanConfig>,
    pub watchdog: WatchdogConfig,
}

impl ChargebusConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> BusResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> BusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> BusResult<()> {
        if let Some(bmu) = &self.bmu {
            bmu.serial.validate()?;
        }
        if let Some(remote) = &self.remote {
            remote.serial.validate()?;
            if remote.register_count < 4 {
                return Err(BusError::configuration(format!(
                    "Remote state needs 4 registers, got {}",
                    remote.register_count
                )));
            }
        }
        if let Some(can) = &self.can {
            if can.interface.is_empty() {
                return Err(BusError::configuration("CAN interface name is empty"));
            }
        }
        if self.watchdog.period_ms == 0 {
            return Err(BusError::configuration("Watchdog period must be positive"));
        }
        Ok(())
    }
}
