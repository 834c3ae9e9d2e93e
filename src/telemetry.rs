//! Typed telemetry records decoded from CAN frames
//!
//! Each record is replaced wholesale whenever its defining message arrives; nothing
//! here is merged field by field. [`TelemetrySnapshot`] collects the latest copy of
//! every record for consumers.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BusResult;

/// Operating state reported in the status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChargerState {
    Uninit,
    Standby,
    Charging,
    Fault,
    Unknown(u8),
}

impl ChargerState {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => ChargerState::Uninit,
            0x01 => ChargerState::Standby,
            0x04 => ChargerState::Charging,
            0x10 => ChargerState::Fault,
            other => ChargerState::Unknown(other),
        }
    }
}

impl Default for ChargerState {
    fn default() -> Self {
        ChargerState::Uninit
    }
}

impl fmt::Display for ChargerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargerState::Uninit => f.write_str("Uninit"),
            ChargerState::Standby => f.write_str("Standby"),
            ChargerState::Charging => f.write_str("Charging"),
            ChargerState::Fault => f.write_str("Fault"),
            ChargerState::Unknown(raw) => write!(f, "Unknown(0x{:02X})", raw),
        }
    }
}

/// CAN bit rate the charger is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CanBaudRate {
    Kbps125,
    Kbps250,
    Kbps500,
    Mbps1,
    Kbps800,
    Unknown(u8),
}

impl CanBaudRate {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => CanBaudRate::Kbps125,
            1 => CanBaudRate::Kbps250,
            2 => CanBaudRate::Kbps500,
            3 => CanBaudRate::Mbps1,
            4 => CanBaudRate::Kbps800,
            other => CanBaudRate::Unknown(other),
        }
    }

    /// Bit rate in bits per second, if known
    pub fn bits_per_second(&self) -> Option<u32> {
        match self {
            CanBaudRate::Kbps125 => Some(125_000),
            CanBaudRate::Kbps250 => Some(250_000),
            CanBaudRate::Kbps500 => Some(500_000),
            CanBaudRate::Mbps1 => Some(1_000_000),
            CanBaudRate::Kbps800 => Some(800_000),
            CanBaudRate::Unknown(_) => None,
        }
    }
}

/// DC output measurement (0x311)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerMeasurement {
    pub voltage_v: f64,
    pub current_a: f64,
    pub charging: bool,
}

impl PowerMeasurement {
    pub fn power_w(&self) -> f64 {
        self.voltage_v * self.current_a
    }
}

/// AC input measurement (0x3C1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AcMeasurement {
    pub voltage_v: f64,
    pub current_a: f64,
    pub frequency_hz: f64,
}

/// Charger state and protection bits (0x321)
///
/// This is the authoritative fault source of the control-module message family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub state: ChargerState,
    pub fault: bool,
    pub ocp: bool,
    pub ovp: bool,
    pub watchdog: bool,
}

/// Wireless link efficiency and coil gap (0x3E1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WirelessStatus {
    pub efficiency_pct: f64,
    pub gap_mm: u8,
}

/// Wireless flags (0x5F1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WirelessFlagsReport {
    pub under_current: bool,
    pub wireless_ok: bool,
}

/// Coil temperatures in °C (0x3F1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TemperatureReport {
    pub secondary_c: f64,
    pub primary_c: f64,
}

/// Lifetime energy counters (0x511)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LifeReportA {
    pub ah_delivered: f64,
    pub charge_cycles: u32,
}

/// Lifetime uptime (0x521)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifeReportB {
    pub uptime_s: u32,
}

/// Lifetime load and idle time (0x531)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifeReportC {
    pub load_time_s: u32,
    pub idle_time_s: u32,
}

/// Serial number and software version (0x721)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfigReportA {
    pub serial_number: u32,
    pub sw_major: u8,
    pub sw_minor: u8,
    pub sw_debug: u8,
    pub mcu_id: u8,
}

impl ConfigReportA {
    pub fn software_version(&self) -> String {
        format!("{}.{}.{}", self.sw_major, self.sw_minor, self.sw_debug)
    }
}

/// Part number, build date and hardware revision (0x731)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfigReportB {
    pub part_number: u32,
    pub week: u8,
    pub year: u8,
    pub hw_minor: u8,
    pub hw_major: u8,
}

/// Wireless communication channel info (0x771)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CommInfoReport {
    pub channel: u8,
    pub comm_id: u8,
    /// Fraction of successful exchanges, 0.0..=1.0
    pub success_rate: f64,
}

/// Control command as seen on the bus (0x191)
///
/// Mirrors what is actually being transmitted, not what a caller last requested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlCommandReport {
    pub demand_voltage_v: f64,
    pub demand_current_a: f64,
    pub power_enable: bool,
    pub clear_faults: bool,
    pub power_stage1: bool,
    pub timestamp: DateTime<Utc>,
}

impl ControlCommandReport {
    /// Power enabled, stage 1 on and a non-zero current demand
    pub fn is_power_requested(&self) -> bool {
        self.power_enable && self.power_stage1 && self.demand_current_a > 0.0
    }

    pub fn is_power_off(&self) -> bool {
        !self.power_enable || self.demand_current_a <= 0.0
    }

    /// Whether the mirror is older than `timeout` at `now`
    pub fn is_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (now - self.timestamp).to_std() {
            Ok(age) => age > timeout,
            Err(_) => false,
        }
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.is_stale_at(Utc::now(), timeout)
    }
}

bitflags! {
    /// Legacy fault bitmap (0x5F*), bytes 0..3 little-endian
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FaultFlags: u32 {
        // byte 0: output
        const OVP = 1 << 0;
        const OCP = 1 << 1;
        const SHORT_CIRCUIT = 1 << 2;
        const OTP_PRIMARY = 1 << 3;
        const OTP_SECONDARY = 1 << 4;
        const OUTPUT_OPEN = 1 << 5;
        const POLARITY_REVERSE = 1 << 6;
        const OUTPUT_DISABLED = 1 << 7;
        // byte 1: AC input
        const AC_UNDER_VOLTAGE = 1 << 8;
        const AC_OVER_VOLTAGE = 1 << 9;
        const AC_FREQUENCY = 1 << 10;
        const PHASE_LOSS = 1 << 11;
        const SURGE = 1 << 12;
        const RIPPLE = 1 << 13;
        const EMI = 1 << 14;
        const ISOLATION = 1 << 15;
        // byte 2: wireless
        const GAP_TOO_HIGH = 1 << 16;
        const MISALIGNMENT_HIGH = 1 << 17;
        const FOREIGN_OBJECT = 1 << 18;
        const COMM_TIMEOUT = 1 << 19;
        const DERATING = 1 << 20;
        const TX_FAULT = 1 << 21;
        const RX_FAULT = 1 << 22;
        const RF_FAULT = 1 << 23;
        // byte 3: system
        const BMS_NO_COMMAND = 1 << 24;
        const BMS_STOP = 1 << 25;
        const PROFILE_ERROR = 1 << 26;
        const SAFETY_STOP = 1 << 27;
        const INTERNAL_COMM = 1 << 28;
        const EEPROM = 1 << 29;
        const SENSOR_FAULT = 1 << 30;
        const CHARGER_LOCKED = 1 << 31;
    }
}

bitflags! {
    /// Legacy status bitmap (0x77*), bytes 0..3 little-endian
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct StatusFlags: u32 {
        const INPUT_OK = 1 << 0;
        const CHARGING_ENABLED = 1 << 1;
        const CC_MODE = 1 << 2;
        const CV_MODE = 1 << 3;
        const MISALIGNMENT_WARNING = 1 << 8;
        const FOD_WARNING = 1 << 9;
        const RF_LINK_WARNING = 1 << 10;
        const THERMAL_DERATING = 1 << 11;
        const FOD_ACTIVE = 1 << 22;
        const INTERNAL_PROTECTION = 1 << 23;
        const SAFETY_STOP = 1 << 24;
        const RX_FAULT = 1 << 25;
        const TX_FAULT = 1 << 27;
        const EEPROM_FAULT = 1 << 29;
        const COMM_FAULT = 1 << 30;
        const CHARGER_LOCKED = 1 << 31;
    }
}

impl FaultFlags {
    /// Assemble from the first four payload bytes
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_bits_retain(u32::from_le_bytes(bytes))
    }

    pub fn has_ac_alert(&self) -> bool {
        self.intersects(Self::AC_UNDER_VOLTAGE | Self::AC_OVER_VOLTAGE | Self::AC_FREQUENCY)
    }
}

impl StatusFlags {
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_bits_retain(u32::from_le_bytes(bytes))
    }
}

/// Legacy DC output (0x31*)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LegacyOutput {
    pub voltage_v: f64,
    pub current_a: f64,
}

impl LegacyOutput {
    pub fn power_w(&self) -> f64 {
        self.voltage_v * self.current_a
    }
}

/// Legacy coil alignment, signed millimetres (0x32*)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyAlignment {
    pub gap_mm: i8,
    pub misalignment_mm: i8,
}

/// Legacy AC input (0x3C*)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LegacyAcInput {
    pub voltage_v: f64,
    pub current_a: f64,
    pub frequency_hz: f64,
}

impl LegacyAcInput {
    pub fn power_w(&self) -> f64 {
        self.voltage_v * self.current_a
    }
}

/// Legacy temperatures, offset by 40 °C on the wire (0x3E*)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyTemperatures {
    pub primary_c: i16,
    pub secondary_c: i16,
}

/// Legacy RF coupling and power (0x3F*)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LegacyRf {
    pub coupling: f64,
    pub rf_power: f64,
}

/// Firmware revisions carried with the legacy status bitmap (0x77*)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FirmwareRevisions {
    pub mcu1: u8,
    pub mcu2: u8,
    pub dsp: u8,
}

/// Latest copy of every telemetry record
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub power: Option<PowerMeasurement>,
    pub status: Option<StatusReport>,
    pub ac: Option<AcMeasurement>,
    pub wireless: Option<WirelessStatus>,
    pub wireless_flags: Option<WirelessFlagsReport>,
    pub temperature: Option<TemperatureReport>,
    pub life_a: Option<LifeReportA>,
    pub life_b: Option<LifeReportB>,
    pub life_c: Option<LifeReportC>,
    pub config_a: Option<ConfigReportA>,
    pub config_b: Option<ConfigReportB>,
    pub comm_info: Option<CommInfoReport>,
    pub can_baud: Option<CanBaudRate>,
    pub control: Option<ControlCommandReport>,

    pub legacy_output: Option<LegacyOutput>,
    pub legacy_alignment: Option<LegacyAlignment>,
    pub legacy_ac: Option<LegacyAcInput>,
    pub legacy_temperatures: Option<LegacyTemperatures>,
    pub legacy_rf: Option<LegacyRf>,
    pub rssi: Option<i16>,
    pub fault_flags: Option<FaultFlags>,
    pub status_flags: Option<StatusFlags>,
    pub firmware: Option<FirmwareRevisions>,
}

impl TelemetrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault bit of the status report; false until one has been received
    pub fn is_faulted(&self) -> bool {
        self.status.map_or(false, |s| s.fault)
    }

    pub fn is_charging(&self) -> bool {
        self.power.map_or(false, |p| p.charging)
    }

    pub fn output_power_w(&self) -> Option<f64> {
        self.power.map(|p| p.power_w())
    }

    /// Wireless link up according to the legacy status bitmap
    pub fn wireless_comm_ok(&self) -> bool {
        !self.status_flags().contains(StatusFlags::COMM_FAULT)
    }

    pub fn input_ok(&self) -> bool {
        self.status_flags().contains(StatusFlags::INPUT_OK)
    }

    pub fn power_derating(&self) -> bool {
        self.status_flags().contains(StatusFlags::THERMAL_DERATING)
    }

    /// Any bit set in the legacy fault bitmap
    pub fn fault_present(&self) -> bool {
        !self.fault_flags().is_empty()
    }

    pub fn ac_alert(&self) -> bool {
        self.fault_flags().has_ac_alert()
    }

    pub fn memory_corruption(&self) -> bool {
        self.status_flags().contains(StatusFlags::EEPROM_FAULT)
    }

    fn status_flags(&self) -> StatusFlags {
        self.status_flags.unwrap_or_default()
    }

    fn fault_flags(&self) -> FaultFlags {
        self.fault_flags.unwrap_or_default()
    }

    pub fn to_json(&self) -> BusResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
