//! # CAN Message Decode/Encode Table
//!
//! Received frames are dispatched through a static table of [`MessageSpec`]
//! entries, one per message id. Each entry names the message, the minimum payload
//! length it needs and the function that writes its record into a
//! [`TelemetrySnapshot`]. Unknown ids and short frames are ignored.
//!
//! Two message families exist and are never mixed:
//!
//! - [`DecodeProfile::ControlModule`] (default) matches the exact 11-bit id.
//!   Status report 0x321 is the only fault source in this family.
//! - [`DecodeProfile::Legacy`] matches on the base id (`id & 0x7F0`), so any node
//!   offset of the older firmware decodes the same way.
//!
//! The control frame (0x191) is encoded by [`encode_control_command`]:
//!
//! | bits    | field                     | scale  |
//! |---------|---------------------------|--------|
//! | 0..20   | demand voltage            | 0.001 V|
//! | 20      | power enable              |        |
//! | 21      | clear faults              |        |
//! | 22..31  | stage enables (stage 1=22)|        |
//! | 32..50  | demand current            | 0.001 A|

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitfield;
use crate::can::{RawFrame, CAN_DATA_LEN};
use crate::command::{ControlCommand, STAGE_COUNT};
use crate::telemetry::*;

/// Control command identifier
pub const CONTROL_COMMAND_ID: u32 = 0x191;

/// Legacy firmware identifies messages by the upper id bits only
pub const LEGACY_BASE_MASK: u32 = 0x7F0;

const VOLTAGE_BITS: usize = 20;
const CURRENT_BITS: usize = 18;
const POWER_ENABLE_BIT: usize = 20;
const CLEAR_FAULTS_BIT: usize = 21;
const STAGE_START_BIT: usize = 22;
const CURRENT_START_BIT: usize = 32;

/// Record writer of one message id
pub type DecodeFn = fn(&[u8; CAN_DATA_LEN], &mut TelemetrySnapshot, DateTime<Utc>);

/// One row of a decode table
#[derive(Clone, Copy)]
pub struct MessageSpec {
    pub id: u32,
    pub name: &'static str,
    pub min_len: u8,
    pub decode: DecodeFn,
}

impl std::fmt::Debug for MessageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSpec")
            .field("id", &format_args!("0x{:03X}", self.id))
            .field("name", &self.name)
            .field("min_len", &self.min_len)
            .finish()
    }
}

/// Which message family the charger speaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeProfile {
    #[default]
    ControlModule,
    Legacy,
}

impl DecodeProfile {
    pub fn table(&self) -> &'static [MessageSpec] {
        match self {
            DecodeProfile::ControlModule => &CONTROL_MODULE_TABLE,
            DecodeProfile::Legacy => &LEGACY_TABLE,
        }
    }

    /// Table key for a received identifier
    pub fn key(&self, id: u32) -> u32 {
        match self {
            DecodeProfile::ControlModule => id,
            DecodeProfile::Legacy => id & LEGACY_BASE_MASK,
        }
    }
}

/// Result of feeding one frame to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The named record was replaced
    Applied(&'static str),
    /// No table entry for the id
    Ignored,
    /// Known id, but the payload is shorter than the entry needs
    TooShort { name: &'static str, dlc: u8 },
}

impl DecodeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DecodeOutcome::Applied(_))
    }
}

/// Table-driven frame decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageDecoder {
    profile: DecodeProfile,
}

impl MessageDecoder {
    pub fn new(profile: DecodeProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> DecodeProfile {
        self.profile
    }

    pub fn lookup(&self, id: u32) -> Option<&'static MessageSpec> {
        let key = self.profile.key(id);
        self.profile.table().iter().find(|spec| spec.id == key)
    }

    /// Decode `frame` into `snapshot`
    pub fn decode(&self, frame: &RawFrame, snapshot: &mut TelemetrySnapshot) -> DecodeOutcome {
        let Some(spec) = self.lookup(frame.id()) else {
            return DecodeOutcome::Ignored;
        };
        if frame.dlc() < spec.min_len {
            return DecodeOutcome::TooShort {
                name: spec.name,
                dlc: frame.dlc(),
            };
        }
        (spec.decode)(frame.data(), snapshot, frame.timestamp());
        DecodeOutcome::Applied(spec.name)
    }
}

/// Encode the control frame, saturating out-of-range demands
pub fn encode_control_command(command: &ControlCommand) -> [u8; CAN_DATA_LEN] {
    let mut data = [0u8; CAN_DATA_LEN];
    bitfield::set(&mut data, 0, VOLTAGE_BITS, scale_saturating(command.demand_voltage_v, VOLTAGE_BITS));
    bitfield::set_flag(&mut data, POWER_ENABLE_BIT, command.power_enable);
    bitfield::set_flag(&mut data, CLEAR_FAULTS_BIT, command.clear_faults);
    for (i, on) in command.stage_bits().iter().enumerate() {
        bitfield::set_flag(&mut data, STAGE_START_BIT + i, *on);
    }
    bitfield::set(
        &mut data,
        CURRENT_START_BIT,
        CURRENT_BITS,
        scale_saturating(command.demand_current_a, CURRENT_BITS),
    );
    data
}

/// Decode a control frame back into a command
pub fn decode_control_command(data: &[u8; CAN_DATA_LEN]) -> ControlCommand {
    let mut extra_stages = [false; STAGE_COUNT];
    for (i, stage) in extra_stages.iter_mut().enumerate() {
        *stage = bitfield::flag(data, STAGE_START_BIT + i);
    }
    ControlCommand {
        demand_voltage_v: bitfield::get(data, 0, VOLTAGE_BITS) as f64 * 0.001,
        demand_current_a: bitfield::get(data, CURRENT_START_BIT, CURRENT_BITS) as f64 * 0.001,
        power_enable: bitfield::flag(data, POWER_ENABLE_BIT),
        power_stage1: bitfield::flag(data, STAGE_START_BIT),
        clear_faults: bitfield::flag(data, CLEAR_FAULTS_BIT),
        extra_stages,
    }
}

/// Value ×1000 rounded and clamped to an unsigned `bits`-wide field
fn scale_saturating(value: f64, bits: usize) -> u64 {
    let max = ((1u64 << bits) - 1) as f64;
    // rounded, not truncated: 47.9999 V must go out as 48000 mV
    let scaled = (value * 1000.0).round();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(0.0, max) as u64
}

fn bits(d: &[u8; CAN_DATA_LEN], start: usize, len: usize) -> u64 {
    bitfield::get(d, start, len)
}

fn flag(d: &[u8; CAN_DATA_LEN], bit: usize) -> bool {
    bitfield::flag(d, bit)
}

fn le16(d: &[u8; CAN_DATA_LEN], at: usize) -> u16 {
    u16::from_le_bytes([d[at], d[at + 1]])
}

/// Control-module family, matched on the exact id
static CONTROL_MODULE_TABLE: [MessageSpec; 14] = [
    MessageSpec { id: 0x191, name: "ControlCommand", min_len: 7, decode: decode_control_mirror },
    MessageSpec { id: 0x311, name: "PowerMeasurement", min_len: 5, decode: decode_power },
    MessageSpec { id: 0x321, name: "StatusReport", min_len: 4, decode: decode_status },
    MessageSpec { id: 0x3C1, name: "AcMeasurement", min_len: 6, decode: decode_ac },
    MessageSpec { id: 0x3E1, name: "WirelessStatus", min_len: 5, decode: decode_wireless },
    MessageSpec { id: 0x3F1, name: "TemperatureReport", min_len: 4, decode: decode_temperature },
    MessageSpec { id: 0x511, name: "LifeReportA", min_len: 8, decode: decode_life_a },
    MessageSpec { id: 0x521, name: "LifeReportB", min_len: 4, decode: decode_life_b },
    MessageSpec { id: 0x531, name: "LifeReportC", min_len: 8, decode: decode_life_c },
    MessageSpec { id: 0x5F1, name: "WirelessFlags", min_len: 1, decode: decode_wireless_flags },
    MessageSpec { id: 0x721, name: "ConfigReportA", min_len: 8, decode: decode_config_a },
    MessageSpec { id: 0x731, name: "ConfigReportB", min_len: 7, decode: decode_config_b },
    MessageSpec { id: 0x771, name: "CommInfo", min_len: 6, decode: decode_comm_info },
    MessageSpec { id: 0x781, name: "CanBaudRate", min_len: 1, decode: decode_can_baud },
];

fn decode_control_mirror(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, at: DateTime<Utc>) {
    let command = decode_control_command(d);
    s.control = Some(ControlCommandReport {
        demand_voltage_v: command.demand_voltage_v,
        demand_current_a: command.demand_current_a,
        power_enable: command.power_enable,
        clear_faults: command.clear_faults,
        power_stage1: command.power_stage1,
        timestamp: at,
    });
}

fn decode_power(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.power = Some(PowerMeasurement {
        voltage_v: bits(d, 0, 20) as f64 * 0.001,
        current_a: bits(d, 20, 18) as f64 * 0.001,
        charging: flag(d, 39),
    });
}

fn decode_status(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.status = Some(StatusReport {
        state: ChargerState::from_raw(bits(d, 0, 6) as u8),
        fault: flag(d, 12),
        ocp: flag(d, 18),
        ovp: flag(d, 21) || flag(d, 22),
        watchdog: flag(d, 24),
    });
}

fn decode_ac(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.ac = Some(AcMeasurement {
        voltage_v: bits(d, 0, 20) as f64 * 0.001,
        current_a: bits(d, 20, 18) as f64 * 0.001,
        frequency_hz: bits(d, 38, 10) as f64 * 0.1,
    });
}

fn decode_wireless(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.wireless = Some(WirelessStatus {
        efficiency_pct: bits(d, 16, 10) as f64 * 0.1,
        gap_mm: bits(d, 32, 8) as u8,
    });
}

fn decode_temperature(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.temperature = Some(TemperatureReport {
        secondary_c: bits(d, 0, 16) as u16 as i16 as f64 * 0.005,
        primary_c: bits(d, 16, 16) as u16 as i16 as f64 * 0.005,
    });
}

fn decode_life_a(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.life_a = Some(LifeReportA {
        ah_delivered: bits(d, 0, 32) as f64 * 0.1,
        charge_cycles: bits(d, 32, 32) as u32,
    });
}

fn decode_life_b(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.life_b = Some(LifeReportB {
        uptime_s: bits(d, 0, 32) as u32,
    });
}

fn decode_life_c(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.life_c = Some(LifeReportC {
        load_time_s: bits(d, 0, 32) as u32,
        idle_time_s: bits(d, 32, 32) as u32,
    });
}

fn decode_wireless_flags(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.wireless_flags = Some(WirelessFlagsReport {
        under_current: flag(d, 6),
        wireless_ok: flag(d, 7),
    });
}

fn decode_config_a(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.config_a = Some(ConfigReportA {
        serial_number: bits(d, 0, 32) as u32,
        sw_major: bits(d, 32, 8) as u8,
        sw_minor: bits(d, 40, 8) as u8,
        sw_debug: bits(d, 48, 8) as u8,
        mcu_id: bits(d, 60, 4) as u8,
    });
}

fn decode_config_b(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.config_b = Some(ConfigReportB {
        part_number: bits(d, 0, 32) as u32,
        week: bits(d, 32, 8) as u8,
        year: bits(d, 40, 8) as u8,
        hw_minor: bits(d, 48, 4) as u8,
        hw_major: bits(d, 52, 4) as u8,
    });
}

fn decode_comm_info(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.comm_info = Some(CommInfoReport {
        channel: bits(d, 0, 8) as u8,
        comm_id: bits(d, 8, 8) as u8,
        success_rate: bits(d, 16, 32) as f64 * 0.000001,
    });
}

fn decode_can_baud(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.can_baud = Some(CanBaudRate::from_raw(bits(d, 0, 4) as u8));
}

/// Legacy family, matched on `id & 0x7F0`
static LEGACY_TABLE: [MessageSpec; 8] = [
    MessageSpec { id: 0x310, name: "LegacyOutput", min_len: 4, decode: decode_legacy_output },
    MessageSpec { id: 0x320, name: "LegacyAlignment", min_len: 2, decode: decode_legacy_alignment },
    MessageSpec { id: 0x3C0, name: "LegacyAcInput", min_len: 6, decode: decode_legacy_ac },
    MessageSpec { id: 0x3E0, name: "LegacyTemperatures", min_len: 2, decode: decode_legacy_temperatures },
    MessageSpec { id: 0x3F0, name: "LegacyRf", min_len: 4, decode: decode_legacy_rf },
    MessageSpec { id: 0x520, name: "LegacyRssi", min_len: 2, decode: decode_legacy_rssi },
    MessageSpec { id: 0x5F0, name: "FaultFlags", min_len: 4, decode: decode_fault_flags },
    MessageSpec { id: 0x770, name: "StatusFlags", min_len: 7, decode: decode_status_flags },
];

fn decode_legacy_output(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.legacy_output = Some(LegacyOutput {
        voltage_v: le16(d, 0) as f64 * 0.001,
        current_a: le16(d, 2) as f64 * 0.001,
    });
}

fn decode_legacy_alignment(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.legacy_alignment = Some(LegacyAlignment {
        gap_mm: d[0] as i8,
        misalignment_mm: d[1] as i8,
    });
}

fn decode_legacy_ac(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.legacy_ac = Some(LegacyAcInput {
        voltage_v: le16(d, 0) as f64 * 0.1,
        current_a: le16(d, 2) as f64 * 0.01,
        frequency_hz: d[4] as f64,
    });
}

fn decode_legacy_temperatures(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.legacy_temperatures = Some(LegacyTemperatures {
        primary_c: d[0] as i16 - 40,
        secondary_c: d[1] as i16 - 40,
    });
}

fn decode_legacy_rf(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.legacy_rf = Some(LegacyRf {
        coupling: le16(d, 0) as f64 * 0.1,
        rf_power: le16(d, 2) as f64 * 0.1,
    });
}

fn decode_legacy_rssi(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.rssi = Some(le16(d, 0) as i16);
}

fn decode_fault_flags(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.fault_flags = Some(FaultFlags::from_le_bytes([d[0], d[1], d[2], d[3]]));
}

fn decode_status_flags(d: &[u8; CAN_DATA_LEN], s: &mut TelemetrySnapshot, _: DateTime<Utc>) {
    s.status_flags = Some(StatusFlags::from_le_bytes([d[0], d[1], d[2], d[3]]));
    s.firmware = Some(FirmwareRevisions {
        mcu1: d[4],
        mcu2: d[5],
        dsp: d[6],
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(id: u32, fields: &[(usize, usize, u64)]) -> RawFrame {
        let mut data = [0u8; CAN_DATA_LEN];
        for (start, len, value) in fields {
            bitfield::set(&mut data, *start, *len, *value);
        }
        RawFrame::new(id, &data)
    }

    #[test]
    fn test_command_round_trip() {
        let command = ControlCommand::power_on(48.0, 10.0);
        let data = encode_control_command(&command);
        let decoded = decode_control_command(&data);
        assert!((decoded.demand_voltage_v - 48.0).abs() < 0.001);
        assert!((decoded.demand_current_a - 10.0).abs() < 0.001);
        assert!(decoded.power_enable);
        assert!(decoded.power_stage1);
        assert!(!decoded.clear_faults);
    }

    #[test]
    fn test_encode_layout() {
        let mut command = ControlCommand::power_on(1.0, 0.5);
        command.clear_faults = true;
        let data = encode_control_command(&command);
        // 1000 = 0x3E8; PE bit 20, CLR bit 21, ST1 bit 22 -> byte 2 = 0x70
        assert_eq!(data, [0xE8, 0x03, 0x70, 0x00, 0xF4, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_saturates() {
        let command = ControlCommand {
            demand_voltage_v: 5000.0,
            demand_current_a: 999.0,
            ..ControlCommand::default()
        };
        let decoded = decode_control_command(&encode_control_command(&command));
        assert!((decoded.demand_current_a - ((1u64 << 18) - 1) as f64 * 0.001).abs() < 1e-9);
        assert!((decoded.demand_voltage_v - ((1u64 << 20) - 1) as f64 * 0.001).abs() < 1e-9);

        let negative = ControlCommand {
            demand_voltage_v: -5.0,
            demand_current_a: f64::NAN,
            ..ControlCommand::default()
        };
        assert_eq!(encode_control_command(&negative), [0u8; 8]);
    }

    #[test]
    fn test_encode_rounds_to_nearest_unit() {
        let command = ControlCommand::power_on(47.9999, 9.9996);
        let data = encode_control_command(&command);
        assert_eq!(bitfield::get(&data, 0, VOLTAGE_BITS), 48_000);
        assert_eq!(bitfield::get(&data, CURRENT_START_BIT, CURRENT_BITS), 10_000);
    }

    #[test]
    fn test_stage_bits() {
        let mut command = ControlCommand::default();
        command.extra_stages[8] = true;
        let data = encode_control_command(&command);
        assert!(bitfield::flag(&data, 30));
        assert!(!bitfield::flag(&data, 31));
        assert!(decode_control_command(&data).extra_stages[8]);
    }

    #[test]
    fn test_control_module_records() {
        let decoder = MessageDecoder::default();
        let mut snapshot = TelemetrySnapshot::new();

        let power = frame_with(0x311, &[(0, 20, 48_000), (20, 18, 12_500), (39, 1, 1)]);
        assert_eq!(decoder.decode(&power, &mut snapshot), DecodeOutcome::Applied("PowerMeasurement"));
        let p = snapshot.power.unwrap();
        assert!((p.voltage_v - 48.0).abs() < 1e-9);
        assert!((p.current_a - 12.5).abs() < 1e-9);
        assert!(p.charging);

        let status = frame_with(0x321, &[(0, 6, 0x10), (12, 1, 1), (22, 1, 1)]);
        decoder.decode(&status, &mut snapshot);
        let st = snapshot.status.unwrap();
        assert_eq!(st.state, ChargerState::Fault);
        assert!(st.fault && st.ovp && !st.ocp && !st.watchdog);
        assert!(snapshot.is_faulted());

        let temps = frame_with(0x3F1, &[(0, 16, (-200i16) as u16 as u64), (16, 16, 5000)]);
        decoder.decode(&temps, &mut snapshot);
        let t = snapshot.temperature.unwrap();
        assert!((t.secondary_c + 1.0).abs() < 1e-9);
        assert!((t.primary_c - 25.0).abs() < 1e-9);

        let ac = frame_with(0x3C1, &[(0, 20, 230_000), (20, 18, 3_000), (38, 10, 500)]);
        decoder.decode(&ac, &mut snapshot);
        assert!((snapshot.ac.unwrap().frequency_hz - 50.0).abs() < 1e-9);

        let config = frame_with(0x721, &[(0, 32, 123456), (32, 8, 2), (40, 8, 7), (48, 8, 1), (60, 4, 3)]);
        decoder.decode(&config, &mut snapshot);
        let c = snapshot.config_a.unwrap();
        assert_eq!(c.serial_number, 123456);
        assert_eq!(c.software_version(), "2.7.1");
        assert_eq!(c.mcu_id, 3);

        let comm = frame_with(0x771, &[(0, 8, 4), (8, 8, 9), (16, 32, 987_000)]);
        decoder.decode(&comm, &mut snapshot);
        assert!((snapshot.comm_info.unwrap().success_rate - 0.987).abs() < 1e-9);

        let baud = frame_with(0x781, &[(0, 4, 2)]);
        decoder.decode(&baud, &mut snapshot);
        assert_eq!(snapshot.can_baud, Some(CanBaudRate::Kbps500));
    }

    #[test]
    fn test_control_mirror_timestamp() {
        let decoder = MessageDecoder::default();
        let mut snapshot = TelemetrySnapshot::new();
        let at = Utc::now();
        let data = encode_control_command(&ControlCommand::power_on(24.0, 5.0));
        let frame = RawFrame::with_timestamp(CONTROL_COMMAND_ID, &data, at);
        decoder.decode(&frame, &mut snapshot);
        let mirror = snapshot.control.unwrap();
        assert_eq!(mirror.timestamp, at);
        assert!(mirror.is_power_requested());
    }

    #[test]
    fn test_unknown_and_short_frames_ignored() {
        let decoder = MessageDecoder::default();
        let mut snapshot = TelemetrySnapshot::new();

        let unknown = RawFrame::new(0x123, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decoder.decode(&unknown, &mut snapshot), DecodeOutcome::Ignored);

        let short = RawFrame::new(0x511, &[1, 2, 3]);
        assert_eq!(
            decoder.decode(&short, &mut snapshot),
            DecodeOutcome::TooShort { name: "LifeReportA", dlc: 3 }
        );
        assert_eq!(snapshot, TelemetrySnapshot::new());
    }

    #[test]
    fn test_legacy_family() {
        let decoder = MessageDecoder::new(DecodeProfile::Legacy);
        let mut snapshot = TelemetrySnapshot::new();

        // any node offset within the base id decodes the same way
        decoder.decode(&RawFrame::new(0x5F3, &[0x01, 0x00, 0x04, 0x80]), &mut snapshot);
        let faults = snapshot.fault_flags.unwrap();
        assert!(faults.contains(FaultFlags::OVP));
        assert!(faults.contains(FaultFlags::FOREIGN_OBJECT));
        assert!(faults.contains(FaultFlags::CHARGER_LOCKED));

        decoder.decode(&RawFrame::new(0x771, &[0x01, 0x08, 0x00, 0x40, 3, 4, 5]), &mut snapshot);
        assert!(snapshot.input_ok());
        assert!(snapshot.power_derating());
        assert!(!snapshot.wireless_comm_ok());
        assert_eq!(snapshot.firmware.unwrap().dsp, 5);

        decoder.decode(&RawFrame::new(0x3E1, &[65, 30]), &mut snapshot);
        let temps = snapshot.legacy_temperatures.unwrap();
        assert_eq!((temps.primary_c, temps.secondary_c), (25, -10));

        decoder.decode(&RawFrame::new(0x321, &[0xFE, 0x05]), &mut snapshot);
        assert_eq!(snapshot.legacy_alignment.unwrap().gap_mm, -2);

        decoder.decode(&RawFrame::new(0x311, &[0x80, 0xBB, 0x10, 0x27]), &mut snapshot);
        let out = snapshot.legacy_output.unwrap();
        assert!((out.voltage_v - 48.0).abs() < 1e-9);
        assert!((out.current_a - 10.0).abs() < 1e-9);

        // the control-module status report is not part of this family
        assert!(snapshot.status.is_none());
    }
}
