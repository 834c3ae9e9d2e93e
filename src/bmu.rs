//! # BMU Frame Protocol
//!
//! Request/response protocol spoken by the battery monitor unit on the RS-485 link.
//!
//! ## Frame Layout
//!
//! ```text
//! request:  AF FA | addr | 05 | 01 | addr | kind1 | kind2 | sum | AF A0
//! response: AF FA | addr | len | 03 | addr | data (len - 3 bytes) | sum | AF A0
//! ```
//!
//! The request checksum is the 8-bit sum of bytes 2..8. A response is `len + 6`
//! bytes long. Response data is a sequence of big-endian 16-bit words whose meaning
//! is fixed by position:
//!
//! | word | quantity | scale |
//! |------|----------|-------|
//! | 0 | voltage | 0.01 V |
//! | 1 | current (signed) | 0.01 A |
//! | 2 | SOC | % |
//! | 3 | status bits | see [`BmuAlarms`] |
//! | 4 | charge time | raw |
//! | 5 | discharge time | raw |
//! | 6 | temperature (signed) | 0.1 °C |
//! | 7 | SOH | % |
//! | 8 | remaining capacity | 0.01 Ah |
//! | 9 | remaining energy | 0.1 |
//!
//! ## Resynchronisation
//!
//! [`FrameScanner`] hunts for the `AF FA` marker and accepts a candidate only if it
//! ends in `AF A0`. A bad candidate loses its marker and hunting resumes, so a
//! corrupted frame never swallows the valid frame behind it.
//!
//! Some installations drop the marker in front of responses from address `0x4D`.
//! A buffer starting with `4D` is therefore tried as `addr | len | ... | AF A0`
//! (`len + 4` bytes) and handed on with `AF FA` put back in front.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::checksum::sum8;
use crate::config::BmuConfig;
use crate::error::{BusError, BusResult};
use crate::link::StalenessGuard;
use crate::logging::BusKind;
use crate::serial::{PortOpener, SerialLink, SerialSession, SerialTransport, SystemPortOpener};

pub const FRAME_HEADER: [u8; 2] = [0xAF, 0xFA];
pub const FRAME_FOOTER: [u8; 2] = [0xAF, 0xA0];

/// Command byte of a status request
pub const CMD_READ_STATUS: u8 = 0x01;

/// Command byte of a status response
pub const CMD_STATUS_RESPONSE: u8 = 0x03;

pub const REQUEST_LEN: usize = 11;
pub const MIN_RESPONSE_LEN: usize = 9;
pub const DEFAULT_ADDRESS: u8 = 0x60;

/// Address whose responses may arrive without the `AF FA` marker
pub const HEADERLESS_ADDRESS: u8 = 0x4D;

/// Offset of the first data word in a response
const DATA_START: usize = 6;

/// Read slice while scanning for a response
const SCAN_SLICE: Duration = Duration::from_millis(20);

bitflags! {
    /// First group of requested quantities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DataKind1: u8 {
        const VOLTAGE = 1 << 0;
        const CURRENT = 1 << 1;
        const SOC = 1 << 2;
        const STATUS = 1 << 3;
        const CHARGE_TIME = 1 << 4;
        const DISCHARGE_TIME = 1 << 5;
        const TEMPERATURE = 1 << 6;
    }
}

bitflags! {
    /// Second group of requested quantities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DataKind2: u8 {
        const SOH = 1 << 0;
        const REMAIN_CAPACITY = 1 << 1;
        const REMAIN_ENERGY = 1 << 2;
    }
}

bitflags! {
    /// Alarm bits of the status word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BmuAlarms: u16 {
        const OVER_VOLTAGE = 1 << 0;
        const LOW_VOLTAGE = 1 << 1;
        const CHARGE_OVER_CURRENT = 1 << 2;
        const DISCHARGE_OVER_CURRENT = 1 << 3;
        const HIGH_TEMPERATURE = 1 << 4;
        const LOW_TEMPERATURE = 1 << 5;
        const BMU_ERROR = 1 << 6;
    }
}

const ALARM_LABELS: [(BmuAlarms, &str); 7] = [
    (BmuAlarms::OVER_VOLTAGE, "Battery Over Voltage"),
    (BmuAlarms::LOW_VOLTAGE, "Battery Low Voltage"),
    (BmuAlarms::CHARGE_OVER_CURRENT, "Charge Over Current"),
    (BmuAlarms::DISCHARGE_OVER_CURRENT, "Discharge Over Current"),
    (BmuAlarms::HIGH_TEMPERATURE, "High Temperature"),
    (BmuAlarms::LOW_TEMPERATURE, "Low Temperature"),
    (BmuAlarms::BMU_ERROR, "BMU Error"),
];

impl BmuAlarms {
    /// Operator-facing names of the active alarms
    pub fn labels(&self) -> Vec<&'static str> {
        ALARM_LABELS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, label)| *label)
            .collect()
    }
}

/// Status request for one BMU address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRequest {
    pub address: u8,
    pub kind1: DataKind1,
    pub kind2: DataKind2,
}

impl Default for StatusRequest {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS)
    }
}

impl StatusRequest {
    /// Request every quantity from `address`
    pub fn new(address: u8) -> Self {
        Self {
            address,
            kind1: DataKind1::all(),
            kind2: DataKind2::all(),
        }
    }

    pub fn with_kinds(mut self, kind1: DataKind1, kind2: DataKind2) -> Self {
        self.kind1 = kind1;
        self.kind2 = kind2;
        self
    }

    /// Encode the 11-byte request frame
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut frame = [
            FRAME_HEADER[0],
            FRAME_HEADER[1],
            self.address,
            0x05,
            CMD_READ_STATUS,
            self.address,
            self.kind1.bits(),
            self.kind2.bits(),
            0x00,
            FRAME_FOOTER[0],
            FRAME_FOOTER[1],
        ];
        frame[8] = sum8(&frame[2..8]);
        frame
    }
}

/// Byte-stream reassembler for response frames
///
/// Besides complete frames it accepts a response from address `0x4D` whose
/// `AF FA` marker was lost on the line: such a frame starts directly with the
/// address byte, is `len + 4` bytes long and is returned with the marker restored.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
    discarded: usize,
    dropped: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes; returns the first complete frame, if any
    ///
    /// Bytes after a returned frame stay buffered for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        self.next_frame()
    }

    /// Extract the next complete frame from already buffered bytes
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.first() == Some(&HEADERLESS_ADDRESS) {
                if self.buf.len() < 2 {
                    return None;
                }
                let expected = self.buf[1] as usize + 4;
                if self.buf.len() < expected {
                    // a marked frame behind a short candidate wins
                    if self.buf.windows(2).any(|w| w == &FRAME_HEADER[..]) {
                        self.drop_front(1);
                        continue;
                    }
                    return None;
                }
                if self.buf[expected - 2..expected] == FRAME_FOOTER {
                    let mut frame = FRAME_HEADER.to_vec();
                    frame.extend(self.buf.drain(..expected));
                    return Some(frame);
                }
                self.drop_front(1);
                continue;
            }

            match self.buf.windows(2).position(|w| w == &FRAME_HEADER[..]) {
                Some(0) => {}
                Some(pos) => {
                    // a headerless frame may sit in front of the next marker
                    let lead = self.buf[..pos].iter().position(|b| *b == HEADERLESS_ADDRESS);
                    match lead {
                        Some(lead) => self.drop_front(lead),
                        None => self.drop_front(pos),
                    }
                    continue;
                }
                None => {
                    if let Some(lead) = self.buf.iter().position(|b| *b == HEADERLESS_ADDRESS) {
                        self.drop_front(lead);
                        continue;
                    }
                    // a trailing AF may be the first half of the next marker
                    let keep = usize::from(self.buf.last() == Some(&FRAME_HEADER[0]));
                    self.drop_front(self.buf.len() - keep);
                    return None;
                }
            }

            if self.buf.len() < 4 {
                return None;
            }
            let expected = self.buf[3] as usize + 6;
            if self.buf.len() < expected {
                return None;
            }
            if self.buf[expected - 2..expected] == FRAME_FOOTER {
                return Some(self.buf.drain(..expected).collect());
            }
            self.drop_front(FRAME_HEADER.len());
        }
    }

    fn drop_front(&mut self, n: usize) {
        if n > 0 {
            self.dropped.extend(self.buf.drain(..n));
            self.discarded += n;
        }
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes thrown away while resynchronising
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Hand out the bytes dropped since the last call
    pub fn take_dropped(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.dropped)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.dropped.clear();
    }
}

/// Decoded status response
///
/// Fields are `None` when the response was too short to carry them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BmuReading {
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub soc_pct: Option<f64>,
    pub status: Option<u16>,
    pub charge_time: Option<u16>,
    pub discharge_time: Option<u16>,
    pub temperature_c: Option<f64>,
    pub soh_pct: Option<f64>,
    pub remain_capacity_ah: Option<f64>,
    pub remain_energy: Option<f64>,
}

impl BmuReading {
    pub fn alarms(&self) -> BmuAlarms {
        self.status.map(BmuAlarms::from_bits_truncate).unwrap_or_else(BmuAlarms::empty)
    }

    /// Positive current means the battery is charging
    pub fn is_charging(&self) -> bool {
        self.current_a.map_or(false, |a| a > 0.0)
    }

    /// Named quantities as reported by the device
    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        let fields = [
            ("Voltage", self.voltage_v),
            ("Current", self.current_a),
            ("SOC", self.soc_pct),
            ("Status", self.status.map(f64::from)),
            ("ChargeTime", self.charge_time.map(f64::from)),
            ("DischargeTime", self.discharge_time.map(f64::from)),
            ("Temp", self.temperature_c),
            ("SOH", self.soh_pct),
            ("RemainCapacity", self.remain_capacity_ah),
            ("RemainEnergy", self.remain_energy),
        ];
        fields
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect()
    }
}

/// Validate and decode a complete response frame
pub fn decode_response(frame: &[u8]) -> BusResult<BmuReading> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(BusError::frame(format!("BMU frame too short: {} bytes", frame.len())));
    }
    if frame[..2] != FRAME_HEADER {
        return Err(BusError::frame("invalid frame: header"));
    }
    if frame[frame.len() - 2..] != FRAME_FOOTER {
        return Err(BusError::frame("invalid frame: footer"));
    }
    if frame[4] != CMD_STATUS_RESPONSE {
        return Err(BusError::frame(format!("invalid frame: command 0x{:02X}", frame[4])));
    }

    let data_len = (frame[3] as usize).saturating_sub(3);
    let mut reading = BmuReading::default();
    let mut offset = 0;
    while offset + 1 < data_len {
        let idx = DATA_START + offset;
        if idx + 1 >= frame.len() {
            break;
        }
        let raw = u16::from_be_bytes([frame[idx], frame[idx + 1]]);
        match offset / 2 {
            0 => reading.voltage_v = Some(raw as f64 / 100.0),
            1 => reading.current_a = Some(raw as i16 as f64 / 100.0),
            2 => reading.soc_pct = Some(raw as f64),
            3 => reading.status = Some(raw),
            4 => reading.charge_time = Some(raw),
            5 => reading.discharge_time = Some(raw),
            6 => reading.temperature_c = Some(raw as i16 as f64 / 10.0),
            7 => reading.soh_pct = Some(raw as f64),
            8 => reading.remain_capacity_ah = Some(raw as f64 / 100.0),
            9 => reading.remain_energy = Some(raw as f64 / 10.0),
            _ => {}
        }
        offset += 2;
    }
    Ok(reading)
}

/// Build a response frame carrying `words`, as a BMU would send it
pub fn encode_response(address: u8, words: &[u16]) -> Vec<u8> {
    let len = (words.len() * 2 + 3) as u8;
    let mut frame = vec![FRAME_HEADER[0], FRAME_HEADER[1], address, len, CMD_STATUS_RESPONSE, address];
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    let sum = sum8(&frame[2..]);
    frame.push(sum);
    frame.extend_from_slice(&FRAME_FOOTER);
    frame
}

/// BMU client over a serial transport
///
/// Besides the transport's own reconnect logic, the client faults the link when no
/// valid frame arrived within the data timeout or after too many failed reads.
pub struct BmuClient<O: PortOpener = SystemPortOpener> {
    transport: SerialTransport<O>,
    settle_delay: Duration,
    guard: Mutex<StalenessGuard>,
}

impl BmuClient<SystemPortOpener> {
    pub fn new(config: &BmuConfig) -> Self {
        Self::with_opener(config, SystemPortOpener)
    }
}

impl<O: PortOpener> BmuClient<O> {
    pub fn with_opener(config: &BmuConfig, opener: O) -> Self {
        Self {
            transport: SerialTransport::with_opener(config.serial.clone(), BusKind::Bmu, opener),
            settle_delay: config.settle_delay(),
            guard: Mutex::new(StalenessGuard::new(
                config.data_timeout(),
                config.max_consecutive_failures,
            )),
        }
    }

    pub fn transport(&self) -> &SerialTransport<O> {
        &self.transport
    }

    /// Send a status request without waiting for the answer
    pub async fn request_status(&self, request: &StatusRequest) -> BusResult<()> {
        let mut session = self.transport.session().await?;
        self.write_request(&mut session, request).await
    }

    /// Wait for one response frame
    ///
    /// `Ok(None)` means nothing valid arrived within the read timeout.
    pub async fn read_response(&self) -> BusResult<Option<BmuReading>> {
        let mut session = self.transport.session().await?;
        self.receive(&mut session).await
    }

    /// Request and read under one lock of the link
    pub async fn poll(&self, request: &StatusRequest) -> BusResult<Option<BmuReading>> {
        let mut session = self.transport.session().await?;
        self.write_request(&mut session, request).await?;
        self.receive(&mut session).await
    }

    /// Drop the port and the staleness state, then reopen immediately
    pub async fn force_reconnect(&self) -> bool {
        self.guard.lock().unwrap_or_else(|e| e.into_inner()).reset();
        self.transport.force_reconnect().await
    }

    async fn write_request<L: SerialLink>(
        &self,
        session: &mut SerialSession<'_, L>,
        request: &StatusRequest,
    ) -> BusResult<()> {
        session.discard_buffers()?;
        session.write_all(&request.encode()).await?;
        tokio::time::sleep(self.settle_delay).await;
        Ok(())
    }

    async fn receive<L: SerialLink>(&self, session: &mut SerialSession<'_, L>) -> BusResult<Option<BmuReading>> {
        let outcome = match scan_frame(session, self.transport.config().read_timeout()).await {
            Ok(Some(frame)) => decode_response(&frame).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(Some(reading)) => {
                session.record_response();
                self.guard
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_data(Instant::now());
                debug!("[BMU] decoded {:?}", reading.to_map());
            }
            _ => {
                let lost = {
                    let mut guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
                    let too_many = guard.record_failure();
                    let expired = guard.check_expired(Instant::now());
                    too_many || expired
                };
                if lost {
                    warn!("[BMU] communication lost");
                    session.mark_faulted(BusError::connection("BMU communication lost"));
                }
            }
        }
        outcome
    }
}

async fn scan_frame<L: SerialLink>(
    session: &mut SerialSession<'_, L>,
    read_timeout: Duration,
) -> BusResult<Option<Vec<u8>>> {
    let deadline = Instant::now() + read_timeout;
    let mut scanner = FrameScanner::new();
    let mut chunk = [0u8; 64];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = (deadline - now).min(SCAN_SLICE);
        let n = session.read_available(&mut chunk, wait).await?;
        if n == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            continue;
        }
        let frame = scanner.push(&chunk[..n]);
        let dropped = scanner.take_dropped();
        if !dropped.is_empty() {
            session.logger().discarded(&dropped);
        }
        if let Some(frame) = frame {
            if scanner.discarded() > 0 {
                debug!("[BMU] resynchronised after {} bytes", scanner.discarded());
            }
            return Ok(Some(frame));
        }
    }

    if scanner.buffered() > 0 {
        debug!("[BMU] timeout with {} partial bytes", scanner.buffered());
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_words() -> Vec<u16> {
        vec![
            5230,               // 52.30 V
            (-1250i16) as u16,  // -12.50 A
            87,                 // SOC
            0x0011,             // over voltage + high temperature
            120,
            45,
            (-55i16) as u16,    // -5.5 C
            98,
            10050,              // 100.50 Ah
            4821,               // 482.1
        ]
    }

    #[test]
    fn test_request_encoding() {
        let frame = StatusRequest::default().encode();
        assert_eq!(
            frame,
            [0xAF, 0xFA, 0x60, 0x05, 0x01, 0x60, 0x7F, 0x07, 0x4C, 0xAF, 0xA0]
        );
        assert_eq!(frame[8], sum8(&frame[2..8]));
    }

    #[test]
    fn test_request_checksum_for_every_address() {
        for address in 0..=255u8 {
            let request = StatusRequest::new(address)
                .with_kinds(DataKind1::VOLTAGE | DataKind1::CURRENT, DataKind2::SOH);
            let frame = request.encode();
            assert_eq!(frame[8], sum8(&frame[2..8]));
            assert_eq!(frame[2], address);
            assert_eq!(frame[5], address);
        }
    }

    #[test]
    fn test_decode_full_response() {
        let frame = encode_response(0x60, &sample_words());
        assert_eq!(frame.len(), frame[3] as usize + 6);

        let reading = decode_response(&frame).expect("valid frame");
        assert_eq!(reading.voltage_v, Some(52.30));
        assert_eq!(reading.current_a, Some(-12.50));
        assert_eq!(reading.soc_pct, Some(87.0));
        assert_eq!(reading.temperature_c, Some(-5.5));
        assert_eq!(reading.remain_capacity_ah, Some(100.50));
        assert_eq!(reading.remain_energy, Some(482.1));
        assert!(!reading.is_charging());
        assert_eq!(
            reading.alarms(),
            BmuAlarms::OVER_VOLTAGE | BmuAlarms::HIGH_TEMPERATURE
        );
        assert_eq!(
            reading.alarms().labels(),
            vec!["Battery Over Voltage", "High Temperature"]
        );
        assert_eq!(reading.to_map().len(), 10);
    }

    #[test]
    fn test_decode_partial_payload() {
        let frame = encode_response(0x60, &[4800, 300]);
        let reading = decode_response(&frame).expect("valid frame");
        assert_eq!(reading.voltage_v, Some(48.0));
        assert_eq!(reading.current_a, Some(3.0));
        assert!(reading.is_charging());
        assert_eq!(reading.soc_pct, None);
        assert_eq!(reading.alarms(), BmuAlarms::empty());
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let good = encode_response(0x60, &sample_words());

        assert!(matches!(decode_response(&good[..8]), Err(BusError::Frame { .. })));

        let mut bad_header = good.clone();
        bad_header[1] = 0x00;
        assert!(matches!(decode_response(&bad_header), Err(BusError::Frame { .. })));

        let mut bad_footer = good.clone();
        let last = bad_footer.len() - 1;
        bad_footer[last] = 0xA1;
        assert!(matches!(decode_response(&bad_footer), Err(BusError::Frame { .. })));

        let mut bad_command = good;
        bad_command[4] = 0x02;
        assert!(matches!(decode_response(&bad_command), Err(BusError::Frame { .. })));
    }

    #[test]
    fn test_scanner_resyncs_after_corrupt_frame() {
        let valid = encode_response(0x60, &sample_words());
        let mut corrupt = valid.clone();
        let last = corrupt.len() - 1;
        corrupt[last] = 0x00;

        let mut stream = vec![0x13, 0x37];
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&valid);

        let mut scanner = FrameScanner::new();
        let mut frames = Vec::new();
        if let Some(frame) = scanner.push(&stream) {
            frames.push(frame);
        }
        while let Some(frame) = scanner.next_frame() {
            frames.push(frame);
        }
        assert_eq!(frames, vec![valid]);
        assert!(scanner.discarded() >= corrupt.len());
    }

    #[test]
    fn test_scanner_across_chunks() {
        let valid = encode_response(0x61, &[1, 2, 3]);
        let mut scanner = FrameScanner::new();
        let mut found = None;
        for byte in [0x00u8, 0xAF].iter().chain(valid.iter()) {
            if let Some(frame) = scanner.push(&[*byte]) {
                found = Some(frame);
            }
        }
        assert_eq!(found, Some(valid));
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_scanner_restores_headerless_frame() {
        let full = encode_response(HEADERLESS_ADDRESS, &sample_words());
        let mut scanner = FrameScanner::new();
        let mut found = None;
        for chunk in full[2..].chunks(5) {
            if let Some(frame) = scanner.push(chunk) {
                found = Some(frame);
            }
        }
        let frame = found.expect("headerless frame");
        assert_eq!(frame, full);
        assert_eq!(
            decode_response(&frame).expect("decodes"),
            decode_response(&full).expect("decodes")
        );
        assert_eq!(scanner.discarded(), 0);
    }

    #[test]
    fn test_scanner_skips_false_headerless_start() {
        let valid = encode_response(0x60, &[4800, 300]);
        // 4D with a length reaching past the buffered bytes
        let mut stream = vec![0x4D, 0x40, 0x01];
        stream.extend_from_slice(&valid);

        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(&stream), Some(valid));
        assert_eq!(scanner.take_dropped(), vec![0x4D, 0x40, 0x01]);
        assert!(scanner.take_dropped().is_empty());
    }

    #[test]
    fn test_scanner_waits_for_length() {
        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(&[0xAF, 0xFA, 0x60]), None);
        assert_eq!(scanner.buffered(), 3);
        assert_eq!(scanner.push(&[0xFF]), None);
        assert_eq!(scanner.buffered(), 4);
    }
}
