//! # Modbus RTU Engine
//!
//! Read Holding Registers (0x03) and Write Multiple Registers (0x10) over a
//! [`SerialTransport`]. Frames are `[slave][function][data...][crc lo][crc hi]`.
//!
//! A transaction reads the first two bytes of the response before anything else so
//! an exception reply (`function | 0x80`, five bytes long) is recognised without
//! waiting out the read timeout for bytes that never come. CRC and echo mismatches
//! fault the link; the next call reopens the port.
//!
//! The remote-control handset sits behind this engine: [`RemoteState::decode`] turns
//! its four holding registers into named switches, joystick axes and an action.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::checksum::{append_crc, validate_crc};
use crate::config::SerialConfig;
use crate::error::{BusError, BusResult};
use crate::logging::BusKind;
use crate::serial::{PortOpener, SerialLink, SerialSession, SerialTransport, SystemPortOpener};
use crate::utils::format::registers_to_hex;
use crate::utils::validation::{validate_register_range, validate_slave_id};

/// Maximum registers per read request (0x03)
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum registers per write request (0x10)
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Exception response length: slave, function | 0x80, code, CRC
const EXCEPTION_LEN: usize = 5;

/// Write Multiple Registers response length: slave, function, start, quantity, CRC
const WRITE_RESPONSE_LEN: usize = 8;

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> BusResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(BusError::protocol(format!("Unsupported function code 0x{:02X}", value))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Function byte of the matching exception response
    pub fn exception_code(self) -> u8 {
        self.to_u8() | 0x80
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusFunction::ReadHoldingRegisters => write!(f, "Read Holding Registers (0x03)"),
            ModbusFunction::WriteMultipleRegisters => write!(f, "Write Multiple Registers (0x10)"),
        }
    }
}

/// Build a 0x03 request frame including CRC
pub fn build_read_request(slave: u8, start: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(ModbusFunction::ReadHoldingRegisters.to_u8());
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build a 0x10 request frame including CRC
pub fn build_write_request(slave: u8, start: u16, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + values.len() * 2);
    frame.push(slave);
    frame.push(ModbusFunction::WriteMultipleRegisters.to_u8());
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Expected length of a successful 0x03 response
pub fn read_response_len(quantity: u16) -> usize {
    3 + quantity as usize * 2 + 2
}

/// Validate a complete 0x03 response and unpack its big-endian words
pub fn parse_read_response(slave: u8, quantity: u16, frame: &[u8]) -> BusResult<Vec<u16>> {
    let body = validate_crc(frame)?;
    check_header(slave, ModbusFunction::ReadHoldingRegisters, body)?;

    let byte_count = quantity as usize * 2;
    if body.len() < 3 || body[2] as usize != byte_count {
        return Err(BusError::protocol(format!(
            "Unexpected byte count: expected {}, got {}",
            byte_count,
            body.get(2).copied().unwrap_or(0)
        )));
    }
    if body.len() != 3 + byte_count {
        return Err(BusError::frame(format!(
            "Register data length {} does not match byte count {}",
            body.len() - 3,
            byte_count
        )));
    }

    Ok(body[3..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Validate a complete 0x10 response against the request's start and quantity
pub fn parse_write_response(slave: u8, start: u16, quantity: u16, frame: &[u8]) -> BusResult<()> {
    let body = validate_crc(frame)?;
    check_header(slave, ModbusFunction::WriteMultipleRegisters, body)?;
    if body.len() != WRITE_RESPONSE_LEN - 2 {
        return Err(BusError::frame(format!("Write response body is {} bytes", body.len())));
    }

    let echoed_start = u16::from_be_bytes([body[2], body[3]]);
    let echoed_quantity = u16::from_be_bytes([body[4], body[5]]);
    if echoed_start != start {
        return Err(BusError::protocol(format!(
            "Write echo start mismatch: expected {}, got {}",
            start, echoed_start
        )));
    }
    if echoed_quantity != quantity {
        return Err(BusError::protocol(format!(
            "Write echo quantity mismatch: expected {}, got {}",
            quantity, echoed_quantity
        )));
    }
    Ok(())
}

fn check_header(slave: u8, function: ModbusFunction, body: &[u8]) -> BusResult<()> {
    if body.len() < 2 {
        return Err(BusError::frame("Response too short"));
    }
    if body[0] != slave {
        return Err(BusError::protocol(format!(
            "Slave mismatch: expected {}, got {}",
            slave, body[0]
        )));
    }
    if body[1] != function.to_u8() {
        return Err(BusError::protocol(format!(
            "Function mismatch: expected 0x{:02X}, got 0x{:02X}",
            function.to_u8(),
            body[1]
        )));
    }
    Ok(())
}

/// Contiguous run of holding registers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterBlock {
    pub start: u16,
    pub values: Vec<u16>,
}

impl RegisterBlock {
    pub fn new(start: u16, values: Vec<u16>) -> Self {
        Self { start, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Registers flattened to bytes, high byte first
    pub fn bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    /// Byte `index` of the flattened block, 0 when out of range
    pub fn byte(&self, index: usize) -> u8 {
        self.values
            .get(index / 2)
            .map(|v| v.to_be_bytes()[index % 2])
            .unwrap_or(0)
    }
}

/// Modbus RTU master on one serial link
pub struct ModbusRtuClient<O: PortOpener = SystemPortOpener> {
    transport: SerialTransport<O>,
}

impl ModbusRtuClient<SystemPortOpener> {
    pub fn new(config: SerialConfig) -> Self {
        Self::with_opener(config, SystemPortOpener)
    }
}

impl<O: PortOpener> ModbusRtuClient<O> {
    pub fn with_opener(config: SerialConfig, opener: O) -> Self {
        Self {
            transport: SerialTransport::with_opener(config, BusKind::Modbus, opener),
        }
    }

    pub fn transport(&self) -> &SerialTransport<O> {
        &self.transport
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    pub async fn force_reconnect(&self) -> bool {
        self.transport.force_reconnect().await
    }

    /// Read `quantity` holding registers starting at `start` (function 0x03)
    ///
    /// Quantities outside 1..=125 fail with a configuration error before any I/O.
    pub async fn read_holding_registers(&self, slave: u8, start: u16, quantity: u16) -> BusResult<Vec<u16>> {
        validate_slave_id(slave)?;
        validate_register_range(start, quantity, MAX_READ_REGISTERS)?;

        let request = build_read_request(slave, start, quantity);
        let mut session = self.transport.session().await?;
        let response = transaction(
            &mut session,
            &request,
            ModbusFunction::ReadHoldingRegisters,
            read_response_len(quantity),
        )
        .await?;

        match parse_read_response(slave, quantity, &response) {
            Ok(registers) => {
                session.record_response();
                debug!(
                    "[MODBUS] slave {} read {}+{}: {}",
                    slave,
                    start,
                    quantity,
                    registers_to_hex(&registers)
                );
                Ok(registers)
            }
            Err(e) => Err(session.mark_faulted(e)),
        }
    }

    /// Read holding registers as a [`RegisterBlock`]
    pub async fn read_block(&self, slave: u8, start: u16, quantity: u16) -> BusResult<RegisterBlock> {
        let values = self.read_holding_registers(slave, start, quantity).await?;
        Ok(RegisterBlock::new(start, values))
    }

    /// Write `values` to consecutive registers starting at `start` (function 0x10)
    ///
    /// Between 1 and 123 values are accepted; anything else is a configuration error.
    pub async fn write_multiple_registers(&self, slave: u8, start: u16, values: &[u16]) -> BusResult<()> {
        validate_slave_id(slave)?;
        if values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(BusError::configuration(format!(
                "Invalid register count: {} (must be 1-{})",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }
        let quantity = values.len() as u16;
        validate_register_range(start, quantity, MAX_WRITE_REGISTERS)?;

        let request = build_write_request(slave, start, values);
        let mut session = self.transport.session().await?;
        let response = transaction(
            &mut session,
            &request,
            ModbusFunction::WriteMultipleRegisters,
            WRITE_RESPONSE_LEN,
        )
        .await?;

        match parse_write_response(slave, start, quantity, &response) {
            Ok(()) => {
                session.record_response();
                debug!("[MODBUS] slave {} wrote {}+{} ok", slave, start, quantity);
                Ok(())
            }
            Err(e) => Err(session.mark_faulted(e)),
        }
    }
}

/// Send `request` and read one complete response frame
///
/// Exception replies are returned as [`BusError::Exception`] without faulting the
/// link: the slave answered, it just refused.
async fn transaction<L: SerialLink>(
    session: &mut SerialSession<'_, L>,
    request: &[u8],
    function: ModbusFunction,
    expected_len: usize,
) -> BusResult<Vec<u8>> {
    session.discard_buffers()?;
    session.write_all(request).await?;

    let mut response = session.read_exact_len(2).await?;
    if response[1] == function.exception_code() {
        let mut rest = [0u8; EXCEPTION_LEN - 2];
        session.read_into(&mut rest).await?;
        response.extend_from_slice(&rest);
        if let Err(e) = validate_crc(&response) {
            return Err(session.mark_faulted(e));
        }
        let err = BusError::exception(function.to_u8(), response[2]);
        warn!("[MODBUS] slave {} {}", response[0], err);
        session.record_response();
        return Err(err);
    }

    let mut rest = vec![0u8; expected_len - 2];
    session.read_into(&mut rest).await?;
    response.extend_from_slice(&rest);
    Ok(response)
}

/// Operating mode selected on the handset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemoteMode {
    Default,
    Maintenance,
    Override,
    Unknown(u8),
}

impl RemoteMode {
    pub fn from_nibble(value: u8) -> Self {
        match value & 0x0F {
            0 => RemoteMode::Default,
            1 => RemoteMode::Maintenance,
            2 => RemoteMode::Override,
            other => RemoteMode::Unknown(other),
        }
    }
}

impl fmt::Display for RemoteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteMode::Default => f.write_str("Default"),
            RemoteMode::Maintenance => f.write_str("Maintenance"),
            RemoteMode::Override => f.write_str("Override"),
            RemoteMode::Unknown(v) => write!(f, "Unknown({})", v),
        }
    }
}

/// What the handset is asking for, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemoteAction {
    RemoteNotReady,
    EStop,
    Disabled,
    Forward,
    Backward,
    Right,
    Left,
    LiftUp,
    LiftDown,
    RotateLeft,
    RotateRight,
    Idle,
}

impl RemoteAction {
    pub fn label(&self) -> &'static str {
        match self {
            RemoteAction::RemoteNotReady => "Remote Not Ready",
            RemoteAction::EStop => "E-STOP",
            RemoteAction::Disabled => "Disabled",
            RemoteAction::Forward => "Forward",
            RemoteAction::Backward => "Backward",
            RemoteAction::Right => "Right",
            RemoteAction::Left => "Left",
            RemoteAction::LiftUp => "Lift Up",
            RemoteAction::LiftDown => "Lift Down",
            RemoteAction::RotateLeft => "Rotate Left",
            RemoteAction::RotateRight => "Rotate Right",
            RemoteAction::Idle => "Idle",
        }
    }
}

impl fmt::Display for RemoteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Joystick deflection below this is treated as centred
const JOYSTICK_DEADBAND: f64 = 0.05;

/// Handset state decoded from four holding registers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteState {
    pub heartbeat: u8,
    pub lost_link: bool,
    pub remote_ready: bool,
    pub estop: bool,
    pub enable: bool,
    pub mode_select: bool,
    pub lift_up: bool,
    pub lift_down: bool,
    pub rotate_left: bool,
    pub rotate_right: bool,
    pub mode: RemoteMode,
    /// Speed limit, 0.0..=1.0
    pub speed: f64,
    /// Forward/backward axis, -1.0..=1.0
    pub linear: f64,
    /// Left/right axis, -1.0..=1.0
    pub angular: f64,
    pub action: RemoteAction,
}

impl RemoteState {
    /// Registers the handset exposes
    pub const REGISTER_COUNT: usize = 4;

    pub fn decode(block: &RegisterBlock) -> BusResult<Self> {
        if block.len() < Self::REGISTER_COUNT {
            return Err(BusError::configuration(format!(
                "Remote state needs {} registers, got {}",
                Self::REGISTER_COUNT,
                block.len()
            )));
        }

        let d0 = block.byte(0);
        let d1 = block.byte(1);
        let d2 = block.byte(2);
        let d3 = block.byte(3);
        let d6 = block.byte(6);
        let d7 = block.byte(7);

        let lost_link = d0 & 0x04 != 0;
        let remote_ready = !lost_link;
        let estop = d0 & 0x01 != 0;
        let enable = d1 & 0x80 != 0;

        let (linear, angular) = if remote_ready && enable && !estop {
            (axis(d6), axis(d7))
        } else {
            (0.0, 0.0)
        };

        let mut state = Self {
            heartbeat: (d0 >> 4) & 0x0F,
            lost_link,
            remote_ready,
            estop,
            enable,
            mode_select: d1 & 0x40 != 0,
            lift_up: d1 & 0x01 != 0,
            lift_down: d1 & 0x02 != 0,
            rotate_left: d1 & 0x04 != 0,
            rotate_right: d1 & 0x08 != 0,
            mode: RemoteMode::from_nibble(d2),
            speed: d3.min(100) as f64 / 100.0,
            linear,
            angular,
            action: RemoteAction::Idle,
        };
        state.action = state.derive_action();
        Ok(state)
    }

    fn derive_action(&self) -> RemoteAction {
        if !self.remote_ready {
            RemoteAction::RemoteNotReady
        } else if self.estop {
            RemoteAction::EStop
        } else if !self.enable {
            RemoteAction::Disabled
        } else if self.linear.abs() > JOYSTICK_DEADBAND {
            if self.linear > 0.0 {
                RemoteAction::Forward
            } else {
                RemoteAction::Backward
            }
        } else if self.angular.abs() > JOYSTICK_DEADBAND {
            if self.angular > 0.0 {
                RemoteAction::Right
            } else {
                RemoteAction::Left
            }
        } else if self.lift_up {
            RemoteAction::LiftUp
        } else if self.lift_down {
            RemoteAction::LiftDown
        } else if self.rotate_left {
            RemoteAction::RotateLeft
        } else if self.rotate_right {
            RemoteAction::RotateRight
        } else {
            RemoteAction::Idle
        }
    }
}

/// Joystick byte centred on 127, scaled to -1.0..=1.0
fn axis(raw: u8) -> f64 {
    ((raw as f64 - 127.0) / 127.0).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::crc16;
    use crate::serial::MemoryPortOpener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_client() -> ModbusRtuClient<MemoryPortOpener> {
        let config = SerialConfig::modbus_default()
            .with_port("sim-modbus")
            .with_timeouts(200, 200);
        ModbusRtuClient::with_opener(config, MemoryPortOpener::new())
    }

    fn response(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_read_request_layout() {
        let frame = build_read_request(0x01, 0x0000, 0x0002);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn test_write_request_layout() {
        let frame = build_write_request(0x11, 0x0001, &[0x000A, 0x0102]);
        assert_eq!(&frame[..11], &[0x11, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert_eq!(crc16(&frame[..11]).to_le_bytes(), [frame[11], frame[12]]);
    }

    #[test]
    fn test_parse_read_response() {
        let frame = response(&[0x01, 0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD]);
        assert_eq!(parse_read_response(1, 2, &frame).unwrap(), vec![0x1234, 0xABCD]);

        let err = parse_read_response(2, 2, &frame).unwrap_err();
        assert!(matches!(err, BusError::Protocol { .. }));

        let short_count = response(&[0x01, 0x03, 0x02, 0x12, 0x34, 0xAB, 0xCD]);
        assert!(matches!(
            parse_read_response(1, 2, &short_count),
            Err(BusError::Protocol { .. })
        ));

        let mut corrupted = frame.clone();
        corrupted[3] ^= 0xFF;
        assert!(matches!(
            parse_read_response(1, 2, &corrupted),
            Err(BusError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_write_response() {
        let frame = response(&[0x01, 0x10, 0x00, 0x05, 0x00, 0x03]);
        assert!(parse_write_response(1, 5, 3, &frame).is_ok());
        assert!(matches!(
            parse_write_response(1, 6, 3, &frame),
            Err(BusError::Protocol { .. })
        ));
        assert!(matches!(
            parse_write_response(1, 5, 2, &frame),
            Err(BusError::Protocol { .. })
        ));
    }

    #[test]
    fn test_register_block_bytes() {
        let block = RegisterBlock::new(1, vec![0x1234, 0x5678]);
        assert_eq!(block.bytes(), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(block.byte(1), 0x34);
        assert_eq!(block.byte(2), 0x56);
        assert_eq!(block.byte(9), 0);
    }

    #[tokio::test]
    async fn test_quantity_out_of_range_does_no_io() {
        let client = test_client();
        let err = client.read_holding_registers(1, 0, 0).await.unwrap_err();
        assert!(matches!(err, BusError::Configuration { .. }));
        let err = client.read_holding_registers(1, 0, 126).await.unwrap_err();
        assert!(matches!(err, BusError::Configuration { .. }));
        let err = client.write_multiple_registers(1, 0, &[0u16; 124]).await.unwrap_err();
        assert!(matches!(err, BusError::Configuration { .. }));
        let err = client.write_multiple_registers(1, 0, &[]).await.unwrap_err();
        assert!(matches!(err, BusError::Configuration { .. }));
        assert_eq!(client.transport().opener().attempts(), 0);
    }

    #[tokio::test]
    async fn test_read_holding_registers() {
        let client = test_client();
        let mut device = client.transport().opener().attach(256);

        let slave = tokio::spawn(async move {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).await.expect("request");
            let reply = response(&[0x01, 0x03, 0x04, 0x00, 0x2A, 0x01, 0x00]);
            device.write_all(&reply).await.expect("reply");
            request
        });

        let registers = client.read_holding_registers(1, 1, 2).await.expect("read");
        assert_eq!(registers, vec![42, 256]);
        assert_eq!(slave.await.expect("join").to_vec(), build_read_request(1, 1, 2));
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_exception_response() {
        let client = test_client();
        let mut device = client.transport().opener().attach(256);

        tokio::spawn(async move {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).await.expect("request");
            device.write_all(&response(&[0x01, 0x83, 0x02])).await.expect("reply");
            // keep the stream open until the client is done
            let mut sink = [0u8; 1];
            let _ = device.read(&mut sink).await;
        });

        let err = client.read_holding_registers(1, 0x100, 4).await.unwrap_err();
        assert_eq!(
            err,
            BusError::Exception {
                function: 0x03,
                code: 0x02,
                message: "Illegal Data Address".to_string()
            }
        );
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_echo_mismatch_faults_link() {
        let client = test_client();
        let mut device = client.transport().opener().attach(256);

        tokio::spawn(async move {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).await.expect("request");
            device
                .write_all(&response(&[0x02, 0x03, 0x02, 0x00, 0x01]))
                .await
                .expect("reply");
            let mut sink = [0u8; 1];
            let _ = device.read(&mut sink).await;
        });

        let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, BusError::Protocol { .. }));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_write_multiple_registers() {
        let client = test_client();
        let mut device = client.transport().opener().attach(256);

        let slave = tokio::spawn(async move {
            let mut request = [0u8; 13];
            device.read_exact(&mut request).await.expect("request");
            device
                .write_all(&response(&[0x01, 0x10, 0x00, 0x10, 0x00, 0x02]))
                .await
                .expect("reply");
            request
        });

        client
            .write_multiple_registers(1, 0x10, &[7, 8])
            .await
            .expect("write");
        let request = slave.await.expect("join");
        assert_eq!(&request[7..11], &[0x00, 0x07, 0x00, 0x08]);
    }

    fn remote_block(d: [u8; 8]) -> RegisterBlock {
        RegisterBlock::new(
            1,
            d.chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        )
    }

    #[test]
    fn test_remote_state_forward() {
        let state = RemoteState::decode(&remote_block([0x30, 0x80, 0x01, 150, 0, 0, 254, 127])).unwrap();
        assert_eq!(state.heartbeat, 3);
        assert!(state.remote_ready);
        assert!(!state.estop);
        assert!(state.enable);
        assert_eq!(state.mode, RemoteMode::Maintenance);
        assert_eq!(state.speed, 1.0);
        assert!((state.linear - 1.0).abs() < 1e-9);
        assert_eq!(state.angular, 0.0);
        assert_eq!(state.action, RemoteAction::Forward);
    }

    #[test]
    fn test_remote_state_priorities() {
        let lost = RemoteState::decode(&remote_block([0x04, 0x80, 0, 50, 0, 0, 254, 0])).unwrap();
        assert_eq!(lost.action, RemoteAction::RemoteNotReady);
        assert_eq!(lost.linear, 0.0);

        let estop = RemoteState::decode(&remote_block([0x01, 0x80, 0, 50, 0, 0, 254, 0])).unwrap();
        assert_eq!(estop.action.label(), "E-STOP");
        assert_eq!(estop.linear, 0.0);

        let disabled = RemoteState::decode(&remote_block([0x00, 0x01, 0, 50, 0, 0, 127, 127])).unwrap();
        assert_eq!(disabled.action, RemoteAction::Disabled);

        let left = RemoteState::decode(&remote_block([0x00, 0x80, 0, 50, 0, 0, 127, 0])).unwrap();
        assert_eq!(left.action, RemoteAction::Left);
        assert_eq!(left.speed, 0.5);

        let lift = RemoteState::decode(&remote_block([0x00, 0x82, 0, 0, 0, 0, 127, 127])).unwrap();
        assert_eq!(lift.action, RemoteAction::LiftDown);

        let idle = RemoteState::decode(&remote_block([0x00, 0x80, 0, 0, 0, 0, 127, 127])).unwrap();
        assert_eq!(idle.action, RemoteAction::Idle);
    }

    #[test]
    fn test_remote_state_needs_four_registers() {
        let err = RemoteState::decode(&RegisterBlock::new(1, vec![0, 0, 0])).unwrap_err();
        assert!(matches!(err, BusError::Configuration { .. }));
    }
}
