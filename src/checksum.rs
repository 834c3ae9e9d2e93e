//! CRC16 (Modbus) and additive checksums
//!
//! Modbus RTU frames carry a CRC16 trailer (reflected polynomial 0xA001, seed
//! 0xFFFF) transmitted low byte first. The BMU frame protocol uses a plain 8-bit
//! sum over part of the request instead.

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{BusError, BusResult};

/// CRC calculator for RTU frames
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus CRC16 over `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC16 trailer (lo, hi) to a frame
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the CRC16 trailer of a complete frame
///
/// Returns the frame body without the trailer on success.
pub fn validate_crc(frame: &[u8]) -> BusResult<&[u8]> {
    if frame.len() < 3 {
        return Err(BusError::frame(format!(
            "Frame too short for CRC: {} bytes",
            frame.len()
        )));
    }
    let body_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let computed = crc16(&frame[..body_len]);
    if received != computed {
        return Err(BusError::crc_mismatch(computed, received));
    }
    Ok(&frame[..body_len])
}

/// 8-bit additive checksum over `data`, wrapping on overflow
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}
