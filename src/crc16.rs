//! Modbus CRC-16 (poly 0xA001 reflected, init 0xFFFF).

use crate::error::{EctoError, Result};
use crc::{CRC_16_MODBUS, Crc};

pub const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC over `bytes`. On the wire it is sent low byte first.
#[must_use]
pub fn compute(bytes: &[u8]) -> u16 {
    MODBUS_CRC.checksum(bytes)
}

/// Check the trailing little-endian CRC and return the bytes it covers.
pub fn check(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < 2 {
        return Err(EctoError::InvalidData);
    }
    let (data, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected = compute(data);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected != actual {
        return Err(EctoError::CrcMismatch { expected, actual });
    }
    Ok(data)
}

/// True if the trailing two bytes of `frame` are the little-endian CRC of the rest.
#[must_use]
pub fn verify(frame: &[u8]) -> bool {
    check(frame).is_ok()
}

/// Append the CRC of `frame` in wire order.
pub fn append(frame: &mut Vec<u8>) {
    let crc = compute(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}
