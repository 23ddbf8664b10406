use crate::bank::RegisterSpace;
use crate::crc16;
use crate::error::{EctoError, ModbusExceptionCode, Result};
use byteorder::{BigEndian, ByteOrder};

/// Address 0 addresses every slave on the bus; nobody answers.
pub const BROADCAST_ADDRESS: u8 = 0;
/// Address + function code + CRC.
pub const MIN_FRAME_LEN: usize = 4;
// "The maximum size of a MODBUS RTU frame is 256 bytes."
pub const MAX_FRAME_LEN: usize = 256;
pub const MAX_READ_QUANTITY: u16 = 125;
pub const MAX_WRITE_QUANTITY: u16 = 123;
pub const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<FunctionCode> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }
}

/// One RTU frame: slave address and PDU. The CRC is added on the way out and
/// checked on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub pdu: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub const fn new(address: u8, pdu: Vec<u8>) -> Self {
        Self { address, pdu }
    }

    #[must_use]
    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or_default()
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.address == BROADCAST_ADDRESS
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.pdu.len() + 2);
        frame.push(self.address);
        frame.extend(&self.pdu);
        crc16::append(&mut frame);
        frame
    }

    pub fn deserialize(frame: &[u8]) -> Result<Self> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(EctoError::OversizedFrame(frame.len()));
        }
        if frame.len() < MIN_FRAME_LEN {
            return Err(EctoError::InvalidData);
        }

        let data = crc16::check(frame)?;

        Ok(Frame {
            address: data[0],
            pdu: data[1..].to_vec(),
        })
    }
}

/// A decoded master request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { start: u16, count: u16 },
    ReadInputRegisters { start: u16, count: u16 },
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
}

impl Request {
    /// Decode a request PDU. Unknown function codes yield `IllegalFunction`,
    /// malformed payloads `IllegalDataValue`.
    pub fn parse(pdu: &[u8]) -> Result<Self> {
        let (&code, payload) = pdu.split_first().ok_or(EctoError::InvalidData)?;
        let function = FunctionCode::from_u8(code).ok_or(EctoError::IllegalFunction(code))?;

        match function {
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if payload.len() != 4 {
                    return Err(EctoError::IllegalDataValue);
                }
                let start = BigEndian::read_u16(&payload[0..2]);
                let count = BigEndian::read_u16(&payload[2..4]);
                if count == 0 || count > MAX_READ_QUANTITY {
                    return Err(EctoError::IllegalDataValue);
                }
                Ok(if function == FunctionCode::ReadHoldingRegisters {
                    Request::ReadHoldingRegisters { start, count }
                } else {
                    Request::ReadInputRegisters { start, count }
                })
            }
            FunctionCode::WriteMultipleRegisters => {
                if payload.len() < 5 {
                    return Err(EctoError::IllegalDataValue);
                }
                let start = BigEndian::read_u16(&payload[0..2]);
                let count = BigEndian::read_u16(&payload[2..4]);
                let byte_count = payload[4] as usize;
                if count == 0
                    || count > MAX_WRITE_QUANTITY
                    || byte_count != count as usize * 2
                    || payload.len() != 5 + byte_count
                {
                    return Err(EctoError::IllegalDataValue);
                }
                let values = payload[5..]
                    .chunks_exact(2)
                    .map(BigEndian::read_u16)
                    .collect();
                Ok(Request::WriteMultipleRegisters { start, values })
            }
        }
    }

    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Register space the request targets.
    #[must_use]
    pub const fn space(&self) -> RegisterSpace {
        match self {
            Request::ReadInputRegisters { .. } => RegisterSpace::Input,
            _ => RegisterSpace::Holding,
        }
    }

    /// Encode as a request PDU, as a master would send it.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut pdu = vec![self.function_code() as u8];
        match self {
            Request::ReadHoldingRegisters { start, count }
            | Request::ReadInputRegisters { start, count } => {
                pdu.extend_from_slice(&start.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Request::WriteMultipleRegisters { start, values } => {
                pdu.extend_from_slice(&start.to_be_bytes());
                pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        pdu
    }
}

/// A slave response, ready to be encoded into a PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadRegisters {
        function: FunctionCode,
        values: Vec<u16>,
    },
    WriteMultipleRegisters { start: u16, count: u16 },
    Exception {
        function: u8,
        code: ModbusExceptionCode,
    },
}

impl Response {
    #[must_use]
    pub fn exception(function: u8, code: ModbusExceptionCode) -> Self {
        Response::Exception { function, code }
    }

    #[must_use]
    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception { .. })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::ReadRegisters { function, values } => {
                let mut pdu = Vec::with_capacity(2 + values.len() * 2);
                pdu.push(*function as u8);
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
                pdu
            }
            Response::WriteMultipleRegisters { start, count } => {
                let mut pdu = Vec::with_capacity(5);
                pdu.push(FunctionCode::WriteMultipleRegisters as u8);
                pdu.extend_from_slice(&start.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
                pdu
            }
            Response::Exception { function, code } => {
                vec![function | EXCEPTION_FLAG, *code as u8]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_read_request_frame() {
        let buf = &[
            0x01, // slave address
            0x03, // function code
            0x00, 0x00, // start
            0x00, 0x01, // count
            0x84, 0x0A, // crc
        ];
        let frame = Frame::deserialize(buf).unwrap();
        assert_eq!(frame.address, 0x01);
        assert_eq!(frame.function_code(), 0x03);
        assert_eq!(
            Request::parse(&frame.pdu).unwrap(),
            Request::ReadHoldingRegisters { start: 0, count: 1 }
        );
    }

    #[test]
    fn deserialize_rejects_bad_crc_and_runts() {
        let buf = &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x0A, 0x84];
        assert!(matches!(
            Frame::deserialize(buf),
            Err(EctoError::CrcMismatch {
                expected: 0x0A84,
                actual: 0x840A
            })
        ));
        assert!(matches!(
            Frame::deserialize(&[0x01, 0x03, 0x00]),
            Err(EctoError::InvalidData)
        ));
        assert!(matches!(
            Frame::deserialize(&[0u8; MAX_FRAME_LEN + 1]),
            Err(EctoError::OversizedFrame(257))
        ));
    }

    #[test]
    fn serialize_appends_crc_low_byte_first() {
        let frame = Frame::new(0x01, vec![0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            frame.serialize(),
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[test]
    fn parse_write_multiple_request() {
        let pdu = &[
            0x10, // function code
            0x00, 0x10, // start
            0x00, 0x02, // count
            0x04, // byte count
            0x80, 0x00, // value 0
            0x00, 0x03, // value 1
        ];
        assert_eq!(
            Request::parse(pdu).unwrap(),
            Request::WriteMultipleRegisters {
                start: 0x10,
                values: vec![0x8000, 0x0003]
            }
        );
    }

    #[test]
    fn parse_rejects_unsupported_functions() {
        // write single register is not part of the device contract
        assert!(matches!(
            Request::parse(&[0x06, 0x00, 0x10, 0x00, 0x01]),
            Err(EctoError::IllegalFunction(0x06))
        ));
        assert!(matches!(
            Request::parse(&[0x01, 0x00, 0x00, 0x00, 0x08]),
            Err(EctoError::IllegalFunction(0x01))
        ));
    }

    #[test]
    fn parse_rejects_bad_quantities() {
        assert!(matches!(
            Request::parse(&[0x03, 0x00, 0x00, 0x00, 0x00]),
            Err(EctoError::IllegalDataValue)
        ));
        assert!(matches!(
            Request::parse(&[0x04, 0x00, 0x00, 0x00, 126]),
            Err(EctoError::IllegalDataValue)
        ));
        // byte count disagrees with quantity
        assert!(matches!(
            Request::parse(&[0x10, 0x00, 0x10, 0x00, 0x02, 0x02, 0x00, 0x01]),
            Err(EctoError::IllegalDataValue)
        ));
        // truncated values
        assert!(matches!(
            Request::parse(&[0x10, 0x00, 0x10, 0x00, 0x01, 0x02, 0x00]),
            Err(EctoError::IllegalDataValue)
        ));
    }

    #[test]
    fn request_encode_matches_parse() {
        let request = Request::WriteMultipleRegisters {
            start: 0x20,
            values: vec![0x8014, 0x0002],
        };
        let pdu = request.encode();
        assert_eq!(pdu, vec![0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0x80, 0x14, 0x00, 0x02]);
        assert_eq!(Request::parse(&pdu).unwrap(), request);
    }

    #[test]
    fn encode_responses() {
        let read = Response::ReadRegisters {
            function: FunctionCode::ReadInputRegisters,
            values: vec![0x8000],
        };
        assert_eq!(read.encode(), vec![0x04, 0x02, 0x80, 0x00]);

        let write = Response::WriteMultipleRegisters {
            start: 0x10,
            count: 1,
        };
        assert_eq!(write.encode(), vec![0x10, 0x00, 0x10, 0x00, 0x01]);

        let exception = Response::exception(0x03, ModbusExceptionCode::IllegalDataAddress);
        assert!(exception.is_exception());
        assert_eq!(exception.encode(), vec![0x83, 0x02]);
    }
}
