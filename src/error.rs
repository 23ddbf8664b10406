use crate::bank::RegisterSpace;
use std::fmt;

#[derive(Debug)]
pub enum EctoError {
    InvalidData,
    Io(std::io::Error),
    CrcMismatch { expected: u16, actual: u16 },
    OversizedFrame(usize),
    UnknownSlave(u8),
    Exception {
        slave: u8,
        function: u8,
        code: ModbusExceptionCode,
    },
    DuplicateAddress(u8),
    InvalidAddress(u8),
    Overlap {
        space: RegisterSpace,
        start: u16,
        length: u16,
    },
    InvalidBlock { start: u16, length: u16 },
    IllegalAddress {
        space: RegisterSpace,
        start: u16,
        count: u16,
    },
    IllegalFunction(u8),
    IllegalDataValue,
    UnsupportedOperation,
    AlreadyRunning,
    NotRunning,
    InvalidTemperature(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl fmt::Display for EctoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EctoError::InvalidData => write!(f, "Invalid data"),
            EctoError::Io(e) => write!(f, "IO error: {}", e),
            EctoError::CrcMismatch { expected, actual } => write!(
                f,
                "CRC mismatch: expected 0x{:04X}, received 0x{:04X}",
                expected, actual
            ),
            EctoError::OversizedFrame(len) => write!(f, "Oversized frame ({} bytes)", len),
            EctoError::UnknownSlave(addr) => write!(f, "Unknown slave 0x{:02X}", addr),
            EctoError::Exception {
                slave,
                function,
                code,
            } => write!(
                f,
                "Slave 0x{:02X} answered function 0x{:02X} with exception: {}",
                slave, function, code
            ),
            EctoError::DuplicateAddress(addr) => {
                write!(f, "Slave address {} is already registered", addr)
            }
            EctoError::InvalidAddress(addr) => write!(f, "Invalid slave address {}", addr),
            EctoError::Overlap {
                space,
                start,
                length,
            } => write!(
                f,
                "{} block at 0x{:04X} ({} registers) overlaps an existing block",
                space, start, length
            ),
            EctoError::InvalidBlock { start, length } => write!(
                f,
                "Invalid register block at 0x{:04X} ({} registers)",
                start, length
            ),
            EctoError::IllegalAddress { space, start, count } => write!(
                f,
                "Illegal {} address range 0x{:04X}+{}",
                space, start, count
            ),
            EctoError::IllegalFunction(code) => write!(f, "Illegal function 0x{:02X}", code),
            EctoError::IllegalDataValue => write!(f, "Illegal data value"),
            EctoError::UnsupportedOperation => write!(f, "Unsupported operation"),
            EctoError::AlreadyRunning => write!(f, "Server is already running"),
            EctoError::NotRunning => write!(f, "Server is not running"),
            EctoError::InvalidTemperature(raw) => write!(f, "Invalid temperature value {:?}", raw),
        }
    }
}

impl fmt::Display for ModbusExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusExceptionCode::IllegalFunction => write!(f, "Illegal function (01h)"),
            ModbusExceptionCode::IllegalDataAddress => write!(f, "Illegal data address (02h)"),
            ModbusExceptionCode::IllegalDataValue => write!(f, "Illegal data value (03h)"),
            ModbusExceptionCode::SlaveDeviceFailure => write!(f, "Slave device failure (04h)"),
            ModbusExceptionCode::Acknowledge => write!(f, "Acknowledge (05h)"),
            ModbusExceptionCode::SlaveDeviceBusy => write!(f, "Slave device busy (06h)"),
            ModbusExceptionCode::MemoryParityError => write!(f, "Memory parity error (08h)"),
            ModbusExceptionCode::GatewayPathUnavailable => {
                write!(f, "Gateway path unavailable (0Ah)")
            }
            ModbusExceptionCode::GatewayTargetDeviceFailedToRespond => {
                write!(f, "Gateway target device failed to respond (0Bh)")
            }
        }
    }
}

impl EctoError {
    /// Exception code reported to the master when this error ends a request.
    pub const fn exception_code(&self) -> ModbusExceptionCode {
        match self {
            EctoError::IllegalAddress { .. } => ModbusExceptionCode::IllegalDataAddress,
            EctoError::IllegalFunction(_) => ModbusExceptionCode::IllegalFunction,
            EctoError::IllegalDataValue => ModbusExceptionCode::IllegalDataValue,
            EctoError::Exception { code, .. } => *code,
            _ => ModbusExceptionCode::SlaveDeviceFailure,
        }
    }
}

impl std::error::Error for EctoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EctoError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EctoError {
    fn from(err: std::io::Error) -> EctoError {
        EctoError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, EctoError>;
