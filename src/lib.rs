pub mod assembler;
pub mod bank;
pub mod config;
pub mod crc16;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod pdu;
pub mod serial;
pub mod server;
pub mod slave;

pub use bank::{RegisterBank, RegisterSpace};
pub use config::{Config, ConfigError, DeviceConfig};
pub use device::{Device, DeviceKind, DeviceProfile};
pub use error::{EctoError, ModbusExceptionCode, Result};
pub use feed::{StateChange, StateFeed, SubscriptionId};
pub use pdu::{Frame, FunctionCode, Request, Response};
pub use serial::{FrameTiming, LineSettings, Parity, StopBits};
pub use server::{RtuServer, ServerConfig};
pub use slave::SlaveHandle;
