//! Serial/RS-485 line settings and RTU timing.
//!
//! Modbus RTU has no length field, so frame boundaries are found by silence on
//! the line. The silence thresholds depend on how long one character takes at
//! the configured baud rate and framing, which is computed here.

use crate::error::{EctoError, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Default baud rate of Ectocontrol buses.
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// Above this rate the serial line guide fixes t1.5/t3.5 instead of scaling them.
const FIXED_TIMING_BAUD_RATE: u32 = 19200;
const FIXED_INTER_CHAR: Duration = Duration::from_micros(750);
const FIXED_INTER_FRAME: Duration = Duration::from_micros(1750);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    #[serde(alias = "N")]
    None,
    #[serde(alias = "E")]
    Even,
    #[serde(alias = "O")]
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported stop bits: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl LineSettings {
    /// Bits on the wire per character: start + data + parity + stop.
    pub fn bits_per_char(&self) -> u32 {
        let parity = match self.parity {
            Parity::None => 0,
            Parity::Even | Parity::Odd => 1,
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        1 + u32::from(self.data_bits) + parity + stop
    }

    pub fn char_time(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.bits_per_char()) / f64::from(self.baud_rate.max(1)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 || !(5..=8).contains(&self.data_bits) {
            return Err(EctoError::InvalidData);
        }
        Ok(())
    }
}

/// Silence thresholds used by the frame assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// A gap longer than this inside a frame corrupts it (t1.5).
    pub inter_char: Duration,
    /// A gap at least this long ends a frame (t3.5).
    pub inter_frame: Duration,
}

impl FrameTiming {
    pub fn new(inter_char: Duration, inter_frame: Duration) -> Self {
        Self {
            inter_char,
            inter_frame: inter_frame.max(inter_char),
        }
    }

    /// Timing for `line`, scaled by the configured multipliers.
    pub fn for_line(
        line: &LineSettings,
        interchar_multiplier: f64,
        interframe_multiplier: f64,
    ) -> Self {
        let (inter_char, inter_frame) = if line.baud_rate > FIXED_TIMING_BAUD_RATE {
            (FIXED_INTER_CHAR, FIXED_INTER_FRAME)
        } else {
            let char_time = line.char_time();
            (char_time.mul_f64(1.5), char_time.mul_f64(3.5))
        };
        Self::new(
            inter_char.mul_f64(interchar_multiplier.max(0.0)),
            inter_frame.mul_f64(interframe_multiplier.max(0.0)),
        )
    }
}

/// Open a serial port for slave operation.
///
/// # Example
///
/// ```ignore
/// use ecto_modbus::serial::{open_port, LineSettings};
///
/// let port = open_port("/dev/ttyACM0", &LineSettings::default())?;
/// server.start(port)?;
/// ```
pub fn open_port(path: &str, line: &LineSettings) -> Result<SerialStream> {
    line.validate()?;

    let data_bits = match line.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match line.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };
    let stop_bits = match line.stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    };

    tracing::debug!(path, baud = line.baud_rate, "Opening serial port");
    tokio_serial::new(path, line.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|e| EctoError::Io(std::io::Error::other(e.to_string())))
}
