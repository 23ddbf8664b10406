use crate::device::{DeviceKind, DeviceProfile, MIN_DEVICE_ADDRESS};
use crate::device::channels::MAX_CHANNELS;
use crate::serial::{DEFAULT_BAUD_RATE, LineSettings, Parity, StopBits};
use crate::server::ServerConfig;
use crate::slave::MAX_SLAVE_ADDRESS;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed reading config file")]
    Read(#[from] std::io::Error),

    #[error("Failed deserializing config from yaml")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Serial,
    #[default]
    Rs485,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub addr: u8,
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Overrides the kind's type tag.
    #[serde(default)]
    pub device_type: Option<u8>,
    /// Overrides the kind's channel count.
    #[serde(default)]
    pub channels: Option<u8>,
}

impl DeviceConfig {
    pub fn profile(&self) -> DeviceProfile {
        let default = self.kind.default_profile();
        DeviceProfile {
            device_type: self.device_type.unwrap_or(default.device_type),
            channel_count: self.channels.unwrap_or(default.channel_count),
        }
    }
}

/// One serial link and the devices emulated on it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub port: String,
    #[serde(default)]
    pub port_type: PortType,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stopbits: StopBits,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Raise for USB serial adapters, see `ServerConfig::interchar_multiplier`.
    #[serde(default = "default_multiplier")]
    pub interchar_multiplier: f64,
    #[serde(default = "default_multiplier")]
    pub interframe_multiplier: f64,
    #[serde(default)]
    pub error_on_missing_slave: bool,
    #[serde(default = "default_true")]
    pub broadcast_enable: bool,
    pub devices: Vec<DeviceConfig>,
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_bytesize() -> u8 {
    8
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.line()
            .validate()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "unsupported line settings: {} baud, {} data bits",
                    self.baudrate, self.bytesize
                ))
            })?;

        for (name, value) in [
            ("interchar_multiplier", self.interchar_multiplier),
            ("interframe_multiplier", self.interframe_multiplier),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")));
            }
        }

        let mut seen = BTreeSet::new();
        for device in &self.devices {
            if !(MIN_DEVICE_ADDRESS..=MAX_SLAVE_ADDRESS).contains(&device.addr) {
                return Err(ConfigError::Invalid(format!(
                    "device address {} outside {}..={}",
                    device.addr, MIN_DEVICE_ADDRESS, MAX_SLAVE_ADDRESS
                )));
            }
            if !seen.insert(device.addr) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device address {}",
                    device.addr
                )));
            }
            let channels = usize::from(device.profile().channel_count);
            if device.kind.has_channels() && !(1..=MAX_CHANNELS).contains(&channels) {
                return Err(ConfigError::Invalid(format!(
                    "device {} has {} channels, expected 1..={}",
                    device.addr, channels, MAX_CHANNELS
                )));
            }
            if device.entity_id.is_some() && device.kind != DeviceKind::Temperature {
                tracing::warn!(
                    "entity_id on {} device {} is ignored",
                    device.kind,
                    device.addr
                );
            }
        }
        Ok(())
    }

    pub fn line(&self) -> LineSettings {
        LineSettings {
            baud_rate: self.baudrate,
            data_bits: self.bytesize,
            parity: self.parity,
            stop_bits: self.stopbits,
        }
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            line: self.line(),
            interchar_multiplier: self.interchar_multiplier,
            interframe_multiplier: self.interframe_multiplier,
            error_on_missing_slave: self.error_on_missing_slave,
            broadcast_enable: self.broadcast_enable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
port: /dev/ttyACM0
baudrate: 9600
parity: E
stopbits: 1
devices:
  - type: relay_10ch
    addr: 5
  - type: binary_sensor_10ch
    addr: 4
    channels: 8
  - type: temperature_sensor
    addr: 6
    entity_id: sensor.boiler
"#;

    #[test]
    fn parses_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.port_type, PortType::Rs485);
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.devices[0].kind, DeviceKind::Relay);
        assert_eq!(config.devices[1].profile().channel_count, 8);
        assert_eq!(config.devices[1].profile().device_type, 0x59);
        assert_eq!(config.devices[2].entity_id.as_deref(), Some("sensor.boiler"));

        let server = config.server();
        assert_eq!(server.line.baud_rate, 9600);
        assert_eq!(server.line.parity, Parity::Even);
        assert_eq!(server.line.data_bits, 8);
        assert!(server.broadcast_enable);
        assert!(!server.error_on_missing_slave);
    }

    #[test]
    fn defaults_match_the_bus() {
        let config = Config::from_yaml("port: /dev/ttyUSB0\ndevices: []\n").unwrap();
        assert_eq!(config.line(), LineSettings::default());
        assert_eq!(config.interframe_multiplier, 1.0);
    }

    #[test]
    fn rejects_bad_addresses() {
        let low = "port: p\ndevices:\n  - {type: relay_10ch, addr: 2}\n";
        assert!(matches!(Config::from_yaml(low), Err(ConfigError::Invalid(_))));

        let dup = "port: p\ndevices:\n  - {type: relay_10ch, addr: 5}\n  \
                   - {type: temperature_sensor, addr: 5}\n";
        assert!(matches!(Config::from_yaml(dup), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_types_and_bad_values() {
        let unknown = "port: p\ndevices:\n  - {type: dimmer, addr: 5}\n";
        assert!(matches!(Config::from_yaml(unknown), Err(ConfigError::Yaml(_))));

        let stop = "port: p\nstopbits: 3\ndevices: []\n";
        assert!(matches!(Config::from_yaml(stop), Err(ConfigError::Yaml(_))));

        let mult = "port: p\ninterchar_multiplier: 0\ndevices: []\n";
        assert!(matches!(Config::from_yaml(mult), Err(ConfigError::Invalid(_))));

        let channels = "port: p\ndevices:\n  - {type: relay_10ch, addr: 5, channels: 20}\n";
        assert!(matches!(Config::from_yaml(channels), Err(ConfigError::Invalid(_))));
    }
}
