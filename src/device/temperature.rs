use crate::bank::RegisterSpace;
use crate::error::{EctoError, Result};
use crate::slave::SlaveHandle;

/// Input register with the temperature in tenths of a degree.
pub const VALUE_REGISTER: u16 = 0x20;
pub const SCALE_FACTOR: f64 = 10.0;

/// Scale degrees Celsius to the register's signed tenths.
pub fn encode_celsius(celsius: f64) -> Option<i16> {
    let scaled = (celsius * SCALE_FACTOR).round();
    if !scaled.is_finite() || scaled < f64::from(i16::MIN) || scaled > f64::from(i16::MAX) {
        return None;
    }
    Some(scaled as i16)
}

#[derive(Debug, Clone, Default)]
pub struct TemperatureState {
    // last value that made it into the register
    value: Option<i16>,
}

impl TemperatureState {
    pub fn new(slave: &SlaveHandle) -> Result<Self> {
        slave.add_block(RegisterSpace::Input, VALUE_REGISTER, 1)?;
        Ok(Self::default())
    }

    pub fn raw(&self) -> Option<i16> {
        self.value
    }

    pub fn celsius(&self) -> Option<f64> {
        self.value.map(|raw| f64::from(raw) / SCALE_FACTOR)
    }

    pub fn set_celsius(&mut self, slave: &SlaveHandle, celsius: f64) -> Result<i16> {
        let raw = encode_celsius(celsius)
            .ok_or_else(|| EctoError::InvalidTemperature(celsius.to_string()))?;
        slave.set_values(RegisterSpace::Input, VALUE_REGISTER, &[raw as u16])?;
        self.value = Some(raw);
        Ok(raw)
    }

    /// Apply a state string from the home-automation feed. `None` is a
    /// deleted or unknown state.
    pub fn apply_state(&mut self, slave: &SlaveHandle, state: Option<&str>) -> Result<i16> {
        let text = state.ok_or_else(|| EctoError::InvalidTemperature("none".to_string()))?;
        let celsius: f64 = text
            .trim()
            .parse()
            .map_err(|_| EctoError::InvalidTemperature(text.to_string()))?;
        self.set_celsius(slave, celsius)
    }
}
