//! Ectocontrol device models layered over a slave's register bank.
//!
//! Every device publishes a four-register identity block at holding 0 and
//! then its own kind-specific registers. State lives in the device behind a
//! mutex; the bank is only ever locked after the device state, never before.

pub mod binary_sensor;
pub mod channels;
pub mod relay;
pub mod temperature;

use crate::bank::RegisterSpace;
use crate::error::{EctoError, Result};
use crate::feed::{StateChange, StateFeed, SubscriptionId};
use crate::slave::SlaveHandle;
use binary_sensor::BinarySensorState;
use channels::{ChannelWord, MAX_CHANNELS};
use parking_lot::{Mutex, RwLock};
use relay::RelayState;
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, Weak};
use temperature::TemperatureState;
use uom::si::f64::ThermodynamicTemperature;
use uom::si::thermodynamic_temperature::degree_celsius;

pub const UID_BASE: u32 = 0x80_0000;
/// Addresses below this are reserved on Ectocontrol buses.
pub const MIN_DEVICE_ADDRESS: u8 = 3;
pub const IDENTITY_REGISTER: u16 = 0x00;
pub const IDENTITY_LEN: u16 = 4;
const IDENTITY_MARKER: u16 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum DeviceKind {
    #[serde(rename = "binary_sensor_10ch")]
    BinarySensor,
    #[serde(rename = "relay_10ch")]
    Relay,
    #[serde(rename = "temperature_sensor")]
    Temperature,
}

/// Type tag and channel count reported in the identity block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub device_type: u8,
    pub channel_count: u8,
}

const PROFILES: [(DeviceKind, DeviceProfile); 3] = [
    (
        DeviceKind::BinarySensor,
        DeviceProfile {
            device_type: 0x59,
            channel_count: 10,
        },
    ),
    (
        DeviceKind::Relay,
        DeviceProfile {
            device_type: 0xC1,
            channel_count: 10,
        },
    ),
    (
        DeviceKind::Temperature,
        DeviceProfile {
            device_type: 0x22,
            channel_count: 1,
        },
    ),
];

impl DeviceKind {
    pub fn default_profile(self) -> DeviceProfile {
        PROFILES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, profile)| *profile)
            .unwrap_or(DeviceProfile {
                device_type: 0,
                channel_count: 1,
            })
    }

    pub const fn name(self) -> &'static str {
        match self {
            DeviceKind::BinarySensor => "binary_sensor_10ch",
            DeviceKind::Relay => "relay_10ch",
            DeviceKind::Temperature => "temperature_sensor",
        }
    }

    pub const fn has_channels(self) -> bool {
        matches!(self, DeviceKind::BinarySensor | DeviceKind::Relay)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity registers for a device at `address`.
pub fn identity_block(address: u8, profile: DeviceProfile) -> [u16; 4] {
    [
        IDENTITY_MARKER,
        u16::from(address.saturating_sub(MIN_DEVICE_ADDRESS)),
        u16::from(address),
        (u16::from(profile.device_type) << 8) | u16::from(profile.channel_count),
    ]
}

pub fn uid_for_address(address: u8) -> u32 {
    UID_BASE + u32::from(address.saturating_sub(MIN_DEVICE_ADDRESS))
}

/// Called with `(channel, new_state)` for every channel a master changed.
pub type ChannelCallback = Arc<dyn Fn(usize, bool) + Send + Sync>;

#[derive(Debug)]
enum DeviceState {
    BinarySensor(BinarySensorState),
    Relay(RelayState),
    Temperature(TemperatureState),
}

pub struct Device {
    kind: DeviceKind,
    profile: DeviceProfile,
    uid: u32,
    entity_id: Option<String>,
    slave: SlaveHandle,
    state: Mutex<DeviceState>,
    callback: RwLock<Option<ChannelCallback>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("address", &self.address())
            .field("uid", &format_args!("0x{:06X}", self.uid))
            .field("profile", &self.profile)
            .field("entity_id", &self.entity_id)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Lay out the device's registers in `slave`'s bank.
    pub fn new(slave: SlaveHandle, kind: DeviceKind, profile: DeviceProfile) -> Result<Self> {
        let address = slave.address();
        if address < MIN_DEVICE_ADDRESS {
            return Err(EctoError::InvalidAddress(address));
        }
        let channel_count = usize::from(profile.channel_count);
        if kind.has_channels() && !(1..=MAX_CHANNELS).contains(&channel_count) {
            return Err(EctoError::InvalidData);
        }

        slave.add_block(RegisterSpace::Holding, IDENTITY_REGISTER, IDENTITY_LEN)?;
        slave.set_values(
            RegisterSpace::Holding,
            IDENTITY_REGISTER,
            &identity_block(address, profile),
        )?;

        let state = match kind {
            DeviceKind::BinarySensor => {
                DeviceState::BinarySensor(BinarySensorState::new(&slave, channel_count)?)
            }
            DeviceKind::Relay => DeviceState::Relay(RelayState::new(&slave, channel_count)?),
            DeviceKind::Temperature => DeviceState::Temperature(TemperatureState::new(&slave)?),
        };

        tracing::debug!(
            slave = address,
            kind = %kind,
            device_type = profile.device_type,
            channels = profile.channel_count,
            "Created device"
        );

        Ok(Self {
            kind,
            profile,
            uid: uid_for_address(address),
            entity_id: None,
            slave,
            state: Mutex::new(state),
            callback: RwLock::new(None),
        })
    }

    /// Entity whose state a temperature sensor mirrors.
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn address(&self) -> u8 {
        self.slave.address()
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn slave(&self) -> &SlaveHandle {
        &self.slave
    }

    pub fn identity(&self) -> Result<Vec<u16>> {
        self.slave
            .read(RegisterSpace::Holding, IDENTITY_REGISTER, IDENTITY_LEN)
    }

    pub fn set_state_change_callback(
        &self,
        callback: impl Fn(usize, bool) + Send + Sync + 'static,
    ) {
        *self.callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_state_change_callback(&self) {
        *self.callback.write() = None;
    }

    /// Set one channel. Returns whether the bank was written; unknown
    /// channels and unchanged states are no-ops.
    pub fn set_switch_state(&self, channel: usize, on: bool) -> Result<bool> {
        match &mut *self.state.lock() {
            DeviceState::BinarySensor(state) => state.set_channel(&self.slave, channel, on),
            DeviceState::Relay(state) => state.set_channel(&self.slave, channel, on),
            DeviceState::Temperature(_) => Err(EctoError::UnsupportedOperation),
        }
    }

    /// Replace every contact state of a binary sensor from a raw word.
    pub fn set_channel_word(&self, word: u16) -> Result<()> {
        match &mut *self.state.lock() {
            DeviceState::BinarySensor(state) => {
                state.set_word(&self.slave, ChannelWord::from_bits_retain(word))
            }
            _ => Err(EctoError::UnsupportedOperation),
        }
    }

    pub fn set_timer(
        &self,
        channel: usize,
        initial_state: bool,
        timeout_seconds: f64,
    ) -> Result<bool> {
        match &mut *self.state.lock() {
            DeviceState::Relay(state) => {
                state.set_timer(&self.slave, channel, initial_state, timeout_seconds)
            }
            _ => Err(EctoError::UnsupportedOperation),
        }
    }

    pub fn get_channel_state(&self, channel: usize) -> Option<bool> {
        match &*self.state.lock() {
            DeviceState::BinarySensor(state) => state.channel(channel),
            DeviceState::Relay(state) => state.channel(channel),
            DeviceState::Temperature(_) => None,
        }
    }

    pub fn get_timer(&self, channel: usize) -> Option<u16> {
        match &*self.state.lock() {
            DeviceState::Relay(state) => state.timer(channel),
            _ => None,
        }
    }

    pub fn channel_states(&self) -> Vec<bool> {
        match &*self.state.lock() {
            DeviceState::BinarySensor(state) => state.channels().to_vec(),
            DeviceState::Relay(state) => state.channels().to_vec(),
            DeviceState::Temperature(_) => Vec::new(),
        }
    }

    pub fn timers(&self) -> Vec<u16> {
        match &*self.state.lock() {
            DeviceState::Relay(state) => state.timers().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Returns the raw register value written.
    pub fn set_temperature(&self, temperature: ThermodynamicTemperature) -> Result<i16> {
        match &mut *self.state.lock() {
            DeviceState::Temperature(state) => {
                state.set_celsius(&self.slave, temperature.get::<degree_celsius>())
            }
            _ => Err(EctoError::UnsupportedOperation),
        }
    }

    pub fn temperature(&self) -> Option<ThermodynamicTemperature> {
        match &*self.state.lock() {
            DeviceState::Temperature(state) => state
                .celsius()
                .map(ThermodynamicTemperature::new::<degree_celsius>),
            _ => None,
        }
    }

    /// Apply a state change from the feed. Unparsable values leave the
    /// register at its last good value.
    pub fn handle_state_change(&self, change: &StateChange) -> Result<i16> {
        let result = match &mut *self.state.lock() {
            DeviceState::Temperature(state) => {
                state.apply_state(&self.slave, change.new_state.as_deref())
            }
            _ => Err(EctoError::UnsupportedOperation),
        };
        if let Err(e) = &result {
            tracing::warn!(
                slave = self.address(),
                entity_id = %change.entity_id,
                "Rejected state change: {}",
                e
            );
        }
        result
    }

    /// Subscribe to this device's entity. Returns `None` if the device mirrors
    /// no entity.
    pub fn track_entity(self: &Arc<Self>, feed: &StateFeed) -> Option<SubscriptionId> {
        if self.kind != DeviceKind::Temperature {
            return None;
        }
        let entity_id = self.entity_id.as_deref()?;
        let device: Weak<Device> = Arc::downgrade(self);
        Some(feed.subscribe(entity_id, move |change| {
            if let Some(device) = device.upgrade() {
                let _ = device.handle_state_change(change);
            }
        }))
    }

    /// Sync device state after a master wrote `values` at `start`. Channel
    /// callbacks run once per changed channel, after the state lock is released.
    pub fn on_register_write(&self, start: u16, values: &[u16]) {
        let changed = self.sync_from_master(&mut self.state.lock(), start, values);
        self.notify(changed);
    }

    /// Write `values` into the holding bank on behalf of a master and sync
    /// device state. Both happen under the state lock.
    pub fn apply_master_write(&self, start: u16, values: &[u16]) -> Result<()> {
        let changed = {
            let mut state = self.state.lock();
            self.slave.write(RegisterSpace::Holding, start, values)?;
            self.sync_from_master(&mut state, start, values)
        };
        self.notify(changed);
        Ok(())
    }

    fn sync_from_master(
        &self,
        state: &mut DeviceState,
        start: u16,
        values: &[u16],
    ) -> Vec<(usize, bool)> {
        match state {
            DeviceState::Relay(relay) => relay.apply_write(start, values),
            _ => Vec::new(),
        }
    }

    fn notify(&self, changed: Vec<(usize, bool)>) {
        if changed.is_empty() {
            return;
        }
        tracing::debug!(slave = self.address(), ?changed, "Channels changed by master");

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            for (channel, on) in changed {
                callback(channel, on);
            }
        }
    }
}
