use crate::bank::{RegisterBank, RegisterSpace};
use crate::device::Device;
use crate::error::{EctoError, Result};
use crate::pdu::BROADCAST_ADDRESS;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Highest unicast address allowed by Modbus.
pub const MAX_SLAVE_ADDRESS: u8 = 247;

/// A registered slave. Clones share the same register bank; every access goes
/// through the bank's own lock, so slaves never contend with each other.
#[derive(Clone)]
pub struct SlaveHandle {
    address: u8,
    bank: Arc<Mutex<RegisterBank>>,
}

impl std::fmt::Debug for SlaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveHandle")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl SlaveHandle {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            bank: Arc::new(Mutex::new(RegisterBank::new())),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn add_block(&self, space: RegisterSpace, start: u16, length: u16) -> Result<()> {
        self.bank.lock().add_block(space, start, length)
    }

    pub fn read(&self, space: RegisterSpace, start: u16, count: u16) -> Result<Vec<u16>> {
        self.bank.lock().read(space, start, count)
    }

    pub fn write(&self, space: RegisterSpace, start: u16, values: &[u16]) -> Result<()> {
        self.bank.lock().write(space, start, values)
    }

    pub fn set_values(&self, space: RegisterSpace, start: u16, values: &[u16]) -> Result<()> {
        self.bank.lock().set_values(space, start, values)
    }

    pub fn revision(&self) -> u64 {
        self.bank.lock().revision()
    }
}

#[derive(Clone, Debug)]
pub struct SlaveEntry {
    pub handle: SlaveHandle,
    pub device: Option<Arc<Device>>,
}

/// Slaves known to one server, keyed by address.
#[derive(Default)]
pub struct SlaveRegistry {
    slaves: RwLock<BTreeMap<u8, SlaveEntry>>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slave(&self, address: u8) -> Result<SlaveHandle> {
        if address == BROADCAST_ADDRESS || address > MAX_SLAVE_ADDRESS {
            return Err(EctoError::InvalidAddress(address));
        }
        let mut slaves = self.slaves.write();
        if slaves.contains_key(&address) {
            return Err(EctoError::DuplicateAddress(address));
        }
        let handle = SlaveHandle::new(address);
        slaves.insert(
            address,
            SlaveEntry {
                handle: handle.clone(),
                device: None,
            },
        );
        tracing::debug!(slave = address, "Registered slave");
        Ok(handle)
    }

    /// Attach the device model that owns `address`'s bank.
    pub fn attach_device(&self, device: Arc<Device>) -> Result<()> {
        let address = device.address();
        let mut slaves = self.slaves.write();
        let entry = slaves
            .get_mut(&address)
            .ok_or(EctoError::UnknownSlave(address))?;
        if entry.device.is_some() {
            return Err(EctoError::DuplicateAddress(address));
        }
        entry.device = Some(device);
        Ok(())
    }

    pub fn remove_slave(&self, address: u8) -> Option<SlaveEntry> {
        let removed = self.slaves.write().remove(&address);
        if removed.is_some() {
            tracing::debug!(slave = address, "Removed slave");
        }
        removed
    }

    pub fn get(&self, address: u8) -> Option<SlaveEntry> {
        self.slaves.read().get(&address).cloned()
    }

    pub fn device(&self, address: u8) -> Option<Arc<Device>> {
        self.slaves.read().get(&address)?.device.clone()
    }

    pub fn addresses(&self) -> Vec<u8> {
        self.slaves.read().keys().copied().collect()
    }

    /// Snapshot of all entries, for broadcast.
    pub fn entries(&self) -> Vec<SlaveEntry> {
        self.slaves.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slaves.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.read().is_empty()
    }
}
