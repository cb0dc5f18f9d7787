use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;
use vbus::{BusHandle, DeviceId, DeviceInfo, DeviceType};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity and bus back-reference shared by every peripheral in this crate.
#[derive(Debug)]
pub struct DeviceCore {
    id: DeviceId,
    info: DeviceInfo,
    bus: Mutex<Option<BusHandle>>,
}

impl DeviceCore {
    /// A core with a freshly minted random id.
    pub fn new(device_type: DeviceType, name: impl Into<String>) -> Self {
        Self::with_id(DeviceId::new_random(), device_type, name)
    }

    pub fn with_id(id: DeviceId, device_type: DeviceType, name: impl Into<String>) -> Self {
        Self {
            id,
            info: DeviceInfo::new(device_type, name),
            bus: Mutex::new(None),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The bus this device is attached to, if any.
    pub fn bus(&self) -> Option<BusHandle> {
        lock(&self.bus).clone()
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.bus).is_some()
    }

    pub fn attach(&self, bus: Option<BusHandle>) {
        match &bus {
            Some(handle) => debug!(device = %self.id, bus = handle.bus_id(), "attached"),
            None => debug!(device = %self.id, "detached"),
        }
        *lock(&self.bus) = bus;
    }
}

/// Where an addressable device wants to land.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    pub offset: Option<u64>,
    pub sort_hint: Option<i32>,
    pub minimum_len: Option<u64>,
}

impl Placement {
    pub(crate) fn preferred(&self, memory: vbus::AddressBlock, len: u64) -> vbus::AddressBlock {
        match self.offset {
            Some(offset) => memory.take_from(offset, len),
            None => memory.take(len),
        }
    }
}
