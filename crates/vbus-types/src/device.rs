use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persistent device identity.
///
/// Assigned once when a device is constructed and never changed afterwards, so it survives
/// save/reload and topology churn. Registries order devices by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Mints a fresh random id for a newly constructed device.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Builds an id from a raw 128-bit value. Mostly useful for deterministic tests.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for DeviceId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Coarse device class reported through the serial enumeration protocol.
///
/// The numeric ids are part of the guest-visible protocol and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DeviceType {
    Unknown = 0,
    Processor = 1,
    Memory = 2,
    Rom = 3,
    Storage = 4,
    Serial = 5,
    InterruptController = 6,
    Bridge = 7,
}

impl DeviceType {
    /// Protocol id, or `None` for [`DeviceType::Unknown`].
    pub const fn id(self) -> Option<u32> {
        match self {
            Self::Unknown => None,
            other => Some(other as u32),
        }
    }

    pub const fn from_id(id: u32) -> Self {
        match id {
            1 => Self::Processor,
            2 => Self::Memory,
            3 => Self::Rom,
            4 => Self::Storage,
            5 => Self::Serial,
            6 => Self::InterruptController,
            7 => Self::Bridge,
            _ => Self::Unknown,
        }
    }
}

/// Human-facing metadata a device may publish on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(device_type: DeviceType, name: impl Into<String>) -> Self {
        Self {
            device_type,
            name: name.into(),
        }
    }
}
