//! Serializable allocation state.
//!
//! These are the values a host persists to restore a bus after reload: the pinned address
//! assignments of every configuration and the interrupt wiring table. Interrupt ids themselves are
//! not stored; they are re-derived deterministically from the device population on the next scan.
//! No file format is defined here; hosts pick their own serializer.

use serde::{Deserialize, Serialize};

use crate::{AddressBlock, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssignment {
    pub device: DeviceId,
    pub block: AddressBlock,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMapSnapshot {
    /// Index of the active configuration.
    pub active: u32,
    /// Pinned assignments, one list per configuration, sorted by device id.
    pub configurations: Vec<Vec<AddressAssignment>>,
}

/// One wiring entry: interrupts emitted on `source` are delivered to `sink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterruptRoute {
    pub source: u32,
    pub sink: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub addresses: AddressMapSnapshot,
    pub interrupt_routes: Vec<InterruptRoute>,
}
