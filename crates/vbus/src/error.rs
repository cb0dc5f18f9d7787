use thiserror::Error;
use vbus_types::{AddressBlock, DeviceId};

pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors surfaced by bus access and bus configuration.
///
/// Transient topology failures never show up here: a scan that cannot enumerate a neighbor is
/// retried later (see [`crate::ScanOutcome::Retry`]). Allocation conflicts found during a scan are
/// reported through [`crate::BusController::validation_errors`] instead, since they are a bus
/// state rather than a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus is offline")]
    Offline,

    /// Bus access from outside a callback the controller originated.
    #[error("bus access outside of a controller dispatch")]
    NotInDispatch,

    #[error("bus dispatch nested too deeply (depth {depth})")]
    DispatchTooDeep { depth: usize },

    #[error("address 0x{address:x} out of range (limit 0x{limit:x})")]
    AddressOutOfRange { address: u64, limit: u64 },

    #[error("no device mapped at address 0x{address:x}")]
    UnmappedAddress { address: u64 },

    #[error("value 0x{value:x} exceeds word mask 0x{mask:x}")]
    ValueOutOfRange { value: u64, mask: u64 },

    #[error("address block {block} conflicts with {other}")]
    AddressConflict {
        block: AddressBlock,
        other: AddressBlock,
    },

    #[error("configuration index {index} out of range ({count} configurations)")]
    ConfigurationOutOfRange { index: usize, count: usize },

    #[error("interrupt index {index} out of range ({count} lines)")]
    InterruptOutOfRange { index: usize, count: usize },

    #[error("unknown interrupt id {0}")]
    UnknownInterrupt(u32),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
