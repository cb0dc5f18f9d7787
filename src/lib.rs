//! Umbrella crate for the virtual bus workspace.
//!
//! Hosts usually depend on this crate alone: it re-exports the value types, the bus controller and
//! the reference peripherals under one roof.

pub use vbus;
pub use vbus_devices as devices;
pub use vbus_types as types;

pub use vbus::{BusController, BusControllerConfig, BusError, BusResult, ScanOutcome};
