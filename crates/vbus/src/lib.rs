//! Virtual hardware bus controller.
//!
//! A [`BusController`] discovers the devices reachable through a graph of connectors and segments,
//! gives each one a conflict-free address block and a set of interrupt ids, and routes reads,
//! writes and interrupts between them.
//!
//! - [`BusController`]: the arbitration point; scans, lifecycle, access entry points
//! - [`DeviceMapper`]: registry of attached devices and the serial enumeration protocol
//! - [`AddressMapper`]: address allocation and translation, one or more configurations
//! - [`InterruptMapper`]: interrupt id allocation and source to sink wiring
//! - [`BusDevice`] and the capability traits devices implement
//!
//! Devices are owned by the host. The bus only keeps weak handles, and a device the host drops
//! disappears on the next scan.

#![forbid(unsafe_code)]

mod address_mapper;
mod bus_lock;
mod config;
mod controller;
mod device;
mod device_mapper;
mod dispatch;
mod error;
mod interrupt_mapper;
mod subsystem;
mod topology;

pub use address_mapper::{AddressMapper, MappedAccess};
pub use config::BusControllerConfig;
pub use controller::{BusController, BusHandle, ControllerState, ScanOutcome};
pub use device::{
    AddressHint, Addressable, AsyncTickable, BusChangeListener, BusDevice, BusStateAware,
    Capabilities, DeviceRef, InterruptSink, InterruptSource,
};
pub use device_mapper::{
    DeviceMapper, SelectionListener, PORT_DEVICE_COUNT, PORT_DEVICE_NAME, PORT_DEVICE_TYPE,
    PORT_SELECT, SERIAL_PORT_COUNT,
};
pub use dispatch::MAX_DISPATCH_DEPTH;
pub use error::{BusError, BusResult};
pub use interrupt_mapper::{InterruptDelivery, InterruptLine, InterruptLines, InterruptMapper};
pub use subsystem::Subsystem;
pub use topology::{BusConnector, BusElement, BusSegment};

pub use vbus_types::snapshot::BusSnapshot;
pub use vbus_types::{AddressBlock, DeviceId, DeviceInfo, DeviceType};
