//! Plain value types shared by the virtual bus crates.
//!
//! Everything in here is a value: no locks, no device handles, no behavior beyond arithmetic on
//! ranges and identifiers. The bus controller (in `vbus`) builds on these, and hosts that persist
//! bus state only ever need this crate.
//!
//! - [`AddressBlock`]: a contiguous window of words in a bus address space
//! - [`AddressRangeSet`]: a set of disjoint address ranges used to track free space
//! - [`InterruptList`]: free interrupt identifiers derived from an occupancy snapshot
//! - [`DeviceId`] / [`DeviceInfo`]: stable device identity and metadata
//! - [`snapshot`]: serializable allocation state

#![forbid(unsafe_code)]

mod address;
mod device;
mod interrupt;
mod range_set;
pub mod snapshot;

pub use address::AddressBlock;
pub use device::{DeviceId, DeviceInfo, DeviceType};
pub use interrupt::InterruptList;
pub use range_set::{AddressRange, AddressRangeSet};
