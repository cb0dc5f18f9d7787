use core::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use vbus_types::{AddressBlock, DeviceId, DeviceInfo};

use crate::controller::{BusController, BusHandle};
use crate::error::BusResult;

/// A device that occupies a window of the bus address space.
///
/// Addresses passed to [`Addressable::read`] and [`Addressable::write`] are local to the device's
/// assigned block. Implementations may call back into the bus from these methods.
pub trait Addressable {
    /// Returns the block this device would like in `configuration`.
    ///
    /// `memory` spans the whole address space. Devices that do not care where they land return
    /// `memory.take(len)`; devices that need a fixed window return `memory.take_from(offset, len)`.
    /// The mapper moves the block elsewhere if the preferred range is taken.
    fn preferred_address_block(&self, configuration: usize, memory: AddressBlock) -> AddressBlock;

    /// Smallest window the device can work with when the preferred length does not fit anywhere.
    fn minimum_length(&self, preferred: &AddressBlock) -> u64 {
        preferred.length
    }

    fn read(&self, address: u64) -> BusResult<u64>;
    fn write(&self, address: u64, value: u64) -> BusResult<()>;
}

pub trait InterruptSource {
    fn emitted_interrupts(&self) -> usize;

    fn emitted_interrupt_name(&self, index: usize) -> Option<&str> {
        let _ = index;
        None
    }
}

pub trait InterruptSink {
    fn accepted_interrupts(&self) -> usize;

    fn accepted_interrupt_name(&self, index: usize) -> Option<&str> {
        let _ = index;
        None
    }

    /// Delivers interrupt line `index` (local to this sink) with a payload word.
    fn interrupt(&self, index: usize, data: u64);
}

/// A device polled by the host outside the main bus tick.
///
/// `update_async` runs inside a dispatch scope, so it may use `bus` for reads, writes and
/// interrupts.
pub trait AsyncTickable {
    fn update_async(&self, bus: &BusController);
}

pub trait BusStateAware {
    fn handle_bus_online(&self);
    fn handle_bus_offline(&self);
}

/// Placement priority for the address allocator. Lower hints are placed first.
pub trait AddressHint {
    fn sort_hint(&self) -> i32;
}

pub trait BusChangeListener {
    /// Called after a scan changed the set of devices on the bus.
    fn handle_bus_changed(&self);
}

bitflags! {
    /// Summary of the capabilities a device exposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const ADDRESSABLE = 1 << 0;
        const INTERRUPT_SOURCE = 1 << 1;
        const INTERRUPT_SINK = 1 << 2;
        const ASYNC_TICKABLE = 1 << 3;
        const BUS_STATE_AWARE = 1 << 4;
        const ADDRESS_HINT = 1 << 5;
        const BUS_CHANGE_LISTENER = 1 << 6;
    }
}

/// A peripheral that can be discovered on a bus.
///
/// Optional capabilities are exposed through the `as_*` accessors. A device implements any subset
/// by returning `Some(self)` from the matching accessors.
pub trait BusDevice: Send + Sync {
    fn persistent_id(&self) -> DeviceId;

    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }

    /// Called with `Some` when the device joins a bus and `None` when it leaves.
    ///
    /// The handle is lent: devices must not rely on it keeping the controller alive.
    fn set_bus_controller(&self, controller: Option<BusHandle>) {
        let _ = controller;
    }

    fn as_addressable(&self) -> Option<&dyn Addressable> {
        None
    }

    fn as_interrupt_source(&self) -> Option<&dyn InterruptSource> {
        None
    }

    fn as_interrupt_sink(&self) -> Option<&dyn InterruptSink> {
        None
    }

    fn as_async_tickable(&self) -> Option<&dyn AsyncTickable> {
        None
    }

    fn as_bus_state_aware(&self) -> Option<&dyn BusStateAware> {
        None
    }

    fn as_address_hint(&self) -> Option<&dyn AddressHint> {
        None
    }

    fn as_bus_change_listener(&self) -> Option<&dyn BusChangeListener> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        caps.set(Capabilities::ADDRESSABLE, self.as_addressable().is_some());
        caps.set(
            Capabilities::INTERRUPT_SOURCE,
            self.as_interrupt_source().is_some(),
        );
        caps.set(Capabilities::INTERRUPT_SINK, self.as_interrupt_sink().is_some());
        caps.set(Capabilities::ASYNC_TICKABLE, self.as_async_tickable().is_some());
        caps.set(
            Capabilities::BUS_STATE_AWARE,
            self.as_bus_state_aware().is_some(),
        );
        caps.set(Capabilities::ADDRESS_HINT, self.as_address_hint().is_some());
        caps.set(
            Capabilities::BUS_CHANGE_LISTENER,
            self.as_bus_change_listener().is_some(),
        );
        caps
    }
}

/// Non-owning handle to a registered device.
///
/// The host owns devices; the bus only keeps weak references. A device the host dropped simply
/// fails to upgrade and disappears from the bus on the next scan.
#[derive(Clone)]
pub struct DeviceRef {
    id: DeviceId,
    device: Weak<dyn BusDevice>,
}

impl DeviceRef {
    pub fn new(device: &Arc<dyn BusDevice>) -> Self {
        Self {
            id: device.persistent_id(),
            device: Arc::downgrade(device),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Arc<dyn BusDevice>> {
        self.device.upgrade()
    }

    /// Returns `true` if this handle refers to exactly `device` (same instance, not just same id).
    pub fn is(&self, device: &Arc<dyn BusDevice>) -> bool {
        self.device.as_ptr() as *const () == Arc::as_ptr(device) as *const ()
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRef")
            .field("id", &self.id)
            .field("alive", &(self.device.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(DeviceId);

    impl BusDevice for Plain {
        fn persistent_id(&self) -> DeviceId {
            self.0
        }
    }

    struct Hinted(DeviceId);

    impl AddressHint for Hinted {
        fn sort_hint(&self) -> i32 {
            3
        }
    }

    impl InterruptSink for Hinted {
        fn accepted_interrupts(&self) -> usize {
            1
        }

        fn interrupt(&self, _index: usize, _data: u64) {}
    }

    impl BusDevice for Hinted {
        fn persistent_id(&self) -> DeviceId {
            self.0
        }

        fn as_address_hint(&self) -> Option<&dyn AddressHint> {
            Some(self)
        }

        fn as_interrupt_sink(&self) -> Option<&dyn InterruptSink> {
            Some(self)
        }
    }

    #[test]
    fn capabilities_follow_accessors() {
        let plain = Plain(DeviceId::from_u128(1));
        assert!(plain.capabilities().is_empty());

        let hinted = Hinted(DeviceId::from_u128(2));
        assert_eq!(
            hinted.capabilities(),
            Capabilities::ADDRESS_HINT | Capabilities::INTERRUPT_SINK
        );
    }

    #[test]
    fn device_ref_tracks_instance_identity_and_liveness() {
        let a: Arc<dyn BusDevice> = Arc::new(Plain(DeviceId::from_u128(1)));
        let twin: Arc<dyn BusDevice> = Arc::new(Plain(DeviceId::from_u128(1)));

        let handle = DeviceRef::new(&a);
        assert_eq!(handle.id(), DeviceId::from_u128(1));
        assert!(handle.is(&a));
        assert!(!handle.is(&twin));
        assert!(handle.upgrade().is_some());

        drop(a);
        assert!(handle.upgrade().is_none());
    }
}
