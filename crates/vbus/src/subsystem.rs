use std::sync::Arc;

use vbus_types::DeviceId;

use crate::device::BusDevice;

/// A controller-owned module that tracks the device population.
///
/// `add` and `remove` are only called while applying a scan diff, under the controller lock.
/// Implementations may query device capabilities there but must not call back into the bus.
pub trait Subsystem {
    fn name(&self) -> &'static str;

    fn add(&mut self, device: &Arc<dyn BusDevice>);

    /// Drops a departed device. The device itself may already be gone, so only its id is passed.
    fn remove(&mut self, id: DeviceId);

    /// Returns `false` if the current population cannot be served (the bus then stays offline).
    fn validate(&mut self) -> bool;

    /// Drops volatile state when the bus leaves the online state.
    fn reset(&mut self);
}
