use std::collections::HashMap;
use std::sync::Arc;

use tracing::error;
use vbus_types::DeviceId;

use crate::device::{BusDevice, DeviceRef};
use crate::error::{BusError, BusResult};
use crate::subsystem::Subsystem;

/// Number of sequential registers in the serial enumeration window.
pub const SERIAL_PORT_COUNT: u64 = 4;
/// Read-only: number of devices on the bus.
pub const PORT_DEVICE_COUNT: u64 = 0;
/// Read/write: index of the selected device.
pub const PORT_SELECT: u64 = 1;
/// Read-only: type id of the selected device, or all ones.
pub const PORT_DEVICE_TYPE: u64 = 2;
/// Selected device's name, one character per read. Writing rewinds.
pub const PORT_DEVICE_NAME: u64 = 3;

pub type SelectionListener = Box<dyn Fn(Option<DeviceId>) + Send>;

/// Registry of the devices currently on the bus, keyed by persistent id.
///
/// Devices are kept sorted by id so the serial protocol can enumerate them by index, with a hash
/// index for direct lookups. The registry also implements the serial enumeration protocol.
pub struct DeviceMapper {
    devices: Vec<DeviceRef>,
    index: HashMap<DeviceId, DeviceRef>,
    word_mask: u64,
    selected: u64,
    name_cursor: usize,
    listeners: Vec<SelectionListener>,
}

impl DeviceMapper {
    pub fn new(word_mask: u64) -> Self {
        Self {
            devices: Vec::new(),
            index: HashMap::new(),
            word_mask,
            selected: 0,
            name_cursor: 0,
            listeners: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get_device(&self, id: DeviceId) -> Option<Arc<dyn BusDevice>> {
        self.index.get(&id).and_then(DeviceRef::upgrade)
    }

    pub fn device_ref(&self, id: DeviceId) -> Option<&DeviceRef> {
        self.index.get(&id)
    }

    /// Registered devices in id order.
    pub fn devices(&self) -> &[DeviceRef] {
        &self.devices
    }

    /// Registers a listener called with the newly selected device whenever the select port is
    /// written. Listeners run under the controller lock and must not touch the bus.
    pub fn add_selection_listener(&mut self, listener: SelectionListener) {
        self.listeners.push(listener);
    }

    pub fn selected_device(&self) -> Option<&DeviceRef> {
        usize::try_from(self.selected)
            .ok()
            .and_then(|idx| self.devices.get(idx))
    }

    pub fn serial_read(&mut self, port: u64) -> BusResult<u64> {
        match port {
            PORT_DEVICE_COUNT => Ok(self.devices.len() as u64 & self.word_mask),
            PORT_SELECT => Ok(self.selected & self.word_mask),
            PORT_DEVICE_TYPE => {
                let type_id = self
                    .selected_device()
                    .and_then(DeviceRef::upgrade)
                    .and_then(|device| device.device_info())
                    .and_then(|info| info.device_type.id());
                Ok(type_id.map_or(self.word_mask, |id| u64::from(id) & self.word_mask))
            }
            PORT_DEVICE_NAME => {
                let ch = self
                    .selected_device()
                    .and_then(DeviceRef::upgrade)
                    .and_then(|device| device.device_info())
                    .and_then(|info| info.name.chars().nth(self.name_cursor));
                match ch {
                    Some(ch) => {
                        self.name_cursor += 1;
                        Ok(u64::from(ch) & self.word_mask)
                    }
                    None => Ok(0),
                }
            }
            _ => Err(BusError::AddressOutOfRange {
                address: port,
                limit: SERIAL_PORT_COUNT,
            }),
        }
    }

    pub fn serial_write(&mut self, port: u64, value: u64) -> BusResult<()> {
        match port {
            PORT_DEVICE_COUNT | PORT_DEVICE_TYPE => Ok(()),
            PORT_SELECT => {
                self.selected = value & self.word_mask;
                self.name_cursor = 0;
                let selected = self.selected_device().map(DeviceRef::id);
                for listener in &self.listeners {
                    listener(selected);
                }
                Ok(())
            }
            PORT_DEVICE_NAME => {
                self.name_cursor = 0;
                Ok(())
            }
            _ => Err(BusError::AddressOutOfRange {
                address: port,
                limit: SERIAL_PORT_COUNT,
            }),
        }
    }
}

impl Subsystem for DeviceMapper {
    fn name(&self) -> &'static str {
        "device mapper"
    }

    fn add(&mut self, device: &Arc<dyn BusDevice>) {
        let handle = DeviceRef::new(device);
        let id = handle.id();
        match self.devices.binary_search_by_key(&id, DeviceRef::id) {
            Ok(_) => {
                debug_assert!(false, "duplicate device {id} added to registry");
                error!(%id, "duplicate device added to registry; ignoring");
            }
            Err(pos) => {
                self.devices.insert(pos, handle.clone());
                self.index.insert(id, handle);
            }
        }
    }

    fn remove(&mut self, id: DeviceId) {
        match self.devices.binary_search_by_key(&id, DeviceRef::id) {
            Ok(pos) => {
                self.devices.remove(pos);
                self.index.remove(&id);
            }
            Err(_) => {
                debug_assert!(false, "removing unknown device {id} from registry");
                error!(%id, "removing unknown device from registry; ignoring");
            }
        }
    }

    fn validate(&mut self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.selected = 0;
        self.name_cursor = 0;
    }
}
