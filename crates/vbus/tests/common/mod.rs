#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vbus::{
    AddressBlock, AddressHint, Addressable, AsyncTickable, BusChangeListener, BusConnector,
    BusController, BusControllerConfig, BusDevice, BusElement, BusHandle, BusResult, BusSegment,
    BusStateAware, DeviceId, DeviceInfo, DeviceType, InterruptSink, InterruptSource,
};

/// Routes bus logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub fn bus(config: BusControllerConfig) -> Arc<BusController> {
    init_tracing();
    BusController::new(config).unwrap()
}

pub fn small_bus(address_bits: u32) -> Arc<BusController> {
    bus(BusControllerConfig {
        address_bits,
        ..Default::default()
    })
}

/// A topology node that is both a connector and a segment.
#[derive(Default)]
pub struct Node {
    links: Mutex<Vec<Arc<dyn BusElement>>>,
    devices: Mutex<Vec<Arc<dyn BusDevice>>>,
    unreachable: AtomicBool,
}

impl Node {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_devices(devices: &[Arc<dyn BusDevice>]) -> Arc<Self> {
        let node = Self::new();
        node.devices.lock().unwrap().extend(devices.iter().cloned());
        node
    }

    pub fn plug(&self, device: Arc<dyn BusDevice>) {
        self.devices.lock().unwrap().push(device);
    }

    pub fn unplug(&self, id: DeviceId) {
        self.devices
            .lock()
            .unwrap()
            .retain(|d| d.persistent_id() != id);
    }

    pub fn link(&self, other: Arc<dyn BusElement>) {
        self.links.lock().unwrap().push(other);
    }

    pub fn clear_links(&self) {
        self.links.lock().unwrap().clear();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

impl BusElement for Node {
    fn as_connector(&self) -> Option<&dyn BusConnector> {
        Some(self)
    }

    fn as_segment(&self) -> Option<&dyn BusSegment> {
        Some(self)
    }
}

impl BusConnector for Node {
    fn get_connected(&self, out: &mut Vec<Arc<dyn BusElement>>) -> bool {
        if self.unreachable.load(Ordering::SeqCst) {
            return false;
        }
        out.extend(self.links.lock().unwrap().iter().cloned());
        true
    }
}

impl BusSegment for Node {
    fn get_devices(&self, out: &mut Vec<Arc<dyn BusDevice>>) -> bool {
        if self.unreachable.load(Ordering::SeqCst) {
            return false;
        }
        out.extend(self.devices.lock().unwrap().iter().cloned());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Attached(u64),
    Detached,
    Online,
    Offline,
    Changed,
}

/// Word-addressed memory that records lifecycle callbacks.
pub struct Memory {
    id: DeviceId,
    name: &'static str,
    words: Mutex<Vec<u64>>,
    offset: Option<u64>,
    hint: Option<i32>,
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Memory {
    pub fn new(id: u128, len: usize) -> Self {
        Self {
            id: DeviceId::from_u128(id),
            name: "mem",
            words: Mutex::new(vec![0; len]),
            offset: None,
            hint: None,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn hint(mut self, hint: i32) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Addressable for Memory {
    fn preferred_address_block(&self, _configuration: usize, memory: AddressBlock) -> AddressBlock {
        let len = self.words.lock().unwrap().len() as u64;
        match self.offset {
            Some(offset) => memory.take_from(offset, len),
            None => memory.take(len),
        }
    }

    fn read(&self, address: u64) -> BusResult<u64> {
        Ok(self.words.lock().unwrap()[address as usize])
    }

    fn write(&self, address: u64, value: u64) -> BusResult<()> {
        self.words.lock().unwrap()[address as usize] = value;
        Ok(())
    }
}

impl AddressHint for Memory {
    fn sort_hint(&self) -> i32 {
        self.hint.unwrap_or_default()
    }
}

impl BusStateAware for Memory {
    fn handle_bus_online(&self) {
        self.events.lock().unwrap().push(Event::Online);
    }

    fn handle_bus_offline(&self) {
        self.events.lock().unwrap().push(Event::Offline);
    }
}

impl BusChangeListener for Memory {
    fn handle_bus_changed(&self) {
        self.events.lock().unwrap().push(Event::Changed);
    }
}

impl BusDevice for Memory {
    fn persistent_id(&self) -> DeviceId {
        self.id
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(DeviceInfo::new(DeviceType::Memory, self.name))
    }

    fn set_bus_controller(&self, controller: Option<BusHandle>) {
        let event = match controller {
            Some(handle) => Event::Attached(handle.bus_id()),
            None => Event::Detached,
        };
        self.events.lock().unwrap().push(event);
    }

    fn as_addressable(&self) -> Option<&dyn Addressable> {
        Some(self)
    }

    fn as_address_hint(&self) -> Option<&dyn AddressHint> {
        self.hint.is_some().then_some(self as &dyn AddressHint)
    }

    fn as_bus_state_aware(&self) -> Option<&dyn BusStateAware> {
        Some(self)
    }

    fn as_bus_change_listener(&self) -> Option<&dyn BusChangeListener> {
        Some(self)
    }
}

type Script = Box<dyn FnMut(&BusController) + Send>;

/// Runs a test closure from inside `update_async`, where bus access is legal.
pub struct Probe {
    id: DeviceId,
    script: Mutex<Option<Script>>,
}

impl Probe {
    pub fn new(id: u128) -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::from_u128(id),
            script: Mutex::new(None),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn run<F>(&self, bus: &BusController, script: F)
    where
        F: FnMut(&BusController) + Send + 'static,
    {
        *self.script.lock().unwrap() = Some(Box::new(script));
        bus.update_device_async(self.id).unwrap();
        *self.script.lock().unwrap() = None;
    }
}

impl AsyncTickable for Probe {
    fn update_async(&self, bus: &BusController) {
        // Take the script out so a nested update does not deadlock on it.
        let script = self.script.lock().unwrap().take();
        if let Some(mut script) = script {
            script(bus);
            *self.script.lock().unwrap() = Some(script);
        }
    }
}

impl BusDevice for Probe {
    fn persistent_id(&self) -> DeviceId {
        self.id
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(DeviceInfo::new(DeviceType::Processor, "probe"))
    }

    fn as_async_tickable(&self) -> Option<&dyn AsyncTickable> {
        Some(self)
    }
}

/// An addressable window that forwards every access to `target + address` on its own bus.
pub struct Bridge {
    id: DeviceId,
    len: u64,
    target: u64,
    bus: Mutex<Option<BusHandle>>,
}

impl Bridge {
    pub fn new(id: u128, len: u64, target: u64) -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::from_u128(id),
            len,
            target,
            bus: Mutex::new(None),
        })
    }

    fn controller(&self) -> BusResult<Arc<BusController>> {
        self.bus
            .lock()
            .unwrap()
            .as_ref()
            .and_then(BusHandle::upgrade)
            .ok_or(vbus::BusError::Offline)
    }
}

impl Addressable for Bridge {
    fn preferred_address_block(&self, _configuration: usize, memory: AddressBlock) -> AddressBlock {
        memory.take(self.len)
    }

    fn read(&self, address: u64) -> BusResult<u64> {
        self.controller()?.map_and_read(self.target + address)
    }

    fn write(&self, address: u64, value: u64) -> BusResult<()> {
        self.controller()?.map_and_write(self.target + address, value)
    }
}

impl BusDevice for Bridge {
    fn persistent_id(&self) -> DeviceId {
        self.id
    }

    fn set_bus_controller(&self, controller: Option<BusHandle>) {
        *self.bus.lock().unwrap() = controller;
    }

    fn as_addressable(&self) -> Option<&dyn Addressable> {
        Some(self)
    }
}

/// Interrupt endpoint with a fixed number of emitted and accepted lines.
pub struct Irq {
    id: DeviceId,
    emits: usize,
    accepts: usize,
    pub received: Arc<Mutex<Vec<(usize, u64)>>>,
}

impl Irq {
    pub fn new(id: u128, emits: usize, accepts: usize) -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::from_u128(id),
            emits,
            accepts,
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn received(&self) -> Vec<(usize, u64)> {
        self.received.lock().unwrap().clone()
    }
}

impl InterruptSource for Irq {
    fn emitted_interrupts(&self) -> usize {
        self.emits
    }
}

impl InterruptSink for Irq {
    fn accepted_interrupts(&self) -> usize {
        self.accepts
    }

    fn accepted_interrupt_name(&self, index: usize) -> Option<&str> {
        (index == 0).then_some("in0")
    }

    fn interrupt(&self, index: usize, data: u64) {
        self.received.lock().unwrap().push((index, data));
    }
}

impl BusDevice for Irq {
    fn persistent_id(&self) -> DeviceId {
        self.id
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(DeviceInfo::new(DeviceType::InterruptController, "irq"))
    }

    fn as_interrupt_source(&self) -> Option<&dyn InterruptSource> {
        (self.emits > 0).then_some(self as &dyn InterruptSource)
    }

    fn as_interrupt_sink(&self) -> Option<&dyn InterruptSink> {
        (self.accepts > 0).then_some(self as &dyn InterruptSink)
    }
}

pub fn dev<T: BusDevice + 'static>(device: &Arc<T>) -> Arc<dyn BusDevice> {
    device.clone()
}

pub fn elem<T: BusElement + 'static>(element: &Arc<T>) -> Arc<dyn BusElement> {
    element.clone()
}

/// Instance identity, ignoring trait object metadata.
pub fn same<T: BusDevice + 'static>(a: &Arc<dyn BusDevice>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
