use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};
use vbus_types::snapshot::BusSnapshot;
use vbus_types::{AddressBlock, DeviceId};

use crate::address_mapper::AddressMapper;
use crate::bus_lock::{BusLock, BusLockGuard};
use crate::config::BusControllerConfig;
use crate::device::{BusDevice, DeviceRef};
use crate::device_mapper::{DeviceMapper, SelectionListener};
use crate::dispatch::{check_access, DispatchScope};
use crate::error::{BusError, BusResult};
use crate::interrupt_mapper::{InterruptLines, InterruptMapper};
use crate::subsystem::Subsystem;
use crate::topology::{discover, BusElement};

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Offline,
    /// A scan is walking the topology of a bus that was not online.
    Scanning,
    Online,
}

/// What a call to [`BusController::tick`] or [`BusController::scan_now`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanOutcome {
    /// No scan was due, or one is already running on another thread.
    Idle,
    /// The scan found the same devices as before.
    Unchanged,
    /// The scan added or removed devices.
    Applied,
    /// Part of the topology could not be enumerated; a retry is scheduled.
    Retry,
}

#[derive(Debug, Default)]
struct ScanSchedule {
    due: Option<u64>,
    in_flight: bool,
    follow_up: bool,
}

struct BusState {
    state: ControllerState,
    roots: Vec<Arc<dyn BusElement>>,
    schedule: ScanSchedule,
    tick: u64,
    devices: DeviceMapper,
    addresses: AddressMapper,
    interrupts: InterruptMapper,
    validation_errors: Vec<&'static str>,
    needs_validation: bool,
}

impl BusState {
    fn new(config: &BusControllerConfig) -> Self {
        Self {
            state: ControllerState::Offline,
            roots: Vec::new(),
            schedule: ScanSchedule::default(),
            tick: 0,
            devices: DeviceMapper::new(config.word_mask()),
            addresses: AddressMapper::new(config),
            interrupts: InterruptMapper::new(config.max_interrupt_ids),
            validation_errors: Vec::new(),
            needs_validation: true,
        }
    }

    fn subsystems_mut(&mut self) -> [&mut dyn Subsystem; 3] {
        [&mut self.devices, &mut self.addresses, &mut self.interrupts]
    }

    fn ensure_online(&self) -> BusResult<()> {
        match self.state {
            ControllerState::Online => Ok(()),
            _ => Err(BusError::Offline),
        }
    }

    fn schedule_at(&mut self, at: u64) {
        if self.schedule.in_flight {
            self.schedule.follow_up = true;
        } else {
            self.schedule.due = Some(at);
        }
    }

    fn live_devices(&self) -> Vec<Arc<dyn BusDevice>> {
        self.devices
            .devices()
            .iter()
            .filter_map(DeviceRef::upgrade)
            .collect()
    }
}

/// Weak, cloneable reference to a controller, lent to devices while they are attached.
#[derive(Clone)]
pub struct BusHandle {
    bus: u64,
    controller: Weak<BusController>,
}

impl BusHandle {
    pub fn bus_id(&self) -> u64 {
        self.bus
    }

    pub fn upgrade(&self) -> Option<Arc<BusController>> {
        self.controller.upgrade()
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle").field("bus", &self.bus).finish()
    }
}

/// Callbacks collected while the state is borrowed and run once it is released.
#[derive(Default)]
struct Notifications {
    offline: Vec<Arc<dyn BusDevice>>,
    detached: Vec<Arc<dyn BusDevice>>,
    attached: Vec<Arc<dyn BusDevice>>,
    online: Vec<Arc<dyn BusDevice>>,
    changed: Vec<Arc<dyn BusDevice>>,
}

/// The arbitration point of one bus.
///
/// One reentrant lock per bus serializes every access, device update and scan application.
/// Device callbacks run with it held, so a scan never changes the population under a running
/// device, and devices are still free to call back into the controller from `read`, `write`,
/// `interrupt` and the other controller-originated callbacks. Only the topology walk runs outside
/// of it.
pub struct BusController {
    id: u64,
    config: BusControllerConfig,
    this: Weak<BusController>,
    bus_lock: BusLock,
    state: Mutex<BusState>,
}

/// Borrow of the bus state, taken with the bus lock held. Never held across a device call.
struct StateGuard<'a> {
    guard: MutexGuard<'a, BusState>,
    _held: BusLockGuard<'a>,
}

impl Deref for StateGuard<'_> {
    type Target = BusState;

    fn deref(&self) -> &BusState {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut BusState {
        &mut self.guard
    }
}

impl BusController {
    pub fn new(config: BusControllerConfig) -> BusResult<Arc<Self>> {
        config.validate()?;
        let id = NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed);
        debug!(bus = id, ?config, "creating bus controller");
        Ok(Arc::new_cyclic(|this| Self {
            id,
            bus_lock: BusLock::default(),
            state: Mutex::new(BusState::new(&config)),
            config,
            this: this.clone(),
        }))
    }

    fn lock(&self) -> StateGuard<'_> {
        let held = self.bus_lock.acquire();
        let state = self.state.lock().unwrap_or_else(|poisoned| {
            warn!(bus = self.id, "bus state lock poisoned; recovering");
            poisoned.into_inner()
        });
        StateGuard { guard: state, _held: held }
    }

    pub fn bus_id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &BusControllerConfig {
        &self.config
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle {
            bus: self.id,
            controller: self.this.clone(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    pub fn is_online(&self) -> bool {
        self.state() == ControllerState::Online
    }

    /// Names of the subsystems that rejected the current population.
    pub fn validation_errors(&self) -> Vec<&'static str> {
        self.lock().validation_errors.clone()
    }

    /// Ids of the registered devices, in id order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.lock().devices.devices().iter().map(DeviceRef::id).collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<dyn BusDevice>> {
        self.lock().devices.get_device(id)
    }

    /// Attaches a root element and schedules a scan.
    pub fn connect(&self, element: Arc<dyn BusElement>) {
        let mut state = self.lock();
        state.roots.push(element);
        let next = state.tick + 1;
        state.schedule_at(next);
    }

    /// Detaches a root element (by identity). Returns `false` if it was not attached.
    pub fn disconnect(&self, element: &Arc<dyn BusElement>) -> bool {
        let mut state = self.lock();
        let before = state.roots.len();
        state.roots.retain(|root| !Arc::ptr_eq(root, element));
        let removed = state.roots.len() != before;
        if removed {
            let next = state.tick + 1;
            state.schedule_at(next);
        }
        removed
    }

    /// Requests a scan on the next tick, superseding any pending one.
    pub fn schedule_scan(&self) {
        let mut state = self.lock();
        let next = state.tick + 1;
        state.schedule_at(next);
    }

    /// Host step: advances the tick counter and runs a scan if one is due.
    pub fn tick(&self) -> ScanOutcome {
        let due = {
            let mut state = self.lock();
            state.tick += 1;
            let now = state.tick;
            !state.schedule.in_flight && state.schedule.due.is_some_and(|at| at <= now)
        };
        if due {
            self.scan_now()
        } else {
            ScanOutcome::Idle
        }
    }

    /// Walks the topology and applies the result right away.
    pub fn scan_now(&self) -> ScanOutcome {
        let roots = {
            let mut state = self.lock();
            if state.schedule.in_flight {
                state.schedule.follow_up = true;
                return ScanOutcome::Idle;
            }
            state.schedule.in_flight = true;
            state.schedule.due = None;
            if state.state == ControllerState::Offline {
                state.state = ControllerState::Scanning;
            }
            state.roots.clone()
        };

        debug!(bus = self.id, roots = roots.len(), "scanning bus topology");
        let found = discover(&roots);

        // Held through the notifications: callbacks from this scan finish before any other
        // thread can access the bus or apply another scan.
        let _held = self.bus_lock.acquire();
        let mut state = self.lock();
        let (outcome, notifications) = match found {
            Ok(found) => self.apply_scan(&mut state, found),
            Err(failure) => {
                if state.state == ControllerState::Scanning {
                    state.state = ControllerState::Offline;
                }
                let retry = state.tick + self.config.scan_retry_delay_ticks;
                state.schedule.due = Some(retry);
                warn!(
                    bus = self.id,
                    visited = failure.visited,
                    retry_at = retry,
                    "bus topology not reachable; retrying later"
                );
                (ScanOutcome::Retry, Notifications::default())
            }
        };
        drop(state);

        self.notify(notifications);

        let mut state = self.lock();
        state.schedule.in_flight = false;
        if std::mem::take(&mut state.schedule.follow_up) {
            let next = state.tick + 1;
            state.schedule.due = Some(state.schedule.due.map_or(next, |due| due.min(next)));
        }
        outcome
    }

    fn apply_scan(
        &self,
        state: &mut BusState,
        found: Vec<Arc<dyn BusDevice>>,
    ) -> (ScanOutcome, Notifications) {
        let mut notes = Notifications::default();

        let departed: Vec<DeviceRef> = state
            .devices
            .devices()
            .iter()
            .filter(|handle| !found.iter().any(|device| handle.is(device)))
            .cloned()
            .collect();
        let arrived: Vec<Arc<dyn BusDevice>> = found
            .iter()
            .filter(|device| {
                state
                    .devices
                    .device_ref(device.persistent_id())
                    .map_or(true, |handle| !handle.is(device))
            })
            .cloned()
            .collect();
        let changed = !departed.is_empty() || !arrived.is_empty();
        let was_online = state.state == ControllerState::Online;

        if !changed && !state.needs_validation && was_online {
            return (ScanOutcome::Unchanged, notes);
        }
        if changed {
            debug!(
                bus = self.id,
                departed = departed.len(),
                arrived = arrived.len(),
                "applying bus scan"
            );
        }

        if was_online && changed {
            self.go_offline(state, &mut notes);
        }

        for handle in &departed {
            for subsystem in state.subsystems_mut() {
                subsystem.remove(handle.id());
            }
            notes.detached.extend(handle.upgrade());
        }
        for device in &arrived {
            for subsystem in state.subsystems_mut() {
                subsystem.add(device);
            }
            notes.attached.push(device.clone());
        }

        let mut errors = Vec::new();
        for subsystem in state.subsystems_mut() {
            if !subsystem.validate() {
                errors.push(subsystem.name());
            }
        }
        state.needs_validation = false;

        if errors.is_empty() {
            if state.state != ControllerState::Online {
                state.state = ControllerState::Online;
                info!(bus = self.id, devices = state.devices.len(), "bus online");
                notes.online = state
                    .live_devices()
                    .into_iter()
                    .filter(|device| device.as_bus_state_aware().is_some())
                    .collect();
            }
        } else {
            warn!(bus = self.id, ?errors, "bus configuration invalid");
            if state.state == ControllerState::Online {
                self.go_offline(state, &mut notes);
            } else {
                state.state = ControllerState::Offline;
            }
        }
        state.validation_errors = errors;

        if changed {
            notes.changed = state
                .live_devices()
                .into_iter()
                .filter(|device| device.as_bus_change_listener().is_some())
                .collect();
            (ScanOutcome::Applied, notes)
        } else {
            (ScanOutcome::Unchanged, notes)
        }
    }

    fn go_offline(&self, state: &mut BusState, notes: &mut Notifications) {
        state.state = ControllerState::Offline;
        info!(bus = self.id, "bus offline");
        notes.offline.extend(
            state
                .live_devices()
                .into_iter()
                .filter(|device| device.as_bus_state_aware().is_some()),
        );
        for subsystem in state.subsystems_mut() {
            subsystem.reset();
        }
    }

    fn notify(&self, notes: Notifications) {
        for device in notes.offline {
            self.dispatch(|| {
                if let Some(aware) = device.as_bus_state_aware() {
                    aware.handle_bus_offline();
                }
            });
        }
        for device in notes.detached {
            device.set_bus_controller(None);
        }
        for device in notes.attached {
            device.set_bus_controller(Some(self.handle()));
        }
        for device in notes.online {
            self.dispatch(|| {
                if let Some(aware) = device.as_bus_state_aware() {
                    aware.handle_bus_online();
                }
            });
        }
        for device in notes.changed {
            self.dispatch(|| {
                if let Some(listener) = device.as_bus_change_listener() {
                    listener.handle_bus_changed();
                }
            });
        }
    }

    fn dispatch<F: FnOnce()>(&self, f: F) {
        match DispatchScope::enter(self.id) {
            Ok(_scope) => f(),
            Err(err) => warn!(bus = self.id, %err, "skipping device callback"),
        }
    }

    /// Runs every attached [`crate::AsyncTickable`] device once. Does nothing while offline.
    pub fn update_async(&self) {
        let tickables: Vec<Arc<dyn BusDevice>> = {
            let state = self.lock();
            if state.ensure_online().is_err() {
                return;
            }
            state
                .live_devices()
                .into_iter()
                .filter(|device| device.as_async_tickable().is_some())
                .collect()
        };
        for device in tickables {
            let _held = self.bus_lock.acquire();
            {
                // A scan may have run since the list was taken.
                let state = self.lock();
                if state.ensure_online().is_err() {
                    return;
                }
                let registered = state
                    .devices
                    .device_ref(device.persistent_id())
                    .is_some_and(|handle| handle.is(&device));
                if !registered {
                    continue;
                }
            }
            self.dispatch(|| {
                if let Some(tickable) = device.as_async_tickable() {
                    tickable.update_async(self);
                }
            });
        }
    }

    /// Runs one device's [`crate::AsyncTickable::update_async`].
    pub fn update_device_async(&self, id: DeviceId) -> BusResult<()> {
        let _held = self.bus_lock.acquire();
        let device = {
            let state = self.lock();
            state.ensure_online()?;
            state.devices.get_device(id).ok_or(BusError::UnknownDevice(id))?
        };
        let tickable = device
            .as_async_tickable()
            .ok_or(BusError::UnknownDevice(id))?;
        let _scope = DispatchScope::enter(self.id)?;
        tickable.update_async(self);
        Ok(())
    }

    fn serial_port(&self, address: u64) -> Option<u64> {
        self.config
            .serial_window()
            .filter(|window| window.contains(address))
            .map(|window| address - window.offset)
    }

    pub fn map_and_read(&self, address: u64) -> BusResult<u64> {
        check_access(self.id)?;
        let _held = self.bus_lock.acquire();
        let access = {
            let mut state = self.lock();
            state.ensure_online()?;
            if let Some(port) = self.serial_port(address) {
                return state.devices.serial_read(port);
            }
            state.addresses.resolve(address)?
        };
        let _scope = DispatchScope::enter(self.id)?;
        access.read()
    }

    pub fn map_and_write(&self, address: u64, value: u64) -> BusResult<()> {
        check_access(self.id)?;
        let _held = self.bus_lock.acquire();
        let access = {
            let mut state = self.lock();
            state.ensure_online()?;
            state.addresses.check_value(value)?;
            if let Some(port) = self.serial_port(address) {
                return state.devices.serial_write(port, value);
            }
            state.addresses.resolve(address)?
        };
        let _scope = DispatchScope::enter(self.id)?;
        access.write(value)
    }

    /// Raises line `index` of interrupt source `source`. Unwired lines are dropped.
    pub fn interrupt(&self, source: DeviceId, index: usize, data: u64) -> BusResult<()> {
        check_access(self.id)?;
        let _held = self.bus_lock.acquire();
        let delivery = {
            let state = self.lock();
            state.ensure_online()?;
            state.interrupts.resolve(source, index)?
        };
        if let Some(delivery) = delivery {
            let _scope = DispatchScope::enter(self.id)?;
            delivery.deliver(data);
        }
        Ok(())
    }

    /// Host-side access to a serial enumeration port, without going through the address space.
    ///
    /// Unlike [`BusController::map_and_read`] this needs no dispatch scope, but the bus must be
    /// online like for any other access.
    pub fn serial_read(&self, port: u64) -> BusResult<u64> {
        let mut state = self.lock();
        state.ensure_online()?;
        state.devices.serial_read(port)
    }

    /// Host-side write to a serial enumeration port. Selecting a device runs the selection
    /// listeners on the calling thread.
    pub fn serial_write(&self, port: u64, value: u64) -> BusResult<()> {
        let mut state = self.lock();
        state.ensure_online()?;
        state.devices.serial_write(port, value)
    }

    /// Listeners run with the bus locked and must not call back into it.
    pub fn add_selection_listener(&self, listener: SelectionListener) {
        self.lock().devices.add_selection_listener(listener);
    }

    pub fn word_size(&self) -> u32 {
        self.config.word_bits
    }

    pub fn word_mask(&self) -> u64 {
        self.config.word_mask()
    }

    pub fn configuration_count(&self) -> usize {
        self.config.configurations
    }

    pub fn active_configuration(&self) -> usize {
        self.lock().addresses.active_configuration()
    }

    pub fn set_active_configuration(&self, index: usize) -> BusResult<()> {
        self.lock().addresses.set_active_configuration(index)
    }

    pub fn set_device_address(&self, device: DeviceId, block: AddressBlock) -> BusResult<()> {
        let mut state = self.lock();
        state.addresses.set_device_address(device, block)?;
        if state.state != ControllerState::Online {
            state.needs_validation = true;
            let next = state.tick + 1;
            state.schedule_at(next);
        }
        Ok(())
    }

    pub fn address_block(&self, device: DeviceId) -> Option<AddressBlock> {
        self.lock().addresses.address_block(device)
    }

    pub fn device_at(&self, address: u64) -> Option<DeviceId> {
        self.lock().addresses.device_at(address)
    }

    pub fn set_interrupt_mapping(&self, source: u32, sink: u32) -> BusResult<()> {
        self.lock().interrupts.set_interrupt_mapping(source, sink)
    }

    pub fn clear_interrupt_mapping(&self, source: u32) -> Option<u32> {
        self.lock().interrupts.clear_interrupt_mapping(source)
    }

    pub fn interrupt_source_ids(&self, device: DeviceId) -> Option<Vec<u32>> {
        self.lock()
            .interrupts
            .interrupt_source_ids(device)
            .map(<[u32]>::to_vec)
    }

    pub fn interrupt_sink_ids(&self, device: DeviceId) -> Option<Vec<u32>> {
        self.lock()
            .interrupts
            .interrupt_sink_ids(device)
            .map(<[u32]>::to_vec)
    }

    pub fn interrupt_lines(&self) -> InterruptLines {
        self.lock().interrupts.lines()
    }

    pub fn snapshot(&self) -> BusSnapshot {
        let state = self.lock();
        BusSnapshot {
            addresses: state.addresses.snapshot(),
            interrupt_routes: state.interrupts.routes(),
        }
    }

    /// Installs pinned addresses and interrupt wiring from `snapshot` and schedules a scan to
    /// apply them.
    pub fn restore(&self, snapshot: &BusSnapshot) -> BusResult<()> {
        let mut state = self.lock();
        state.addresses.restore(&snapshot.addresses)?;
        state.interrupts.restore_routes(&snapshot.interrupt_routes);
        state.needs_validation = true;
        let next = state.tick + 1;
        state.schedule_at(next);
        debug!(
            bus = self.id,
            routes = snapshot.interrupt_routes.len(),
            "restored bus snapshot"
        );
        Ok(())
    }
}

impl std::fmt::Debug for BusController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusController")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
