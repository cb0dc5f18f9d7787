use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::trace;
use vbus::{
    AsyncTickable, BusController, BusDevice, BusHandle, BusResult, BusStateAware, DeviceId,
    DeviceInfo, DeviceType, InterruptSource,
};

use crate::common::{lock, DeviceCore};

/// One bus operation issued by a [`ScriptedCpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusOp {
    Read { address: u64 },
    Write { address: u64, value: u64 },
    /// Copies one word from `from` to `to`.
    Copy { from: u64, to: u64 },
    /// Raises one of the processor's own interrupt lines.
    Raise { line: usize, data: u64 },
}

/// Outcome of one [`BusOp`]. Reads and copies report the word read; other ops report 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub op: BusOp,
    pub result: BusResult<u64>,
}

/// Stand-in for a processor: runs a queue of bus operations, a few per `update_async`.
///
/// The processor only runs while the bus is online. Going offline halts it; queued operations
/// stay queued and resume once the bus is back.
#[derive(Debug)]
pub struct ScriptedCpu {
    core: DeviceCore,
    ops_per_update: usize,
    interrupt_lines: usize,
    running: AtomicBool,
    queue: Mutex<VecDeque<BusOp>>,
    results: Mutex<Vec<OpResult>>,
}

impl ScriptedCpu {
    pub fn new(ops_per_update: usize) -> Self {
        Self::with_core(DeviceCore::new(DeviceType::Processor, "cpu"), ops_per_update)
    }

    pub fn with_id(id: DeviceId, ops_per_update: usize) -> Self {
        Self::with_core(
            DeviceCore::with_id(id, DeviceType::Processor, "cpu"),
            ops_per_update,
        )
    }

    fn with_core(core: DeviceCore, ops_per_update: usize) -> Self {
        Self {
            core,
            ops_per_update: ops_per_update.max(1),
            interrupt_lines: 0,
            running: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Gives the processor `lines` interrupt lines it can raise with [`BusOp::Raise`].
    pub fn with_interrupt_lines(mut self, lines: usize) -> Self {
        self.interrupt_lines = lines;
        self
    }

    pub fn id(&self) -> DeviceId {
        self.core.id()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn push<I>(&self, ops: I)
    where
        I: IntoIterator<Item = BusOp>,
    {
        lock(&self.queue).extend(ops);
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn take_results(&self) -> Vec<OpResult> {
        std::mem::take(&mut *lock(&self.results))
    }

    fn execute(&self, bus: &BusController, op: BusOp) -> BusResult<u64> {
        match op {
            BusOp::Read { address } => bus.map_and_read(address),
            BusOp::Write { address, value } => bus.map_and_write(address, value).map(|()| 0),
            BusOp::Copy { from, to } => {
                let value = bus.map_and_read(from)?;
                bus.map_and_write(to, value)?;
                Ok(value)
            }
            BusOp::Raise { line, data } => bus.interrupt(self.core.id(), line, data).map(|()| 0),
        }
    }
}

impl AsyncTickable for ScriptedCpu {
    fn update_async(&self, bus: &BusController) {
        if !self.is_running() {
            return;
        }
        for _ in 0..self.ops_per_update {
            // The queue lock is not held across the access; devices may call back into us.
            let Some(op) = lock(&self.queue).pop_front() else {
                break;
            };
            let result = self.execute(bus, op);
            trace!(device = %self.core.id(), ?op, ?result, "executed bus op");
            lock(&self.results).push(OpResult { op, result });
        }
    }
}

impl BusStateAware for ScriptedCpu {
    fn handle_bus_online(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn handle_bus_offline(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl InterruptSource for ScriptedCpu {
    fn emitted_interrupts(&self) -> usize {
        self.interrupt_lines
    }
}

impl BusDevice for ScriptedCpu {
    fn persistent_id(&self) -> DeviceId {
        self.core.id()
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(self.core.info().clone())
    }

    fn set_bus_controller(&self, controller: Option<BusHandle>) {
        if controller.is_none() {
            self.running.store(false, Ordering::SeqCst);
        }
        self.core.attach(controller);
    }

    fn as_async_tickable(&self) -> Option<&dyn AsyncTickable> {
        Some(self)
    }

    fn as_bus_state_aware(&self) -> Option<&dyn BusStateAware> {
        Some(self)
    }

    fn as_interrupt_source(&self) -> Option<&dyn InterruptSource> {
        (self.interrupt_lines > 0).then_some(self as &dyn InterruptSource)
    }
}
