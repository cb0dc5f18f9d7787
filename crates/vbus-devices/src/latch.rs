use std::sync::Mutex;

use vbus::{BusDevice, BusHandle, DeviceId, DeviceInfo, DeviceType, InterruptSink};

use crate::common::{lock, DeviceCore};

/// One delivered interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latched {
    pub line: usize,
    pub data: u64,
}

/// An interrupt sink with named input lines that latches every delivery until the host drains it.
#[derive(Debug)]
pub struct InterruptLatch {
    core: DeviceCore,
    lines: Vec<String>,
    latched: Mutex<Vec<Latched>>,
}

impl InterruptLatch {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_core(DeviceCore::new(DeviceType::InterruptController, "latch"), lines)
    }

    pub fn with_id<I, S>(id: DeviceId, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_core(
            DeviceCore::with_id(id, DeviceType::InterruptController, "latch"),
            lines,
        )
    }

    fn with_core<I, S>(core: DeviceCore, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            core,
            lines: lines.into_iter().map(Into::into).collect(),
            latched: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.core.id()
    }

    pub fn line_index(&self, name: &str) -> Option<usize> {
        self.lines.iter().position(|line| line == name)
    }

    pub fn pending(&self) -> Vec<Latched> {
        lock(&self.latched).clone()
    }

    pub fn take(&self) -> Vec<Latched> {
        std::mem::take(&mut *lock(&self.latched))
    }

    pub fn count(&self, line: usize) -> usize {
        lock(&self.latched)
            .iter()
            .filter(|latched| latched.line == line)
            .count()
    }
}

impl InterruptSink for InterruptLatch {
    fn accepted_interrupts(&self) -> usize {
        self.lines.len()
    }

    fn accepted_interrupt_name(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    fn interrupt(&self, index: usize, data: u64) {
        lock(&self.latched).push(Latched { line: index, data });
    }
}

impl BusDevice for InterruptLatch {
    fn persistent_id(&self) -> DeviceId {
        self.core.id()
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(self.core.info().clone())
    }

    fn set_bus_controller(&self, controller: Option<BusHandle>) {
        self.core.attach(controller);
    }

    fn as_interrupt_sink(&self) -> Option<&dyn InterruptSink> {
        Some(self)
    }
}
