use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, warn};
use vbus::{
    AddressBlock, Addressable, AsyncTickable, BusController, BusDevice, BusHandle, BusResult,
    DeviceId, DeviceInfo, DeviceType, InterruptSource,
};

use crate::common::{lock, DeviceCore, Placement};

/// Data register: reads pop one received byte (0 when empty), writes transmit one byte.
pub const REG_DATA: u64 = 0;
/// Status register, read-only. See [`STATUS_RX_READY`] and [`STATUS_TX_READY`].
pub const REG_STATUS: u64 = 1;
pub const REGISTER_COUNT: u64 = 2;

pub const STATUS_RX_READY: u64 = 1 << 0;
pub const STATUS_TX_READY: u64 = 1 << 1;

/// Interrupt line raised when received data becomes available.
pub const IRQ_RX: usize = 0;

#[derive(Debug, Default)]
struct Fifo {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    /// Set once the rx interrupt has been raised for the data currently queued.
    rx_signaled: bool,
}

/// A byte-oriented console.
///
/// The host feeds input with [`SerialConsole::push_input`] and collects output with
/// [`SerialConsole::take_output`]. Pending input raises the `rx` interrupt on the next
/// `update_async`, once per batch: reading the FIFO empty re-arms it.
#[derive(Debug)]
pub struct SerialConsole {
    core: DeviceCore,
    fifo: Mutex<Fifo>,
    placement: Placement,
}

impl SerialConsole {
    pub fn new() -> Self {
        Self::with_core(DeviceCore::new(DeviceType::Serial, "console"))
    }

    pub fn with_id(id: DeviceId) -> Self {
        Self::with_core(DeviceCore::with_id(id, DeviceType::Serial, "console"))
    }

    fn with_core(core: DeviceCore) -> Self {
        Self {
            core,
            fifo: Mutex::new(Fifo::default()),
            placement: Placement::default(),
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.placement.offset = Some(offset);
        self
    }

    pub fn id(&self) -> DeviceId {
        self.core.id()
    }

    pub fn push_input(&self, bytes: &[u8]) {
        lock(&self.fifo).rx.extend(bytes.iter().copied());
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.fifo).tx)
    }

    pub fn pending_input(&self) -> usize {
        lock(&self.fifo).rx.len()
    }
}

impl Default for SerialConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Addressable for SerialConsole {
    fn preferred_address_block(&self, _configuration: usize, memory: AddressBlock) -> AddressBlock {
        self.placement.preferred(memory, REGISTER_COUNT)
    }

    fn read(&self, address: u64) -> BusResult<u64> {
        let mut fifo = lock(&self.fifo);
        match address {
            REG_DATA => {
                let byte = fifo.rx.pop_front().unwrap_or(0);
                if fifo.rx.is_empty() {
                    fifo.rx_signaled = false;
                }
                Ok(u64::from(byte))
            }
            REG_STATUS => {
                let mut status = STATUS_TX_READY;
                if !fifo.rx.is_empty() {
                    status |= STATUS_RX_READY;
                }
                Ok(status)
            }
            _ => Err(vbus::BusError::AddressOutOfRange {
                address,
                limit: REGISTER_COUNT,
            }),
        }
    }

    fn write(&self, address: u64, value: u64) -> BusResult<()> {
        match address {
            REG_DATA => {
                lock(&self.fifo).tx.push(value as u8);
                Ok(())
            }
            REG_STATUS => Ok(()),
            _ => Err(vbus::BusError::AddressOutOfRange {
                address,
                limit: REGISTER_COUNT,
            }),
        }
    }
}

impl InterruptSource for SerialConsole {
    fn emitted_interrupts(&self) -> usize {
        1
    }

    fn emitted_interrupt_name(&self, index: usize) -> Option<&str> {
        (index == IRQ_RX).then_some("rx")
    }
}

impl AsyncTickable for SerialConsole {
    fn update_async(&self, bus: &BusController) {
        let pending = {
            let mut fifo = lock(&self.fifo);
            if fifo.rx.is_empty() || fifo.rx_signaled {
                return;
            }
            fifo.rx_signaled = true;
            fifo.rx.len()
        };
        debug!(device = %self.core.id(), pending, "raising rx interrupt");
        if let Err(err) = bus.interrupt(self.core.id(), IRQ_RX, pending as u64) {
            warn!(device = %self.core.id(), %err, "rx interrupt failed");
            lock(&self.fifo).rx_signaled = false;
        }
    }
}

impl BusDevice for SerialConsole {
    fn persistent_id(&self) -> DeviceId {
        self.core.id()
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(self.core.info().clone())
    }

    fn set_bus_controller(&self, controller: Option<BusHandle>) {
        self.core.attach(controller);
    }

    fn as_addressable(&self) -> Option<&dyn Addressable> {
        Some(self)
    }

    fn as_interrupt_source(&self) -> Option<&dyn InterruptSource> {
        Some(self)
    }

    fn as_async_tickable(&self) -> Option<&dyn AsyncTickable> {
        Some(self)
    }
}
