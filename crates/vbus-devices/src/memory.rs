use std::sync::Mutex;

use tracing::trace;
use vbus::{
    AddressBlock, AddressHint, Addressable, BusDevice, BusError, BusHandle, BusResult, DeviceId,
    DeviceInfo, DeviceType,
};

use crate::common::{lock, DeviceCore, Placement};

fn out_of_range(address: u64, len: usize) -> BusError {
    BusError::AddressOutOfRange {
        address,
        limit: len as u64,
    }
}

/// Word-addressed read/write memory.
#[derive(Debug)]
pub struct Ram {
    core: DeviceCore,
    words: Mutex<Vec<u64>>,
    placement: Placement,
}

impl Ram {
    pub fn new(len: usize) -> Self {
        Self::with_core(DeviceCore::new(DeviceType::Memory, "ram"), len)
    }

    pub fn with_id(id: DeviceId, len: usize) -> Self {
        Self::with_core(DeviceCore::with_id(id, DeviceType::Memory, "ram"), len)
    }

    fn with_core(core: DeviceCore, len: usize) -> Self {
        Self {
            core,
            words: Mutex::new(vec![0; len]),
            placement: Placement::default(),
        }
    }

    /// Asks for a fixed base address. The allocator still moves the block if it is taken.
    pub fn at(mut self, offset: u64) -> Self {
        self.placement.offset = Some(offset);
        self
    }

    pub fn with_sort_hint(mut self, hint: i32) -> Self {
        self.placement.sort_hint = Some(hint);
        self
    }

    /// Accepts a smaller window, down to `len` words, when the full size does not fit.
    pub fn shrinkable_to(mut self, len: u64) -> Self {
        self.placement.minimum_len = Some(len);
        self
    }

    pub fn id(&self) -> DeviceId {
        self.core.id()
    }

    pub fn len(&self) -> usize {
        lock(&self.words).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `data` in starting at word `offset`, truncating at the end of the memory.
    pub fn load(&self, offset: usize, data: &[u64]) {
        let mut words = lock(&self.words);
        let start = offset.min(words.len());
        let end = offset.saturating_add(data.len()).min(words.len());
        words[start..end].copy_from_slice(&data[..end - start]);
    }

    pub fn words(&self) -> Vec<u64> {
        lock(&self.words).clone()
    }
}

impl Addressable for Ram {
    fn preferred_address_block(&self, _configuration: usize, memory: AddressBlock) -> AddressBlock {
        self.placement.preferred(memory, self.len() as u64)
    }

    fn minimum_length(&self, preferred: &AddressBlock) -> u64 {
        self.placement.minimum_len.unwrap_or(preferred.length)
    }

    fn read(&self, address: u64) -> BusResult<u64> {
        let words = lock(&self.words);
        usize::try_from(address)
            .ok()
            .and_then(|idx| words.get(idx).copied())
            .ok_or_else(|| out_of_range(address, words.len()))
    }

    fn write(&self, address: u64, value: u64) -> BusResult<()> {
        let mut words = lock(&self.words);
        let len = words.len();
        let slot = usize::try_from(address)
            .ok()
            .and_then(|idx| words.get_mut(idx))
            .ok_or_else(|| out_of_range(address, len))?;
        *slot = value;
        Ok(())
    }
}

impl AddressHint for Ram {
    fn sort_hint(&self) -> i32 {
        self.placement.sort_hint.unwrap_or_default()
    }
}

impl BusDevice for Ram {
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

    fn as_address_hint(&self) -> Option<&dyn AddressHint> {
        self.placement
            .sort_hint
            .is_some()
            .then_some(self as &dyn AddressHint)
    }
}

/// Read-only memory. Writes are accepted and discarded.
///
/// ROMs are placed ahead of unhinted devices by default (hint `-1`) so boot code lands where the
/// processor expects it.
#[derive(Debug)]
pub struct Rom {
    core: DeviceCore,
    words: Vec<u64>,
    placement: Placement,
}

impl Rom {
    pub fn new(words: Vec<u64>) -> Self {
        Self::with_core(DeviceCore::new(DeviceType::Rom, "rom"), words)
    }

    pub fn with_id(id: DeviceId, words: Vec<u64>) -> Self {
        Self::with_core(DeviceCore::with_id(id, DeviceType::Rom, "rom"), words)
    }

    fn with_core(core: DeviceCore, words: Vec<u64>) -> Self {
        Self {
            core,
            words,
            placement: Placement {
                sort_hint: Some(-1),
                ..Placement::default()
            },
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.placement.offset = Some(offset);
        self
    }

    pub fn with_sort_hint(mut self, hint: i32) -> Self {
        self.placement.sort_hint = Some(hint);
        self
    }

    pub fn id(&self) -> DeviceId {
        self.core.id()
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }
}

impl Addressable for Rom {
    fn preferred_address_block(&self, _configuration: usize, memory: AddressBlock) -> AddressBlock {
        self.placement.preferred(memory, self.words.len() as u64)
    }

    fn read(&self, address: u64) -> BusResult<u64> {
        usize::try_from(address)
            .ok()
            .and_then(|idx| self.words.get(idx).copied())
            .ok_or_else(|| out_of_range(address, self.words.len()))
    }

    fn write(&self, address: u64, value: u64) -> BusResult<()> {
        trace!(device = %self.core.id(), address, value, "ignoring write to rom");
        Ok(())
    }
}

impl AddressHint for Rom {
    fn sort_hint(&self) -> i32 {
        self.placement.sort_hint.unwrap_or_default()
    }
}

impl BusDevice for Rom {
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

    fn as_address_hint(&self) -> Option<&dyn AddressHint> {
        self.placement
            .sort_hint
            .is_some()
            .then_some(self as &dyn AddressHint)
    }
}
