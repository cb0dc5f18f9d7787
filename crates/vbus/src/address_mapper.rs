use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use vbus_types::snapshot::{AddressAssignment, AddressMapSnapshot};
use vbus_types::{AddressBlock, AddressRangeSet, DeviceId};

use crate::config::BusControllerConfig;
use crate::device::{BusDevice, DeviceRef};
use crate::error::{BusError, BusResult};
use crate::subsystem::Subsystem;

#[derive(Debug, Clone)]
struct MappedRange {
    block: AddressBlock,
    device: DeviceRef,
}

impl MappedRange {
    fn contains(&self, address: u64) -> bool {
        self.block.contains(address)
    }
}

#[derive(Debug, Clone, Default)]
struct Configuration {
    /// Sorted by offset, never overlapping.
    ranges: Vec<MappedRange>,
    assignments: HashMap<DeviceId, AddressBlock>,
    /// Manual assignments that survive reallocation.
    pinned: HashMap<DeviceId, AddressBlock>,
    unplaced: Vec<DeviceId>,
}

impl Configuration {
    fn is_legal(&self) -> bool {
        self.unplaced.is_empty()
    }

    fn find_range_index(&self, address: u64) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.block.offset <= address);
        if idx == 0 {
            return None;
        }
        let cand = idx - 1;
        self.ranges
            .get(cand)
            .is_some_and(|r| r.contains(address))
            .then_some(cand)
    }

    fn insert(&mut self, device: DeviceRef, block: AddressBlock) {
        let idx = self
            .ranges
            .partition_point(|r| r.block.offset < block.offset);
        debug_assert!(
            idx == 0 || !self.ranges[idx - 1].block.overlaps(&block),
            "overlapping address blocks: new={block} prev={}",
            self.ranges[idx - 1].block
        );
        debug_assert!(
            self.ranges.get(idx).map_or(true, |next| !next.block.overlaps(&block)),
            "overlapping address blocks: new={block} next={}",
            self.ranges[idx].block
        );
        self.assignments.insert(device.id(), block);
        self.ranges.insert(idx, MappedRange { block, device });
    }

    fn remove(&mut self, id: DeviceId) {
        self.assignments.remove(&id);
        self.ranges.retain(|r| r.device.id() != id);
        self.unplaced.retain(|other| *other != id);
    }

    /// First block (other than `except`'s own) overlapping `block`.
    fn conflict(&self, block: &AddressBlock, except: DeviceId) -> Option<AddressBlock> {
        self.ranges
            .iter()
            .find(|r| r.device.id() != except && r.block.overlaps(block))
            .map(|r| r.block)
    }
}

/// A resolved access: the device owning an address and the address local to its block.
pub struct MappedAccess {
    pub device: Arc<dyn BusDevice>,
    pub local: u64,
    pub word_mask: u64,
}

impl MappedAccess {
    pub fn read(&self) -> BusResult<u64> {
        let addressable = self.addressable()?;
        Ok(addressable.read(self.local)? & self.word_mask)
    }

    pub fn write(&self, value: u64) -> BusResult<()> {
        self.addressable()?.write(self.local, value)
    }

    fn addressable(&self) -> BusResult<&dyn crate::device::Addressable> {
        self.device
            .as_addressable()
            .ok_or(BusError::UnknownDevice(self.device.persistent_id()))
    }
}

/// Assigns address blocks to addressable devices and translates global addresses.
///
/// Several configurations can be kept (a boot layout next to a runtime layout, say); only the
/// active one is used for translation. Each configuration is recomputed from scratch on every
/// scan that changed the population, so placement is deterministic for a given population and
/// discovery order.
pub struct AddressMapper {
    word_size: u32,
    word_mask: u64,
    space_words: u64,
    reserved: Option<AddressBlock>,
    /// Addressable devices in discovery order.
    devices: Vec<DeviceRef>,
    configurations: Vec<Configuration>,
    active: usize,
    dirty: bool,
}

impl AddressMapper {
    pub fn new(config: &BusControllerConfig) -> Self {
        Self {
            word_size: config.word_bits,
            word_mask: config.word_mask(),
            space_words: config.address_space_words(),
            reserved: config.serial_window(),
            devices: Vec::new(),
            configurations: vec![Configuration::default(); config.configurations],
            active: 0,
            dirty: true,
        }
    }

    /// Data bus width in bits.
    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    pub fn word_mask(&self) -> u64 {
        self.word_mask
    }

    pub fn address_space_words(&self) -> u64 {
        self.space_words
    }

    pub fn configuration_count(&self) -> usize {
        self.configurations.len()
    }

    pub fn active_configuration(&self) -> usize {
        self.active
    }

    pub fn is_configuration_legal(&self, index: usize) -> Option<bool> {
        self.configurations.get(index).map(Configuration::is_legal)
    }

    pub fn set_active_configuration(&mut self, index: usize) -> BusResult<()> {
        let count = self.configurations.len();
        if index >= count {
            return Err(BusError::ConfigurationOutOfRange { index, count });
        }
        if !self.configurations[index].is_legal() {
            warn!(index, "activating an address configuration with unplaced devices");
        }
        self.active = index;
        Ok(())
    }

    /// Assigns `block` to `device` in the active configuration and pins it there.
    pub fn set_device_address(&mut self, device: DeviceId, block: AddressBlock) -> BusResult<()> {
        let handle = self
            .devices
            .iter()
            .find(|d| d.id() == device)
            .cloned()
            .ok_or(BusError::UnknownDevice(device))?;
        let block = block.with_word_size(self.word_size);
        if !block.fits_within(self.space_words) {
            return Err(BusError::AddressOutOfRange {
                address: block.offset,
                limit: self.space_words,
            });
        }
        if let Some(reserved) = self.reserved.filter(|r| r.overlaps(&block)) {
            return Err(BusError::AddressConflict {
                block,
                other: reserved,
            });
        }

        let cfg = &mut self.configurations[self.active];
        if let Some(other) = cfg.conflict(&block, device) {
            return Err(BusError::AddressConflict { block, other });
        }

        cfg.remove(device);
        cfg.pinned.insert(device, block);
        if !block.is_empty() {
            cfg.insert(handle, block);
        }
        debug!(%device, %block, configuration = self.active, "pinned device address");
        Ok(())
    }

    pub fn address_block(&self, device: DeviceId) -> Option<AddressBlock> {
        self.configurations[self.active]
            .assignments
            .get(&device)
            .copied()
    }

    pub fn address_block_in(&self, configuration: usize, device: DeviceId) -> Option<AddressBlock> {
        self.configurations
            .get(configuration)?
            .assignments
            .get(&device)
            .copied()
    }

    pub fn device_at(&self, address: u64) -> Option<DeviceId> {
        let cfg = &self.configurations[self.active];
        cfg.find_range_index(address)
            .map(|idx| cfg.ranges[idx].device.id())
    }

    /// Devices that did not get a block in the active configuration.
    pub fn unplaced_devices(&self) -> &[DeviceId] {
        &self.configurations[self.active].unplaced
    }

    /// Locates the device owning `address` in the active configuration.
    pub fn resolve(&self, address: u64) -> BusResult<MappedAccess> {
        if address >= self.space_words {
            return Err(BusError::AddressOutOfRange {
                address,
                limit: self.space_words,
            });
        }
        let cfg = &self.configurations[self.active];
        let range = cfg
            .find_range_index(address)
            .map(|idx| &cfg.ranges[idx])
            .ok_or(BusError::UnmappedAddress { address })?;
        let device = range
            .device
            .upgrade()
            .ok_or(BusError::UnmappedAddress { address })?;
        Ok(MappedAccess {
            device,
            local: address - range.block.offset,
            word_mask: self.word_mask,
        })
    }

    pub fn map_and_read(&self, address: u64) -> BusResult<u64> {
        self.resolve(address)?.read()
    }

    pub fn map_and_write(&self, address: u64, value: u64) -> BusResult<()> {
        self.check_value(value)?;
        self.resolve(address)?.write(value)
    }

    pub(crate) fn check_value(&self, value: u64) -> BusResult<()> {
        if value & !self.word_mask != 0 {
            return Err(BusError::ValueOutOfRange {
                value,
                mask: self.word_mask,
            });
        }
        Ok(())
    }

    /// Pinned assignments of every configuration.
    pub fn snapshot(&self) -> AddressMapSnapshot {
        let configurations = self
            .configurations
            .iter()
            .map(|cfg| {
                let mut entries: Vec<AddressAssignment> = cfg
                    .pinned
                    .iter()
                    .map(|(device, block)| AddressAssignment {
                        device: *device,
                        block: *block,
                    })
                    .collect();
                entries.sort_by_key(|entry| entry.device);
                entries
            })
            .collect();
        AddressMapSnapshot {
            active: self.active as u32,
            configurations,
        }
    }

    /// Replaces the pinned assignments. Takes effect on the next reallocation.
    pub fn restore(&mut self, snapshot: &AddressMapSnapshot) -> BusResult<()> {
        let count = self.configurations.len();
        let active = snapshot.active as usize;
        if active >= count {
            return Err(BusError::ConfigurationOutOfRange {
                index: active,
                count,
            });
        }
        if snapshot.configurations.len() > count {
            return Err(BusError::ConfigurationOutOfRange {
                index: snapshot.configurations.len() - 1,
                count,
            });
        }
        for (cfg, entries) in self.configurations.iter_mut().zip(
            snapshot
                .configurations
                .iter()
                .chain(std::iter::repeat(&Vec::new())),
        ) {
            cfg.pinned = entries
                .iter()
                .map(|entry| (entry.device, entry.block.with_word_size(self.word_size)))
                .collect();
        }
        self.active = active;
        self.dirty = true;
        Ok(())
    }

    fn reallocate(&mut self) {
        let order = self.allocation_order();
        let configurations = (0..self.configurations.len())
            .map(|index| self.allocate(index, &order))
            .collect();
        self.configurations = configurations;
        self.dirty = false;
    }

    /// Hinted devices first (stable by hint), then everyone else in discovery order.
    fn allocation_order(&self) -> Vec<(DeviceRef, Arc<dyn BusDevice>)> {
        let mut hinted = Vec::new();
        let mut plain = Vec::new();
        for handle in &self.devices {
            let Some(device) = handle.upgrade() else {
                continue;
            };
            match device.as_address_hint().map(|hint| hint.sort_hint()) {
                Some(hint) => hinted.push((hint, handle.clone(), device)),
                None => plain.push((handle.clone(), device)),
            }
        }
        hinted.sort_by_key(|(hint, _, _)| *hint);
        hinted
            .into_iter()
            .map(|(_, handle, device)| (handle, device))
            .chain(plain)
            .collect()
    }

    fn allocate(&self, index: usize, order: &[(DeviceRef, Arc<dyn BusDevice>)]) -> Configuration {
        let mut free = AddressRangeSet::with_range(0, self.space_words);
        if let Some(reserved) = self.reserved {
            free.remove(reserved.offset, reserved.end());
        }

        let mut cfg = Configuration {
            pinned: self.configurations[index].pinned.clone(),
            ..Default::default()
        };

        for (handle, _) in order {
            let Some(block) = cfg.pinned.get(&handle.id()).copied() else {
                continue;
            };
            if block.is_empty() {
                continue;
            }
            if block.fits_within(self.space_words) && free.contains_range(block.offset, block.end())
            {
                free.remove(block.offset, block.end());
                cfg.insert(handle.clone(), block);
            } else {
                warn!(device = %handle.id(), %block, configuration = index, "pinned address block no longer fits");
                cfg.unplaced.push(handle.id());
            }
        }

        let memory = AddressBlock::new(0, self.space_words, self.word_size);
        for (handle, device) in order {
            if cfg.pinned.contains_key(&handle.id()) {
                continue;
            }
            let Some(addressable) = device.as_addressable() else {
                continue;
            };
            let preferred = addressable
                .preferred_address_block(index, memory)
                .with_word_size(self.word_size);
            if preferred.is_empty() {
                continue;
            }
            let minimum = addressable.minimum_length(&preferred);
            match self.choose_block(&free, preferred, minimum) {
                Some(block) => {
                    debug!(device = %handle.id(), %block, configuration = index, "placed device");
                    free.remove(block.offset, block.end());
                    cfg.insert(handle.clone(), block);
                }
                None => {
                    warn!(device = %handle.id(), %preferred, configuration = index, "no free address space for device");
                    cfg.unplaced.push(handle.id());
                }
            }
        }

        cfg
    }

    /// Preferred block if free, else first fit at the preferred length, else first fit shrunk to
    /// the device's minimum length.
    fn choose_block(
        &self,
        free: &AddressRangeSet,
        preferred: AddressBlock,
        minimum: u64,
    ) -> Option<AddressBlock> {
        if preferred.fits_within(self.space_words)
            && free.contains_range(preferred.offset, preferred.end())
        {
            return Some(preferred);
        }
        if let Some(offset) = free.first_fit(preferred.length) {
            return Some(AddressBlock::new(offset, preferred.length, self.word_size));
        }
        let minimum = minimum.clamp(1, preferred.length);
        if minimum == preferred.length {
            return None;
        }
        free.first_range_at_least(minimum).map(|range| {
            AddressBlock::new(range.start, range.len().min(preferred.length), self.word_size)
        })
    }
}

impl Subsystem for AddressMapper {
    fn name(&self) -> &'static str {
        "address mapper"
    }

    fn add(&mut self, device: &Arc<dyn BusDevice>) {
        if device.as_addressable().is_none() {
            return;
        }
        self.devices.push(DeviceRef::new(device));
        self.dirty = true;
    }

    fn remove(&mut self, id: DeviceId) {
        let before = self.devices.len();
        self.devices.retain(|d| d.id() != id);
        if self.devices.len() == before {
            return;
        }
        for cfg in &mut self.configurations {
            cfg.remove(id);
        }
        self.dirty = true;
    }

    fn validate(&mut self) -> bool {
        if self.dirty {
            self.reallocate();
        }
        self.configurations[self.active].is_legal()
    }

    fn reset(&mut self) {}
}
