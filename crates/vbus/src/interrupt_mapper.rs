use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, trace, warn};
use vbus_types::snapshot::InterruptRoute;
use vbus_types::{DeviceId, InterruptList};

use crate::device::{BusDevice, DeviceRef};
use crate::error::{BusError, BusResult};
use crate::subsystem::Subsystem;

#[derive(Debug, Clone)]
struct Endpoint {
    device: DeviceRef,
    /// Global id of each local line, indexed by local index.
    ids: Vec<u32>,
    wanted: usize,
}

/// One allocated interrupt line, as listed for hosts wiring the bus up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptLine {
    pub device: DeviceId,
    pub index: usize,
    pub id: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptLines {
    pub sources: Vec<InterruptLine>,
    pub sinks: Vec<InterruptLine>,
}

/// A resolved interrupt, ready to hand to its sink.
pub struct InterruptDelivery {
    pub sink: Arc<dyn BusDevice>,
    pub index: usize,
}

impl InterruptDelivery {
    pub fn deliver(&self, data: u64) {
        if let Some(sink) = self.sink.as_interrupt_sink() {
            sink.interrupt(self.index, data);
        }
    }
}

/// Allocates global interrupt ids to source and sink lines and routes interrupts between them.
///
/// Source and sink ids live in separate spaces. The wiring table maps a source id to at most one
/// sink id; several sources may share a sink.
pub struct InterruptMapper {
    sources: HashMap<DeviceId, Endpoint>,
    sinks: HashMap<DeviceId, Endpoint>,
    source_lookup: BTreeMap<u32, (DeviceId, usize)>,
    sink_lookup: BTreeMap<u32, (DeviceId, usize)>,
    routes: BTreeMap<u32, u32>,
    max_ids: u32,
}

/// Claims `count` ids below `limit`, or none when that many are not free.
fn allocate(
    lookup: &mut BTreeMap<u32, (DeviceId, usize)>,
    device: DeviceId,
    count: usize,
    limit: u32,
) -> Vec<u32> {
    let free = usize::try_from(limit)
        .unwrap_or(usize::MAX)
        .saturating_sub(lookup.range(..limit).count());
    if count > free {
        warn!(%device, count, free, "not enough interrupt ids below the limit");
        return Vec::new();
    }
    let ids = InterruptList::from_occupied(lookup.keys().copied()).take(count);
    for (index, id) in ids.iter().enumerate() {
        lookup.insert(*id, (device, index));
    }
    ids
}

fn lines<F>(endpoints: &HashMap<DeviceId, Endpoint>, name: F) -> Vec<InterruptLine>
where
    F: Fn(&dyn BusDevice, usize) -> Option<String>,
{
    let name = &name;
    let mut out: Vec<InterruptLine> = endpoints
        .values()
        .flat_map(|endpoint| {
            let device = endpoint.device.upgrade();
            endpoint.ids.iter().enumerate().map(move |(index, id)| InterruptLine {
                device: endpoint.device.id(),
                index,
                id: *id,
                name: device.as_deref().and_then(|dev| name(dev, index)),
            })
        })
        .collect();
    out.sort_by_key(|line| line.id);
    out
}

impl InterruptMapper {
    pub fn new(max_ids: u32) -> Self {
        Self {
            sources: HashMap::new(),
            sinks: HashMap::new(),
            source_lookup: BTreeMap::new(),
            sink_lookup: BTreeMap::new(),
            routes: BTreeMap::new(),
            max_ids,
        }
    }

    pub fn interrupt_source_ids(&self, device: DeviceId) -> Option<&[u32]> {
        self.sources.get(&device).map(|e| e.ids.as_slice())
    }

    pub fn interrupt_sink_ids(&self, device: DeviceId) -> Option<&[u32]> {
        self.sinks.get(&device).map(|e| e.ids.as_slice())
    }

    /// Wires source id `source` to sink id `sink`, replacing any previous entry for `source`.
    pub fn set_interrupt_mapping(&mut self, source: u32, sink: u32) -> BusResult<()> {
        if !self.source_lookup.contains_key(&source) {
            return Err(BusError::UnknownInterrupt(source));
        }
        if !self.sink_lookup.contains_key(&sink) {
            return Err(BusError::UnknownInterrupt(sink));
        }
        if let Some(previous) = self.routes.insert(source, sink) {
            debug!(source, previous, sink, "rewired interrupt");
        }
        Ok(())
    }

    pub fn clear_interrupt_mapping(&mut self, source: u32) -> Option<u32> {
        self.routes.remove(&source)
    }

    pub fn interrupt_mapping(&self, source: u32) -> Option<u32> {
        self.routes.get(&source).copied()
    }

    pub fn lines(&self) -> InterruptLines {
        InterruptLines {
            sources: lines(&self.sources, |dev, index| {
                dev.as_interrupt_source()
                    .and_then(|s| s.emitted_interrupt_name(index))
                    .map(str::to_owned)
            }),
            sinks: lines(&self.sinks, |dev, index| {
                dev.as_interrupt_sink()
                    .and_then(|s| s.accepted_interrupt_name(index))
                    .map(str::to_owned)
            }),
        }
    }

    /// Follows line `index` of `source` through the wiring table.
    ///
    /// Returns `Ok(None)` when the line is not wired or the sink has gone away.
    pub fn resolve(&self, source: DeviceId, index: usize) -> BusResult<Option<InterruptDelivery>> {
        let endpoint = self
            .sources
            .get(&source)
            .ok_or(BusError::UnknownDevice(source))?;
        let id = *endpoint.ids.get(index).ok_or(BusError::InterruptOutOfRange {
            index,
            count: endpoint.ids.len(),
        })?;

        let Some(sink_id) = self.routes.get(&id).copied() else {
            trace!(%source, index, id, "dropping unwired interrupt");
            return Ok(None);
        };
        let delivery = self.sink_lookup.get(&sink_id).and_then(|(device, local)| {
            let sink = self.sinks.get(device)?.device.upgrade()?;
            Some(InterruptDelivery {
                sink,
                index: *local,
            })
        });
        if delivery.is_none() {
            trace!(%source, index, id, sink_id, "dropping interrupt wired to a missing sink");
        }
        Ok(delivery)
    }

    pub fn interrupt(&self, source: DeviceId, index: usize, data: u64) -> BusResult<()> {
        if let Some(delivery) = self.resolve(source, index)? {
            delivery.deliver(data);
        }
        Ok(())
    }

    pub fn routes(&self) -> Vec<InterruptRoute> {
        self.routes
            .iter()
            .map(|(&source, &sink)| InterruptRoute { source, sink })
            .collect()
    }

    /// Replaces the wiring table wholesale. Entries may name ids not allocated yet; they take
    /// effect once a device claims them.
    pub fn restore_routes(&mut self, routes: &[InterruptRoute]) {
        self.routes = routes.iter().map(|r| (r.source, r.sink)).collect();
    }
}

impl Subsystem for InterruptMapper {
    fn name(&self) -> &'static str {
        "interrupt mapper"
    }

    fn add(&mut self, device: &Arc<dyn BusDevice>) {
        let id = device.persistent_id();
        if let Some(source) = device.as_interrupt_source() {
            let wanted = source.emitted_interrupts();
            let ids = allocate(&mut self.source_lookup, id, wanted, self.max_ids);
            debug!(%id, ?ids, "allocated interrupt source ids");
            self.sources.insert(
                id,
                Endpoint {
                    device: DeviceRef::new(device),
                    ids,
                    wanted,
                },
            );
        }
        if let Some(sink) = device.as_interrupt_sink() {
            let wanted = sink.accepted_interrupts();
            let ids = allocate(&mut self.sink_lookup, id, wanted, self.max_ids);
            debug!(%id, ?ids, "allocated interrupt sink ids");
            self.sinks.insert(
                id,
                Endpoint {
                    device: DeviceRef::new(device),
                    ids,
                    wanted,
                },
            );
        }
    }

    fn remove(&mut self, id: DeviceId) {
        if let Some(endpoint) = self.sources.remove(&id) {
            for source in &endpoint.ids {
                self.source_lookup.remove(source);
                self.routes.remove(source);
            }
        }
        if let Some(endpoint) = self.sinks.remove(&id) {
            for sink in &endpoint.ids {
                self.sink_lookup.remove(sink);
            }
            let before = self.routes.len();
            self.routes.retain(|_, sink| !endpoint.ids.contains(sink));
            if self.routes.len() != before {
                debug!(%id, dropped = before - self.routes.len(), "dropped wiring to departed sink");
            }
        }
    }

    fn validate(&mut self) -> bool {
        let mut ok = true;
        for endpoint in self.sources.values().chain(self.sinks.values()) {
            if endpoint.ids.len() != endpoint.wanted {
                warn!(device = %endpoint.device.id(), "interrupt id space exhausted");
                ok = false;
            }
        }
        let highest = [
            self.source_lookup.keys().next_back(),
            self.sink_lookup.keys().next_back(),
        ];
        if let Some(&id) = highest.into_iter().flatten().find(|id| **id >= self.max_ids) {
            warn!(id, max = self.max_ids, "interrupt id above configured limit");
            ok = false;
        }
        ok
    }

    fn reset(&mut self) {}
}
