use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;
use vbus_types::DeviceId;

use crate::device::BusDevice;

/// A node of the bus topology graph (a cable, a connector block, a device housing).
pub trait BusElement: Send + Sync {
    fn as_connector(&self) -> Option<&dyn BusConnector> {
        None
    }

    fn as_segment(&self) -> Option<&dyn BusSegment> {
        None
    }
}

/// An element that links to neighboring elements.
pub trait BusConnector {
    /// Appends the directly connected elements to `out`.
    ///
    /// Returns `false` if the neighbors cannot be determined right now (for example, a neighbor is
    /// not loaded). That means "retry later", never "no neighbors".
    fn get_connected(&self, out: &mut Vec<Arc<dyn BusElement>>) -> bool;
}

/// An element that carries devices.
pub trait BusSegment {
    /// Appends the devices on this segment to `out`. `false` has the same meaning as in
    /// [`BusConnector::get_connected`].
    fn get_devices(&self, out: &mut Vec<Arc<dyn BusDevice>>) -> bool;
}

/// A scan could not enumerate part of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanFailure {
    pub visited: usize,
}

fn element_key(element: &Arc<dyn BusElement>) -> *const () {
    Arc::as_ptr(element) as *const ()
}

/// Walks the graph reachable from `roots` and returns every device found, in discovery order.
///
/// Elements are visited once each (by identity). Devices are deduplicated by persistent id; if two
/// distinct instances claim the same id, the first one found wins.
pub(crate) fn discover(
    roots: &[Arc<dyn BusElement>],
) -> Result<Vec<Arc<dyn BusDevice>>, ScanFailure> {
    let mut visited: HashSet<*const ()> = HashSet::new();
    let mut queue: VecDeque<Arc<dyn BusElement>> = VecDeque::new();
    for root in roots {
        if visited.insert(element_key(root)) {
            queue.push_back(root.clone());
        }
    }

    let mut found: Vec<Arc<dyn BusDevice>> = Vec::new();
    let mut by_id: HashMap<DeviceId, usize> = HashMap::new();
    let mut neighbors = Vec::new();
    let mut devices = Vec::new();

    while let Some(element) = queue.pop_front() {
        if let Some(segment) = element.as_segment() {
            devices.clear();
            if !segment.get_devices(&mut devices) {
                return Err(ScanFailure {
                    visited: visited.len(),
                });
            }
            for device in devices.drain(..) {
                let id = device.persistent_id();
                match by_id.get(&id) {
                    Some(&idx) => {
                        if !Arc::ptr_eq(&found[idx], &device) {
                            warn!(%id, "two devices share a persistent id; ignoring the later one");
                        }
                    }
                    None => {
                        by_id.insert(id, found.len());
                        found.push(device);
                    }
                }
            }
        }

        if let Some(connector) = element.as_connector() {
            neighbors.clear();
            if !connector.get_connected(&mut neighbors) {
                return Err(ScanFailure {
                    visited: visited.len(),
                });
            }
            for neighbor in neighbors.drain(..) {
                if visited.insert(element_key(&neighbor)) {
                    queue.push_back(neighbor);
                }
            }
        }
    }

    Ok(found)
}
