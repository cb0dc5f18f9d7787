use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use vbus::{BusConnector, BusDevice, BusElement, BusSegment, DeviceId};

use crate::common::lock;

/// A length of bus cable: a topology node that links to neighboring elements and carries the
/// devices plugged into it.
///
/// Links are weak, so two cables pointing at each other do not keep each other alive. A cable can
/// be marked unloaded to model a neighbor whose state is not available yet; scans that reach it
/// back off and retry.
#[derive(Default)]
pub struct Cable {
    links: Mutex<Vec<Weak<dyn BusElement>>>,
    devices: Mutex<Vec<Arc<dyn BusDevice>>>,
    unloaded: AtomicBool,
}

impl Cable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links `a` and `b` in both directions.
    pub fn connect(a: &Arc<Cable>, b: &Arc<Cable>) {
        let a_elem: Arc<dyn BusElement> = a.clone();
        let b_elem: Arc<dyn BusElement> = b.clone();
        a.link(&b_elem);
        b.link(&a_elem);
    }

    pub fn link(&self, other: &Arc<dyn BusElement>) {
        lock(&self.links).push(Arc::downgrade(other));
    }

    /// Drops every link to `other`. Returns `true` if there was one.
    pub fn unlink(&self, other: &Arc<dyn BusElement>) -> bool {
        let target = Arc::as_ptr(other) as *const ();
        let mut links = lock(&self.links);
        let before = links.len();
        links.retain(|link| link.as_ptr() as *const () != target);
        links.len() != before
    }

    pub fn plug(&self, device: Arc<dyn BusDevice>) {
        lock(&self.devices).push(device);
    }

    pub fn unplug(&self, id: DeviceId) -> Option<Arc<dyn BusDevice>> {
        let mut devices = lock(&self.devices);
        let idx = devices.iter().position(|d| d.persistent_id() == id)?;
        Some(devices.remove(idx))
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.unloaded.store(!loaded, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        !self.unloaded.load(Ordering::SeqCst)
    }
}

impl BusElement for Cable {
    fn as_connector(&self) -> Option<&dyn BusConnector> {
        Some(self)
    }

    fn as_segment(&self) -> Option<&dyn BusSegment> {
        Some(self)
    }
}

impl BusConnector for Cable {
    fn get_connected(&self, out: &mut Vec<Arc<dyn BusElement>>) -> bool {
        if !self.is_loaded() {
            return false;
        }
        let mut links = lock(&self.links);
        // Neighbors that were dropped are gone for good, not temporarily unknown.
        links.retain(|link| link.strong_count() > 0);
        out.extend(links.iter().filter_map(Weak::upgrade));
        true
    }
}

impl BusSegment for Cable {
    fn get_devices(&self, out: &mut Vec<Arc<dyn BusDevice>>) -> bool {
        if !self.is_loaded() {
            return false;
        }
        out.extend(lock(&self.devices).iter().cloned());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ram;

    #[test]
    fn links_are_weak_and_pruned() {
        let a = Cable::new();
        let b = Cable::new();
        Cable::connect(&a, &b);

        let mut out = Vec::new();
        assert!(a.get_connected(&mut out));
        assert_eq!(out.len(), 1);
        out.clear();

        drop(b);
        assert!(a.get_connected(&mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn unloaded_cable_reports_unknown() {
        let cable = Cable::new();
        cable.plug(Arc::new(Ram::new(1)));
        cable.set_loaded(false);

        let mut devices = Vec::new();
        assert!(!cable.get_devices(&mut devices));
        assert!(!cable.get_connected(&mut Vec::new()));

        cable.set_loaded(true);
        assert!(cable.get_devices(&mut devices));
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn unplug_and_unlink() {
        let a = Cable::new();
        let b = Cable::new();
        Cable::connect(&a, &b);
        let b_elem: Arc<dyn BusElement> = b.clone();
        assert!(a.unlink(&b_elem));
        assert!(!a.unlink(&b_elem));

        let ram = Arc::new(Ram::new(1));
        let id = ram.id();
        a.plug(ram);
        assert!(a.unplug(id).is_some());
        assert!(a.unplug(id).is_none());
    }
}
