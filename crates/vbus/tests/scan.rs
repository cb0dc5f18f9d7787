mod common;

use common::{dev, elem, same, small_bus, Event, Memory, Node};
use vbus::{ControllerState, ScanOutcome};

#[test]
fn scan_registers_and_drops_devices() {
    let bus = small_bus(16);
    let mem = Memory::new(1, 0x10).shared();
    let node = Node::with_devices(&[dev(&mem)]);
    bus.connect(elem(&node));

    assert_eq!(bus.tick(), ScanOutcome::Applied);
    assert!(bus.is_online());
    assert!(same(&bus.device(mem.id()).unwrap(), &mem));

    node.unplug(mem.id());
    bus.schedule_scan();
    assert_eq!(bus.tick(), ScanOutcome::Applied);
    assert!(bus.device(mem.id()).is_none());
    assert!(bus.devices().is_empty());
    assert!(bus.is_online());
}

#[test]
fn lifecycle_callbacks_follow_state_transitions() {
    let bus = small_bus(16);
    let first = Memory::new(1, 0x10).shared();
    let node = Node::with_devices(&[dev(&first)]);
    bus.connect(elem(&node));
    bus.tick();

    assert_eq!(
        first.events(),
        vec![Event::Attached(bus.bus_id()), Event::Online, Event::Changed]
    );

    // A population change while online cycles the bus through offline.
    let second = Memory::new(2, 0x10).shared();
    node.plug(dev(&second));
    bus.schedule_scan();
    assert_eq!(bus.tick(), ScanOutcome::Applied);
    assert_eq!(
        first.events()[3..],
        [Event::Offline, Event::Online, Event::Changed]
    );
    assert_eq!(
        second.events(),
        vec![Event::Attached(bus.bus_id()), Event::Online, Event::Changed]
    );

    node.unplug(second.id());
    bus.schedule_scan();
    bus.tick();
    assert_eq!(
        second.events()[3..],
        [Event::Offline, Event::Detached]
    );
}

#[test]
fn unchanged_rescan_does_not_cycle_the_bus() {
    let bus = small_bus(16);
    let mem = Memory::new(1, 0x10).shared();
    bus.connect(elem(&Node::with_devices(&[dev(&mem)])));
    bus.tick();
    let seen = mem.events().len();

    bus.schedule_scan();
    assert_eq!(bus.tick(), ScanOutcome::Unchanged);
    assert_eq!(mem.events().len(), seen);
}

#[test]
fn unreachable_neighbor_retries_without_touching_the_registry() {
    let bus = small_bus(16);
    let mem = Memory::new(1, 0x10).shared();
    let late = Memory::new(2, 0x10).shared();
    let root = Node::with_devices(&[dev(&mem)]);
    let far = Node::with_devices(&[dev(&late)]);
    bus.connect(elem(&root));
    bus.tick();
    assert_eq!(bus.devices(), vec![mem.id()]);

    root.link(elem(&far));
    far.set_unreachable(true);
    bus.schedule_scan();
    assert_eq!(bus.tick(), ScanOutcome::Retry);
    assert_eq!(bus.devices(), vec![mem.id()]);
    assert!(bus.is_online());

    // The retry waits out the configured delay instead of spinning.
    let delay = bus.config().scan_retry_delay_ticks;
    for _ in 1..delay {
        assert_eq!(bus.tick(), ScanOutcome::Idle);
    }
    far.set_unreachable(false);
    assert_eq!(bus.tick(), ScanOutcome::Applied);
    assert_eq!(bus.devices().len(), 2);
}

#[test]
fn explicit_schedule_supersedes_a_pending_retry() {
    let bus = small_bus(16);
    let root = Node::new();
    bus.connect(elem(&root));
    root.set_unreachable(true);
    assert_eq!(bus.tick(), ScanOutcome::Retry);
    assert_eq!(bus.state(), ControllerState::Offline);

    root.set_unreachable(false);
    bus.schedule_scan();
    assert_eq!(bus.tick(), ScanOutcome::Unchanged);
    assert!(bus.is_online());
}

#[test]
fn dropped_devices_leave_on_the_next_scan() {
    let bus = small_bus(16);
    let mem = Memory::new(1, 0x10).shared();
    let node = Node::with_devices(&[dev(&mem)]);
    bus.connect(elem(&node));
    bus.tick();

    node.unplug(mem.id());
    let id = mem.id();
    drop(mem);
    assert!(bus.device(id).is_none());
    assert_eq!(bus.devices(), vec![id]);

    bus.schedule_scan();
    assert_eq!(bus.tick(), ScanOutcome::Applied);
    assert!(bus.devices().is_empty());
}

#[test]
fn replaced_instance_with_same_id_is_reattached() {
    let bus = small_bus(16);
    let old = Memory::new(1, 0x10).shared();
    let node = Node::with_devices(&[dev(&old)]);
    bus.connect(elem(&node));
    bus.tick();

    let new = Memory::new(1, 0x10).shared();
    node.unplug(old.id());
    node.plug(dev(&new));
    bus.schedule_scan();
    assert_eq!(bus.tick(), ScanOutcome::Applied);

    assert!(same(&bus.device(new.id()).unwrap(), &new));
    assert!(old.events().contains(&Event::Detached));
    assert_eq!(new.events()[0], Event::Attached(bus.bus_id()));
}

#[test]
fn cyclic_topology_is_walked_once() {
    let bus = small_bus(16);
    let a_mem = Memory::new(1, 0x10).shared();
    let b_mem = Memory::new(2, 0x10).shared();
    let a = Node::with_devices(&[dev(&a_mem)]);
    let b = Node::with_devices(&[dev(&b_mem)]);
    a.link(elem(&b));
    b.link(elem(&a));
    bus.connect(elem(&a));

    assert_eq!(bus.tick(), ScanOutcome::Applied);
    assert_eq!(bus.devices().len(), 2);

    a.clear_links();
    b.clear_links();
}

#[test]
fn disconnect_removes_everything_behind_the_root() {
    let bus = small_bus(16);
    let mem = Memory::new(1, 0x10).shared();
    let node = Node::with_devices(&[dev(&mem)]);
    let root = elem(&node);
    bus.connect(root.clone());
    bus.tick();

    assert!(bus.disconnect(&root));
    assert!(!bus.disconnect(&root));
    assert_eq!(bus.tick(), ScanOutcome::Applied);
    assert!(bus.devices().is_empty());
}
