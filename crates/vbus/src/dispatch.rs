//! Per-thread tracking of controller-originated callbacks.
//!
//! Bus access is only legal from inside a callback the controller itself started (a device's
//! `read`, `write`, `interrupt`, `update_async` or bus state notification). Each such callback runs
//! inside a [`DispatchScope`], which pushes the bus id onto a thread-local stack. Access entry
//! points check the stack so misuse fails with an error instead of racing a scan.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::{BusError, BusResult};

/// Nesting limit for device-to-device call chains (a bridge forwarding into itself, say).
pub const MAX_DISPATCH_DEPTH: usize = 64;

thread_local! {
    static FRAMES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as running a callback for bus `bus` until dropped.
pub(crate) struct DispatchScope {
    // Scopes manipulate thread-local state and must be dropped on the thread that created them.
    _not_send: PhantomData<*const ()>,
}

impl DispatchScope {
    pub(crate) fn enter(bus: u64) -> BusResult<Self> {
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if frames.len() >= MAX_DISPATCH_DEPTH {
                return Err(BusError::DispatchTooDeep {
                    depth: frames.len(),
                });
            }
            frames.push(bus);
            Ok(Self {
                _not_send: PhantomData,
            })
        })
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Fails unless the current thread is inside a callback dispatched by bus `bus`.
pub(crate) fn check_access(bus: u64) -> BusResult<()> {
    FRAMES.with(|frames| {
        if frames.borrow().contains(&bus) {
            Ok(())
        } else {
            Err(BusError::NotInDispatch)
        }
    })
}
