use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// The exclusion domain of one bus.
///
/// Held for the whole of a device access, a device update, and the apply and notify steps of a
/// scan, so the population and the address map cannot change under a running device. The thread
/// that holds it may enter again: devices call back into their own bus from inside a callback.
///
/// Two threads each holding one bus and calling into the other's deadlock; bridges between buses
/// must not form such cycles across threads.
#[derive(Debug, Default)]
pub(crate) struct BusLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl BusLock {
    pub(crate) fn acquire(&self) -> BusLockGuard<'_> {
        let me = thread::current().id();
        let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut owner = self
            .released
            .wait_while(owner, |owner| owner.thread.is_some_and(|thread| thread != me))
            .unwrap_or_else(PoisonError::into_inner);
        owner.thread = Some(me);
        owner.depth += 1;
        BusLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .depth
    }
}

pub(crate) struct BusLockGuard<'a> {
    lock: &'a BusLock,
    // Ownership is per thread; the guard must be released where it was taken.
    _not_send: PhantomData<*const ()>,
}

impl Drop for BusLockGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self
            .lock
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.lock.released.notify_all();
        }
    }
}
