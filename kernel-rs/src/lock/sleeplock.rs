//! Sleeping locks (mutexes).

use core::cell::UnsafeCell;

use super::{Guard, Lock, RawLock, SleepableLock};
use crate::param::NPROC;
use crate::proc::current_slot;

/// Threads are identified by their process table slot; early boot and the
/// scheduler context, which have no process, share a sentinel slot.
fn current_holder() -> usize {
    current_slot().unwrap_or(NPROC)
}

/// Long-term mutual exclusion. A contended acquirer sleeps on the lock's
/// wait queue; the unlocker wakes the queue and the sleepers reacquire in
/// FIFO order. Not recursive: a second acquire by the holder sleeps
/// forever. Interrupt handlers must never take one.
pub struct RawSleepLock {
    /// Process table slot of the holder, or `None`.
    holder: SleepableLock<Option<usize>>,

    /// Name of lock, for diagnostics.
    name: &'static str,
}

/// Locks that sleep instead of busy wait.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    const fn new(name: &'static str) -> Self {
        Self {
            holder: SleepableLock::new("sleep lock", None),
            name,
        }
    }

    /// Check whether the current thread is holding the lock.
    pub fn holding(&self) -> bool {
        let guard = self.holder.lock();
        *guard == Some(current_holder())
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut guard = self.holder.lock();
        while guard.is_some() {
            guard.sleep();
        }
        *guard = Some(current_holder());
    }

    fn release(&self) {
        let mut guard = self.holder.lock();
        assert!(
            *guard == Some(current_holder()),
            "release {}: not holding",
            self.name
        );
        *guard = None;
        guard.wakeup();
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` named `name` holding `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn holding(&self) -> bool {
        self.raw_lock().holding()
    }
}
