//! Sleepable locks.

use core::cell::UnsafeCell;

use super::{Guard, Lock, RawLock, RawSpinLock};
use crate::error::Result;
use crate::proc::WaitQueue;

/// A spinlock with a wait queue, so guards can sleep on the condition the
/// lock protects.
pub struct RawSleepableLock {
    lock: RawSpinLock,
    queue: WaitQueue,
}

/// Similar to `SpinLock`, but guards of this lock can `sleep`/`wakeup`.
pub type SleepableLock<T> = Lock<RawSleepableLock, T>;
pub type SleepableLockGuard<'s, T> = Guard<'s, RawSleepableLock, T>;

impl RawSleepableLock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            queue: WaitQueue::new(),
        }
    }
}

impl RawLock for RawSleepableLock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }
}

impl<T> SleepableLock<T> {
    /// Returns a new `SleepableLock` named `name` holding `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepableLock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Atomically releases the lock and sleeps on its queue; holds the
    /// lock again on return.
    pub fn sleep(&mut self) {
        let lock = self.get_lock();
        lock.raw_lock().queue.sleep(self);
    }

    /// Interruptible variant of `sleep`; `Err(Intr)` if a signal ended the
    /// sleep.
    pub fn sleep_interruptible(&mut self) -> Result<()> {
        let lock = self.get_lock();
        lock.raw_lock().queue.sleep_interruptible(self)
    }

    /// Wakes every thread sleeping on this lock's queue.
    pub fn wakeup(&self) {
        self.get_lock().raw_lock().queue.wakeup_all();
    }
}
