//! Wait queues.
//!
//! A `WaitQueue` is a FIFO of sleeping threads keyed by one logical
//! condition. Each wait condition in the kernel owns a named queue; there
//! is no ambient "sleep channel" identity beyond the queue object itself.
//!
//! The queue's ring is only touched while the caller-supplied condition
//! spinlock is held, which is what makes the sleep transition atomic: a
//! waker cannot observe the condition changed without also observing the
//! sleeper queued.

use core::cell::UnsafeCell;
use core::ptr;

use kernel_lib::queue::IndexQueue;

use crate::arch::send_event;
use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::lock::{Guard, RawLock};
use crate::param::NPROC;
use crate::proc::{current_slot, ThreadState};

pub struct WaitQueue {
    /// Sleeping threads, by process table slot, FIFO.
    q: UnsafeCell<IndexQueue<NPROC>>,
}

// SAFETY: the inner ring is only accessed under the condition spinlock.
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            q: UnsafeCell::new(IndexQueue::new()),
        }
    }

    /// Atomically releases `lk` and sleeps on this queue; reacquires `lk`
    /// before returning. The caller must hold no other spinlock.
    pub fn sleep<R: RawLock, T>(&self, lk: &mut Guard<'_, R, T>) {
        let _ = self.sleep_inner(lk, false);
    }

    /// Like `sleep`, but signal delivery may end the sleep early, in which
    /// case `Err(Intr)` is returned.
    pub fn sleep_interruptible<R: RawLock, T>(&self, lk: &mut Guard<'_, R, T>) -> Result<()> {
        self.sleep_inner(lk, true)
    }

    fn sleep_inner<R: RawLock, T>(&self, lk: &mut Guard<'_, R, T>, interruptible: bool) -> Result<()> {
        let slot = current_slot().expect("WaitQueue::sleep: no current process");

        // Queue membership is protected by `lk`.
        // SAFETY: the caller holds the condition lock.
        unsafe { (*self.q.get()).push(slot) };

        // Holding the run-queue lock before releasing `lk` guarantees no
        // wakeup is lost between the release and the state change below.
        let mut sched = kernel().sched().lock();

        let mut interrupted = false;
        lk.reacquire_after(|| {
            {
                // SAFETY: the run-queue lock is held.
                let th = unsafe { kernel().procs().thread_raw(slot) };
                th.state = ThreadState::Sleeping;
                th.sleeping_on = self as *const WaitQueue;
                th.interruptible = interruptible;
            }
            // SAFETY: exactly the run-queue lock is held.
            unsafe { super::sched::switch_to_scheduler(&mut sched) };
            {
                // SAFETY: the run-queue lock is held again after the switch.
                let th = unsafe { kernel().procs().thread_raw(slot) };
                th.sleeping_on = ptr::null();
                th.interruptible = false;
                interrupted = th.signaled;
                th.signaled = false;
            }
            drop(sched);
        });

        // A signal wakeup leaves the entry behind; drop it now that the
        // condition lock is held again.
        // SAFETY: the caller's condition lock is held.
        let _ = unsafe { (*self.q.get()).remove(slot) };

        if interruptible && (interrupted || kernel().procs().pool(slot).killed()) {
            return Err(KernelError::Intr);
        }
        Ok(())
    }

    /// Makes every thread on the queue runnable, in FIFO order.
    /// The caller must hold the condition spinlock guarding this queue.
    pub fn wakeup_all(&self) {
        // SAFETY: the caller holds the condition lock.
        if unsafe { (*self.q.get()).is_empty() } {
            return;
        }
        let mut sched = kernel().sched().lock();
        // SAFETY: the caller holds the condition lock.
        let q = unsafe { &mut *self.q.get() };
        while let Some(slot) = q.pop() {
            // SAFETY: the run-queue lock is held.
            let th = unsafe { kernel().procs().thread_raw(slot) };
            if th.state == ThreadState::Sleeping && th.sleeping_on == self as *const WaitQueue {
                th.state = ThreadState::Runnable;
                th.sleeping_on = ptr::null();
                sched.run_queue.push(slot);
            }
        }
        drop(sched);
        // Kick idle CPUs out of wfe.
        send_event();
    }
}
