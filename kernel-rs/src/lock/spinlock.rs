//! Spin locks.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::arch::{intr_get, intr_off, intr_on, send_event, spin_hint};
use crate::cpu::{cpus, Cpu};

#[cfg(feature = "lock-trace")]
use core::sync::atomic::AtomicUsize;
#[cfg(feature = "lock-trace")]
use crate::param::NCALLERPCS;

/// Mutual exclusion lock that busy waits (spins).
///
/// Acquiring disables interrupts on the local CPU; they stay off until the
/// outermost lock held by the CPU is released.
pub struct RawSpinLock {
    /// Name of the lock, for panic diagnostics.
    name: &'static str,

    /// If held, the owning `Cpu`; null otherwise.
    locked: AtomicPtr<Cpu>,

    /// Return addresses of the acquirer, for panic diagnostics.
    #[cfg(feature = "lock-trace")]
    pcs: [AtomicUsize; NCALLERPCS],
}

/// Locks that busy wait (spin).
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
            #[cfg(feature = "lock-trace")]
            pcs: [const { AtomicUsize::new(0) }; NCALLERPCS],
        }
    }

    /// Check whether this CPU is holding the lock.
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == cpus().current_raw()
    }

    /// Record the acquirer's call stack by chasing frame pointers.
    #[cfg(feature = "lock-trace")]
    fn save_caller_pcs(&self) {
        let mut fp = crate::arch::fp();
        for pc in self.pcs.iter() {
            if fp == 0 {
                pc.store(0, Ordering::Relaxed);
                continue;
            }
            // AArch64 frame record: [fp] = caller fp, [fp + 8] = return pc.
            // SAFETY: fp chains through frames on our own kernel stack.
            let (next, ret) = unsafe { (*(fp as *const usize), *((fp + 8) as *const usize)) };
            pc.store(ret, Ordering::Relaxed);
            fp = next;
        }
    }

    #[cfg(feature = "lock-trace")]
    pub fn caller_pcs(&self) -> [usize; NCALLERPCS] {
        let mut out = [0; NCALLERPCS];
        for (o, pc) in out.iter_mut().zip(self.pcs.iter()) {
            *o = pc.load(Ordering::Relaxed);
        }
        out
    }
}

impl RawLock for RawSpinLock {
    /// Acquires the lock, spinning until it is free.
    ///
    /// The `Acquire` success ordering pairs with the `Release` store in
    /// `release`, so everything written inside the previous critical
    /// section is visible once the exchange succeeds. On weakly ordered
    /// ARM this is the required dmb.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock with interrupt handlers.
        unsafe { push_off() };
        assert!(!self.holding(), "acquire {}: already holding", self.name);

        let me = cpus().current_raw();
        while self
            .locked
            .compare_exchange(ptr::null_mut(), me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_hint();
        }

        #[cfg(feature = "lock-trace")]
        self.save_caller_pcs();
    }

    fn release(&self) {
        assert!(self.holding(), "release {}: not holding", self.name);

        #[cfg(feature = "lock-trace")]
        self.pcs[0].store(0, Ordering::Relaxed);

        self.locked.store(ptr::null_mut(), Ordering::Release);
        // Wake CPUs waiting in wfe.
        send_event();
        unsafe { pop_off() };
    }
}

/// `push_off`/`pop_off` are like `intr_off`/`intr_on` except that they are
/// matched: it takes two `pop_off`s to undo two `push_off`s. If interrupts
/// were off to begin with, they stay off.
///
/// # Safety
///
/// Every `push_off` must be paired with a `pop_off` on the same CPU.
pub unsafe fn push_off() {
    let old = intr_get();
    // SAFETY: paired with the `intr_on` in `pop_off`.
    unsafe { intr_off() };

    // SAFETY: interrupts are now disabled.
    let cpu = unsafe { cpus().current() };
    if cpu.noff == 0 {
        cpu.interrupt_enabled = old;
    }
    cpu.noff += 1;
}

/// # Safety
///
/// See `push_off`.
pub unsafe fn pop_off() {
    assert!(!intr_get(), "pop_off: interruptible");

    // SAFETY: interrupts are disabled.
    let cpu = unsafe { cpus().current() };
    assert!(cpu.noff >= 1, "pop_off: unbalanced");
    cpu.noff -= 1;

    if cpu.noff == 0 && cpu.interrupt_enabled {
        // SAFETY: the outermost lock on this CPU was released.
        unsafe { intr_on() };
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` named `name` holding `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}
