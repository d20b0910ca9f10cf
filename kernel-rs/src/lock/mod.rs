//! Locks.
//!
//! Three kinds, layered bottom-up:
//!
//! * `SpinLock` busy-waits with interrupts disabled. For short critical
//!   sections and anything an interrupt handler touches.
//! * `SleepableLock` is a spinlock whose guard can atomically release the
//!   lock and sleep on the lock's wait queue.
//! * `SleepLock` is a long-term mutex; contended acquirers sleep instead
//!   of spinning. Interrupt handlers must never take one.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{pop_off, push_off, RawSpinLock, SpinLock, SpinLockGuard};

pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);
    /// Releases the lock.
    fn release(&self);
}

/// Mutual exclusion that owns its `RawLock` and the protected data.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes access to the data.
unsafe impl<R: RawLock, T: Send> Sync for Lock<R, T> {}

/// RAII guard giving exclusive access to a `Lock`'s data.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    // Keeps the guard from crossing CPUs: it must be released by the CPU
    // that acquired it.
    _marker: PhantomData<*const ()>,
}

// SAFETY: the guard hands out `&T`/`&mut T` only under the lock.
unsafe impl<R: RawLock, T: Sync> Sync for Guard<'_, R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn raw_lock(&self) -> &R {
        &self.lock
    }

    /// Returns a raw pointer to the data without locking. The caller must
    /// ensure that access cannot race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: exclusive access to the lock itself.
        unsafe { &mut *self.data.get() }
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// Only for the case where the guard was leaked with `mem::forget`.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock, runs `f`, and reacquires.
    /// The data must be revalidated afterwards.
    pub fn reacquire_after<U>(&mut self, f: impl FnOnce() -> U) -> U {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    pub fn get_lock(&self) -> &'s Lock<R, T> {
        self.lock
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
