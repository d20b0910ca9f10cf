//! Stub backend for non-ARM builds.
//!
//! Implements the arch interface with plain atomics so that the kernel
//! compiles on the host and its arch-independent logic can be unit tested.
//! Nothing here ever runs on real hardware.

use core::sync::atomic::{AtomicBool, Ordering};

mod trap_frame;
pub use trap_frame::{Context, TrapFrame};

static INTR_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn cpu_id() -> usize {
    0
}

pub fn intr_get() -> bool {
    INTR_ENABLED.load(Ordering::Relaxed)
}

pub unsafe fn intr_off() {
    INTR_ENABLED.store(false, Ordering::Relaxed);
}

pub unsafe fn intr_on() {
    INTR_ENABLED.store(true, Ordering::Relaxed);
}

pub fn spin_hint() {
    core::hint::spin_loop();
}

pub fn wait_for_event() {
    core::hint::spin_loop();
}

pub fn send_event() {}

pub fn fp() -> usize {
    0
}

/// # Safety
///
/// Never actually switches on the host; calling it is a bug.
pub unsafe fn swtch(_old: *mut Context, _new: *mut Context) {
    unreachable!("context switch on the host backend");
}

pub fn switch_user_table(_root: usize) {}

/// # Safety
///
/// Never returns to user mode on the host; calling it is a bug.
pub unsafe fn enter_user(_tf: *const TrapFrame, _kstack_top: usize) -> ! {
    unreachable!("user return on the host backend");
}

pub fn timer_rearm() {}
