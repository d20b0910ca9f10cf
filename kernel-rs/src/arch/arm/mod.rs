//! AArch64 backend.

pub mod intr;
mod start;
mod swtch;
mod timer;
pub mod trap;
mod trap_frame;

pub use timer::{timer_init, timer_rearm};
pub use trap::{enter_user, switch_user_table};
pub use trap_frame::{Context, TrapFrame};

/// Top of physical RAM on the qemu virt board (128 MiB at 1 GiB).
pub const PHYSTOP: usize = 0x4000_0000 + 128 * 1024 * 1024;

/// Where the boot protocol places the root filesystem image.
pub const RAMDISK_BASE: usize = 0x4600_0000;
pub const RAMDISK_BLOCKS: u32 = 16 * 1024;

use core::arch::asm;

use cortex_a::registers::{DAIF, MPIDR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

/// Index of the executing CPU, from the affinity bits of MPIDR_EL1.
pub fn cpu_id() -> usize {
    (MPIDR_EL1.get() & 0xff) as usize
}

/// Are IRQs enabled on this CPU?
pub fn intr_get() -> bool {
    !DAIF.is_set(DAIF::I)
}

/// Mask IRQs on this CPU.
///
/// # Safety
///
/// Must be balanced with `intr_on` through `push_off`/`pop_off`.
pub unsafe fn intr_off() {
    DAIF.write(DAIF::I::Masked);
}

/// Unmask IRQs on this CPU.
///
/// # Safety
///
/// The caller must not hold any spinlock.
pub unsafe fn intr_on() {
    DAIF.write(DAIF::I::Unmasked);
}

/// Hint to the CPU that we are in a spin loop.
pub fn spin_hint() {
    cortex_a::asm::nop();
}

/// Wait for an event; used by idle CPUs and contended spinlocks.
pub fn wait_for_event() {
    cortex_a::asm::wfe();
}

/// Wake up CPUs waiting in `wait_for_event`.
pub fn send_event() {
    cortex_a::asm::sev();
}

/// The current frame pointer, for the spinlock caller-PC trace.
pub fn fp() -> usize {
    let fp: usize;
    // SAFETY: reads a register.
    unsafe { asm!("mov {}, x29", out(reg) fp) };
    fp
}

pub use swtch::swtch;
