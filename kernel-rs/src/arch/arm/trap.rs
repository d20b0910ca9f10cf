//! Exception vectors and the user/kernel crossing.
//!
//! Exceptions from EL0 land on the kernel stack, save the full register
//! state as a `TrapFrame`, and call into the portable trap layer; the way
//! back restores a `TrapFrame` wholesale and erets. Exceptions taken in
//! EL1 (device interrupts, mostly) save and restore around a plain call.

use core::arch::global_asm;

use cortex_a::registers::{ESR_EL1, FAR_EL1, TTBR0_EL1, VBAR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

use super::TrapFrame;
use crate::trap::{self, TrapKind};

global_asm!(
    r#"
.macro SAVE_FRAME
    sub sp, sp, #272
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    mrs x9, sp_el0
    stp x30, x9, [sp, #240]
    mrs x9, elr_el1
    mrs x10, spsr_el1
    stp x9, x10, [sp, #256]
.endm

.macro RESTORE_FRAME
    ldp x9, x10, [sp, #256]
    msr elr_el1, x9
    msr spsr_el1, x10
    ldp x30, x9, [sp, #240]
    msr sp_el0, x9
    ldp x28, x29, [sp, #224]
    ldp x26, x27, [sp, #208]
    ldp x24, x25, [sp, #192]
    ldp x22, x23, [sp, #176]
    ldp x20, x21, [sp, #160]
    ldp x18, x19, [sp, #144]
    ldp x16, x17, [sp, #128]
    ldp x14, x15, [sp, #112]
    ldp x12, x13, [sp, #96]
    ldp x10, x11, [sp, #80]
    ldp x8, x9, [sp, #64]
    ldp x6, x7, [sp, #48]
    ldp x4, x5, [sp, #32]
    ldp x2, x3, [sp, #16]
    ldp x0, x1, [sp, #0]
    add sp, sp, #272
.endm

.balign 2048
.globl __vectors
__vectors:
// Current EL with SP0: unused.
.balign 0x80
    b .
.balign 0x80
    b .
.balign 0x80
    b .
.balign 0x80
    b .
// Current EL with SPx: kernel-mode traps.
.balign 0x80
    SAVE_FRAME
    mov x0, sp
    mov x1, #2
    bl __trap
    RESTORE_FRAME
    eret
.balign 0x80
    SAVE_FRAME
    mov x0, sp
    mov x1, #3
    bl __trap
    RESTORE_FRAME
    eret
.balign 0x80
    b .
.balign 0x80
    b .
// Lower EL, AArch64: user-mode traps.
.balign 0x80
    SAVE_FRAME
    mov x0, sp
    mov x1, #0
    bl __trap
    RESTORE_FRAME
    eret
.balign 0x80
    SAVE_FRAME
    mov x0, sp
    mov x1, #1
    bl __trap
    RESTORE_FRAME
    eret
.balign 0x80
    b .
.balign 0x80
    b .
// Lower EL, AArch32: unsupported.
.balign 0x80
    b .
.balign 0x80
    b .
.balign 0x80
    b .
.balign 0x80
    b .

// __enter_user(tf: *const TrapFrame, kstack_top: usize) -> !
.globl __enter_user
__enter_user:
    // Rewind the kernel stack so the next trap starts from the top.
    mov sp, x1
    ldp x9, x10, [x0, #256]
    msr elr_el1, x9
    msr spsr_el1, x10
    ldp x30, x9, [x0, #240]
    msr sp_el0, x9
    ldp x28, x29, [x0, #224]
    ldp x26, x27, [x0, #208]
    ldp x24, x25, [x0, #192]
    ldp x22, x23, [x0, #176]
    ldp x20, x21, [x0, #160]
    ldp x18, x19, [x0, #144]
    ldp x16, x17, [x0, #128]
    ldp x14, x15, [x0, #112]
    ldp x12, x13, [x0, #96]
    ldp x10, x11, [x0, #80]
    ldp x8, x9, [x0, #64]
    ldp x6, x7, [x0, #48]
    ldp x4, x5, [x0, #32]
    ldp x2, x3, [x0, #16]
    ldp x0, x1, [x0, #0]
    eret
"#
);

extern "C" {
    static __vectors: [u8; 0];
    fn __enter_user(tf: *const TrapFrame, kstack_top: usize) -> !;
}

/// Installs the vector table on this CPU.
///
/// # Safety
///
/// Per-CPU boot path only.
pub unsafe fn trap_init() {
    VBAR_EL1.set(core::ptr::addr_of!(__vectors) as u64);
}

/// Activates a user address space.
///
/// The portable page table stores frame numbers and permission bits; the
/// MMU descriptor layout derived from them is the business of the MMU
/// configuration done at boot, not of the portable kernel.
pub fn switch_user_table(root: usize) {
    TTBR0_EL1.set(root as u64);
    // SAFETY: TLB maintenance after the table switch.
    unsafe {
        core::arch::asm!("tlbi vmalle1", "dsb sy", "isb");
    }
}

/// ESR exception-class values the kernel routes.
const EC_SVC: u64 = 0x15;
const EC_IABORT_LOWER: u64 = 0x20;
const EC_DABORT_LOWER: u64 = 0x24;

/// Exception entry from the vectors. `source` is 0/1 for EL0 sync/irq
/// and 2/3 for EL1 sync/irq.
#[no_mangle]
unsafe extern "C" fn __trap(tf: *mut TrapFrame, source: u64) {
    let kind = match source {
        0 => {
            let esr = ESR_EL1.get();
            let ec = (esr >> 26) & 0x3f;
            match ec {
                EC_SVC => TrapKind::Syscall,
                EC_DABORT_LOWER => TrapKind::PageFault {
                    addr: FAR_EL1.get() as usize,
                    // Bit 6 of the ISS is WnR for data aborts.
                    write: esr & (1 << 6) != 0,
                },
                EC_IABORT_LOWER => TrapKind::PageFault {
                    addr: FAR_EL1.get() as usize,
                    write: false,
                },
                _ => TrapKind::BadTrap(esr as u32),
            }
        }
        1 | 3 => TrapKind::Irq,
        _ => TrapKind::BadTrap(ESR_EL1.get() as u32),
    };

    // SAFETY: tf points at the frame the vector just saved.
    let tf = unsafe { &mut *tf };
    if source < 2 {
        trap::user_trap(tf, kind)
    } else {
        trap::kernel_trap(kind)
    }
}

/// Final return to user mode: restore the frame and eret.
///
/// # Safety
///
/// `tf` must be a complete user register state and the process's address
/// space must be the one in TTBR0.
pub unsafe fn enter_user(tf: *const TrapFrame, kstack_top: usize) -> ! {
    // SAFETY: forwarded to the asm under the caller's guarantees.
    unsafe { __enter_user(tf, kstack_top) }
}
