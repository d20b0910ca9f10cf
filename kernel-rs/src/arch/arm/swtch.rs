//! The context switch.

use core::arch::global_asm;

use super::Context;

global_asm!(
    r#"
.section .text
.globl __swtch
// __swtch(old: *mut Context, new: *mut Context)
//
// Save current callee-saved registers in old, load them from new.
__swtch:
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x30, [x0, #80]
    mov x9, sp
    str x9, [x0, #96]

    ldp x19, x20, [x1, #0]
    ldp x21, x22, [x1, #16]
    ldp x23, x24, [x1, #32]
    ldp x25, x26, [x1, #48]
    ldp x27, x28, [x1, #64]
    ldp x29, x30, [x1, #80]
    ldr x9, [x1, #96]
    mov sp, x9
    ret
"#
);

extern "C" {
    fn __swtch(old: *mut Context, new: *mut Context);
}

/// Switch kernel stacks: save the current callee-saved state into `old` and
/// resume the thread whose state is in `new`.
///
/// # Safety
///
/// `old` and `new` must point to valid `Context`s, `new` must describe a
/// live kernel stack, and the caller must hold exactly the run-queue lock,
/// whose ownership transfers across the switch.
pub unsafe fn swtch(old: *mut Context, new: *mut Context) {
    // SAFETY: forwarded to the asm routine under the caller's guarantees.
    unsafe { __swtch(old, new) }
}
