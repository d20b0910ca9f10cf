//! Entry point: every CPU lands in `_start` from the loader, gets a boot
//! stack, installs the vectors, and enters `kernel_main`.

use core::arch::global_asm;

global_asm!(
    r#"
.section .text.boot
.globl _start
_start:
    // Use SP_ELx for exceptions taken in EL1.
    msr spsel, #1

    // One boot stack per CPU, 16 KiB each.
    mrs x0, mpidr_el1
    and x0, x0, #0xff
    adrp x1, __boot_stacks
    add x1, x1, :lo12:__boot_stacks
    mov x2, #(16 * 1024)
    add x3, x0, #1
    madd x1, x3, x2, x1
    mov sp, x1

    bl __start_rust
1:  wfe
    b 1b

.section .bss
.balign 16
__boot_stacks:
    .space 16 * 1024 * 8
"#
);

#[no_mangle]
unsafe extern "C" fn __start_rust() -> ! {
    // SAFETY: per-CPU boot path.
    unsafe {
        super::trap::trap_init();
        crate::kernel::kernel_main()
    }
}
