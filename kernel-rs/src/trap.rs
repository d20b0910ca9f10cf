//! Portable trap handling.
//!
//! The arch vectors decode the hardware's view into a `TrapKind` and call
//! `user_trap` or `kernel_trap`. Everything that happens next — syscalls,
//! demand faults, the timer tick, signal delivery on the way back out —
//! is arch-independent.

use crate::arch::{self, TrapFrame};
use crate::kernel::kernel;
use crate::proc::{sched, signal_status, CurrentProc};
use crate::signal::{SIGILL, SIGKILL, SIGSEGV};

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum TrapKind {
    /// System call entry.
    Syscall,
    /// Access fault at `addr`.
    PageFault { addr: usize, write: bool },
    /// Device or timer interrupt.
    Irq,
    /// Anything the kernel does not route.
    BadTrap(u32),
}

/// A trap taken from user mode. Returns to user space through
/// `user_trap_return`, never through the caller's frame.
pub fn user_trap(tf: &mut TrapFrame, kind: TrapKind) -> ! {
    let cur = CurrentProc::get().expect("user trap: no process");

    // The saved frame on the kernel stack becomes the process's property;
    // the return path rebuilds from there.
    cur.data().trap_frame = *tf;

    match kind {
        TrapKind::Syscall => {
            let ret = crate::syscall::dispatch(cur);
            cur.data().trap_frame.set_retval(ret as usize);
        }
        TrapKind::PageFault { addr, write } => {
            let allocator = kernel().allocator();
            let data = cur.data();
            let resolved = data
                .vm
                .as_mut()
                .expect("fault: no vm")
                .handle_fault(addr, write, allocator);
            if resolved.is_err() {
                log::warn!(
                    "pid {}: segfault at {:#x} (pc {:#x})",
                    cur.pid(),
                    addr,
                    data.trap_frame.pc
                );
                kernel().procs().post_to_current(SIGSEGV);
            }
        }
        TrapKind::Irq => handle_irq(true),
        TrapKind::BadTrap(cause) => {
            log::warn!("pid {}: bad trap, cause {:#x}", cur.pid(), cause);
            kernel().procs().post_to_current(SIGILL);
        }
    }

    // SAFETY: the frame is the process's saved user state.
    unsafe { user_trap_return(cur) }
}

/// The way back to user mode: honor kill, deliver pending signals, then
/// restore the trap frame.
///
/// # Safety
///
/// The current process must have a complete user state in its trap frame.
pub unsafe fn user_trap_return(cur: CurrentProc) -> ! {
    if cur.proc().killed() {
        kernel().procs().exit_current(signal_status(SIGKILL));
    }
    kernel().procs().deliver_signals();

    // No interrupts between here and eret; the frame restore must not be
    // torn by a nested trap.
    // SAFETY: eret leaves interrupts to SPSR.
    unsafe { arch::intr_off() };

    let data = cur.data();
    let vm = data.vm.as_ref().expect("user return: no vm");
    arch::switch_user_table(vm.page_table_root());

    // SAFETY: the caller guarantees the frame; the kernel stack resets so
    // the next trap starts at the top.
    unsafe { arch::enter_user(&data.trap_frame, crate::proc::kstack_top(cur.slot())) }
}

/// A trap taken while in the kernel: only device interrupts are legal.
pub fn kernel_trap(kind: TrapKind) {
    match kind {
        TrapKind::Irq => handle_irq(false),
        TrapKind::BadTrap(cause) => panic!("kernel trap: cause {cause:#x}"),
        _ => panic!("kernel trap: unexpected kind"),
    }
}

#[cfg(target_arch = "aarch64")]
fn handle_irq(from_user: bool) {
    use crate::arch::arm::intr;

    while let Some(irq) = intr::claim() {
        match irq {
            intr::TIMER_IRQ => {
                intr::complete(irq);
                arch::timer_rearm();
                timer_tick(from_user);
            }
            intr::UART_IRQ => {
                kernel().console().intr();
                intr::complete(irq);
            }
            _ => {
                // SGI wakeups and anything else just need completion.
                intr::complete(irq);
            }
        }
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn handle_irq(_from_user: bool) {}

/// One clock tick: advance time, wake nanosleep, account CPU time, and
/// round-robin the current thread.
pub fn timer_tick(from_user: bool) {
    // Only one CPU advances the clock; every CPU preempts.
    if crate::arch::cpu_id() == 0 {
        let mut ticks = kernel().ticks().lock();
        *ticks += 1;
        ticks.wakeup();
    }
    kernel().procs().update_times(from_user);
    sched::yield_cpu();
}
