//! The scheduler.
//!
//! One global FIFO run queue, guarded by one spinlock. Each CPU runs
//! `scheduler()` forever: pop a runnable thread, switch to it, take it
//! back when it yields. Preemption is driven by the timer tick calling
//! `yield_cpu`. The run-queue lock is the only spinlock held across a
//! context switch; its ownership transfers to the resumed side.

use kernel_lib::queue::IndexQueue;

use super::ThreadState;
use crate::arch::{intr_get, intr_on, send_event, swtch, wait_for_event};
use crate::cpu::cpus;
use crate::kernel::kernel;
use crate::lock::SpinLockGuard;
use crate::param::NPROC;

pub struct Sched {
    /// Runnable threads, by process table slot, FIFO.
    pub run_queue: IndexQueue<NPROC>,
}

impl Sched {
    pub const fn new() -> Self {
        Self {
            run_queue: IndexQueue::new(),
        }
    }
}

/// Marks `slot` runnable and queues it. Caller holds the run-queue lock.
pub fn make_runnable(slot: usize, sched: &mut SpinLockGuard<'_, Sched>) {
    // SAFETY: the run-queue lock is held.
    let th = unsafe { kernel().procs().thread_raw(slot) };
    th.state = ThreadState::Runnable;
    sched.run_queue.push(slot);
    // Kick CPUs idling in wfe.
    send_event();
}

/// The per-CPU scheduler loop. Never returns.
///
/// # Safety
///
/// Must be called exactly once per CPU, after kernel initialization, on
/// that CPU's boot stack.
pub unsafe fn scheduler() -> ! {
    loop {
        // Let devices interrupt between decisions so a wakeup can arrive.
        unsafe { intr_on() };

        let mut sched = kernel().sched().lock();
        let slot = sched.run_queue.pop();
        match slot {
            Some(slot) => {
                // SAFETY: the run-queue lock is held.
                let th = unsafe { kernel().procs().thread_raw(slot) };
                assert_eq!(th.state, ThreadState::Runnable, "scheduler: queue state");
                th.state = ThreadState::Running;

                // SAFETY: interrupts are off (run-queue lock held).
                let cpu = unsafe { cpus().current() };
                cpu.proc = Some(slot);
                let context = &mut th.context as *mut _;
                // Switch to the chosen thread. It is the thread's job to
                // release the run-queue lock and reacquire it before
                // switching back.
                unsafe { swtch(&mut cpu.scheduler, context) };

                // Thread is done for now; it changed its state before
                // coming back, and the run-queue lock is ours again.
                // SAFETY: interrupts are still off.
                let cpu = unsafe { cpus().current() };
                cpu.proc = None;
                drop(sched);
            }
            None => {
                drop(sched);
                // Idle until another CPU queues work and signals an event.
                wait_for_event();
            }
        }
    }
}

/// Switches from the current thread to this CPU's scheduler loop.
/// Called with exactly the run-queue lock held and the thread's state
/// already changed; returns, with the lock held again, when the thread is
/// next scheduled.
///
/// # Safety
///
/// The caller must hold `sched` and no other spinlock, and must have set
/// the current thread's state to something other than `Running`.
pub unsafe fn switch_to_scheduler(sched: &mut SpinLockGuard<'_, Sched>) {
    let _ = &sched; // the lock is the witness that we may touch threads
    assert!(!intr_get(), "sched: interruptible");

    // SAFETY: interrupts are off.
    let cpu = unsafe { cpus().current() };
    assert_eq!(cpu.noff, 1, "sched: holding locks");
    let slot = cpu.proc.expect("sched: no current thread");

    // SAFETY: the run-queue lock is held.
    let th = unsafe { kernel().procs().thread_raw(slot) };
    assert_ne!(th.state, ThreadState::Running, "sched: still running");

    // interrupt_enabled is a property of this kernel thread, not the CPU;
    // carry it across the switch.
    let intena = cpu.interrupt_enabled;
    unsafe { swtch(&mut th.context, &mut cpu.scheduler) };
    // We may be resuming on a different CPU.
    // SAFETY: interrupts are still off.
    let cpu = unsafe { cpus().current() };
    cpu.interrupt_enabled = intena;
}

/// Round-robin preemption point; called from the timer tick.
pub fn yield_cpu() {
    let Some(slot) = super::current_slot() else {
        return;
    };
    let mut sched = kernel().sched().lock();
    make_runnable(slot, &mut sched);
    // SAFETY: exactly the run-queue lock is held.
    unsafe { switch_to_scheduler(&mut sched) };
    drop(sched);
}
