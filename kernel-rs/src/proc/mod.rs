//! Processes and threads.
//!
//! Every process owns one thread. The two are kept apart because they are
//! guarded by different locks:
//!
//! * `Thread` (run state, saved context, sleep bookkeeping) belongs to the
//!   scheduler and is only touched with the run-queue lock held.
//! * `ProcShared` (identity, parentage, exit status, signal state) is
//!   touched by relatives and by `kill`, under the process table lock.
//! * `ProcData` (address space, cwd, trap frame, credentials) is private
//!   to the process itself; no lock is needed, only the rule that nothing
//!   but the current process reaches it.
//! * The file-descriptor table has its own per-process spinlock.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{Context, TrapFrame};
use crate::file::FdTable;
use crate::fs::InodeRef;
use crate::lock::{push_off, pop_off, SpinLock};
use crate::param::MAXPROCNAME;
use crate::signal::SignalState;
use crate::vm::VmSpace;

mod procs;
pub mod sched;
mod wait_queue;

pub use procs::{
    exit_status, kstack_top, signal_status, CurrentProc, PidTable, Procs, WaitTarget, WNOHANG,
};
pub use wait_queue::WaitQueue;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// Process-level lifecycle, distinct from the thread's run state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    None,
    /// Mid-creation; has a slot but cannot run or be signalled yet.
    Embryo,
    Active,
    Zombie,
    Stopped,
}

/// Scheduler-owned state. Guarded by the run-queue lock.
pub struct Thread {
    pub state: ThreadState,

    /// The queue this thread sleeps on, for stale-entry detection.
    pub sleeping_on: *const WaitQueue,

    /// May signal delivery end the current sleep?
    pub interruptible: bool,

    /// Set by the waker when a signal (not the awaited condition) ended
    /// the sleep.
    pub signaled: bool,

    /// swtch() here to run the thread.
    pub context: Context,

    /// Bottom of the kernel stack for this slot.
    pub kstack: usize,
}

impl Thread {
    const fn new() -> Self {
        Self {
            state: ThreadState::Unused,
            sleeping_on: ptr::null(),
            interruptible: false,
            signaled: false,
            context: Context::new(),
            kstack: 0,
        }
    }
}

/// Accumulated CPU time, in clock ticks.
#[derive(Copy, Clone, Default)]
pub struct Times {
    pub user: u64,
    pub system: u64,
    pub child_user: u64,
    pub child_system: u64,
}

/// State guarded by the process table lock.
pub struct ProcShared {
    pub pid: Pid,
    pub pgid: Pid,

    /// Slot of the parent process. The parent relation is by slot, not by
    /// owning pointer; the table lock keeps it consistent.
    pub parent: usize,

    /// Next slot in the pid hash chain.
    pub pid_next: Option<usize>,

    pub state: ProcState,

    /// Exit status for the parent's wait().
    pub xstate: i32,

    pub times: Times,

    /// Effective and real uid, mirrored from the process's credentials so
    /// that kill's permission check needs only the table lock.
    pub euid: u32,
    pub ruid: u32,

    pub sig: SignalState,
}

impl ProcShared {
    const fn new() -> Self {
        Self {
            pid: 0,
            pgid: 0,
            parent: 0,
            pid_next: None,
            state: ProcState::None,
            xstate: 0,
            times: Times {
                user: 0,
                system: 0,
                child_user: 0,
                child_system: 0,
            },
            euid: 0,
            ruid: 0,
            sig: SignalState::new(),
        }
    }
}

/// User and group credentials.
#[derive(Copy, Clone)]
pub struct Cred {
    pub ruid: u32,
    pub euid: u32,
    pub rgid: u32,
    pub egid: u32,
}

impl Cred {
    const fn root() -> Self {
        Self {
            ruid: 0,
            euid: 0,
            rgid: 0,
            egid: 0,
        }
    }
}

/// State private to the process. Only the current process may touch it.
pub struct ProcData {
    pub trap_frame: TrapFrame,
    pub vm: Option<VmSpace>,
    pub cwd: Option<InodeRef>,
    pub cred: Cred,
    /// File mode creation mask.
    pub cmask: u32,
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            trap_frame: TrapFrame::new(),
            vm: None,
            cwd: None,
            cred: Cred::root(),
            cmask: 0,
            name: [0; MAXPROCNAME],
        }
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(MAXPROCNAME - 1);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n] = 0;
    }
}

/// Per-process state.
pub struct Proc {
    thread: UnsafeCell<Thread>,
    shared: UnsafeCell<ProcShared>,
    data: UnsafeCell<ProcData>,

    /// Open file descriptors.
    pub files: SpinLock<FdTable>,

    /// The parent sleeps here waiting for children; condition lock is the
    /// process table lock.
    pub child_wait: WaitQueue,

    /// A stopped thread sleeps here until SIGCONT.
    pub stop_wait: WaitQueue,

    /// sigsuspend parks here until a signal arrives.
    pub suspend_wait: WaitQueue,

    /// Set by kill(); checked at the kernel/user boundary.
    killed: AtomicBool,
}

// SAFETY: the cells are guarded by the locks documented above.
unsafe impl Sync for Proc {}

impl Proc {
    const fn new() -> Self {
        Self {
            thread: UnsafeCell::new(Thread::new()),
            shared: UnsafeCell::new(ProcShared::new()),
            data: UnsafeCell::new(ProcData::new()),
            files: SpinLock::new("fd table", FdTable::new()),
            child_wait: WaitQueue::new(),
            stop_wait: WaitQueue::new(),
            suspend_wait: WaitQueue::new(),
            killed: AtomicBool::new(false),
        }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }
}

/// Process table slot of the thread running on this CPU, if any.
pub fn current_slot() -> Option<usize> {
    // SAFETY: paired; the cpu entry is read with interrupts off.
    unsafe {
        push_off();
        let slot = crate::cpu::cpus().current().proc;
        pop_off();
        slot
    }
}
