//! Per-CPU state.

use core::cell::UnsafeCell;

use crate::arch::{cpu_id, Context};
use crate::param::NCPU;

/// Per-CPU bookkeeping. Only ever touched by its own CPU, and only with
/// interrupts disabled, so the fields need no lock.
pub struct Cpu {
    /// The scheduler loop's saved context; `sched` switches here.
    pub scheduler: Context,

    /// Process table slot of the running process, if any.
    pub proc: Option<usize>,

    /// Depth of `push_off` nesting.
    pub noff: u32,

    /// Were interrupts enabled before the outermost `push_off`?
    pub interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            scheduler: Context::new(),
            proc: None,
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

/// The CPU table. Lives outside the kernel context object because the
/// spinlock path needs it before the kernel proper is initialized.
static CPUS: Cpus = Cpus::new();

pub fn cpus() -> &'static Cpus {
    &CPUS
}

pub struct Cpus {
    inner: [UnsafeCell<Cpu>; NCPU],
}

// SAFETY: each CPU only dereferences its own entry.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub const fn new() -> Self {
        Self {
            inner: [const { UnsafeCell::new(Cpu::new()) }; NCPU],
        }
    }

    /// Raw pointer to the executing CPU's entry. The pointer is only
    /// meaningful while the thread cannot migrate, i.e. while interrupts
    /// are disabled.
    pub fn current_raw(&self) -> *mut Cpu {
        self.inner[cpu_id()].get()
    }

    /// The executing CPU's entry.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled and the reference must not outlive the
    /// interrupts-disabled region.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn current(&self) -> &mut Cpu {
        // SAFETY: with interrupts off the thread stays on this CPU, and
        // only this CPU accesses its own entry.
        unsafe { &mut *self.current_raw() }
    }
}
