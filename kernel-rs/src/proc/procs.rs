//! The process table.
//!
//! Creation, fork, exec support, wait, exit, signal generation and
//! delivery. The table lock guards every `ProcShared` plus the pid hash;
//! the run-queue lock guards every `Thread`. When both are needed the
//! table lock is taken first.

use super::sched::make_runnable;
use super::{
    current_slot, Cred, Pid, Proc, ProcData, ProcState, ProcShared, Thread, ThreadState,
};
use crate::arch::{pg_round_up, PGSIZE, USER_MAX, USER_STACK_TOP};
use crate::error::{KernelError, Result};
use crate::file::FdTable;
use crate::kernel::kernel;
use crate::lock::{SpinLock, SpinLockGuard};
use crate::param::{NPROC, NSIG};
use crate::signal::{
    default_action, DefaultAction::*, SigInfo, SigSet, SIGCHLD, SIGCONT, SIGKILL, SIGSTOP,
    SIG_DFL, SIG_IGN,
};
use crate::vm::{VmFlags, VmSpace};

const NPIDHASH: usize = 64;

/// Kernel stack size per thread.
pub const KSTACK_SIZE: usize = 4 * PGSIZE;

#[repr(align(16))]
struct KStack([u8; KSTACK_SIZE]);

/// The kernel stacks, one per process table slot.
static mut KSTACKS: [KStack; NPROC] = [const { KStack([0; KSTACK_SIZE]) }; NPROC];

/// Top of the kernel stack of `slot`.
pub fn kstack_top(slot: usize) -> usize {
    // SAFETY: address computation only.
    (unsafe { core::ptr::addr_of!(KSTACKS[slot]) } as usize) + KSTACK_SIZE
}

/// Wait target selectors, decoded from the pid argument of wait.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum WaitTarget {
    /// pid = -1: any child.
    Any,
    /// pid > 0: exactly this child.
    Pid(Pid),
    /// pid = 0: children in the caller's process group.
    CallerGroup,
    /// pid < -1: children in this process group.
    Group(Pid),
}

/// wait options.
pub const WNOHANG: i32 = 1;

/// The status word seen by the parent: normal exit in the second byte.
pub fn exit_status(code: i32) -> i32 {
    (code & 0xff) << 8
}

/// The status word for death by signal.
pub fn signal_status(signo: i32) -> i32 {
    signo & 0x7f
}

/// Identity and hash state guarded by the table lock.
pub struct PidTable {
    next_pid: Pid,
    buckets: [Option<usize>; NPIDHASH],
}

impl PidTable {
    const fn new() -> Self {
        Self {
            next_pid: 1,
            buckets: [None; NPIDHASH],
        }
    }

    fn bucket(pid: Pid) -> usize {
        pid as usize % NPIDHASH
    }
}

pub struct Procs {
    pool: [Proc; NPROC],
    table: SpinLock<PidTable>,
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            pool: [const { Proc::new() }; NPROC],
            table: SpinLock::new("ptable", PidTable::new()),
        }
    }

    /// Gives every slot its kernel stack.
    ///
    /// # Safety
    ///
    /// Single-threaded boot only.
    pub unsafe fn init_kstacks(&self) {
        for slot in 0..NPROC {
            // SAFETY: boot is single threaded.
            let th = unsafe { self.thread_raw(slot) };
            th.kstack = unsafe { core::ptr::addr_of!(KSTACKS[slot]) as usize };
        }
    }

    pub fn pool(&self, slot: usize) -> &Proc {
        &self.pool[slot]
    }

    pub fn table(&self) -> &SpinLock<PidTable> {
        &self.table
    }

    /// # Safety
    ///
    /// The run-queue lock must be held.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn thread_raw(&self, slot: usize) -> &mut Thread {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.pool[slot].thread.get() }
    }

    /// # Safety
    ///
    /// The table lock must be held.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn shared_raw(&self, slot: usize) -> &mut ProcShared {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.pool[slot].shared.get() }
    }

    /// # Safety
    ///
    /// Only the process running in `slot` (or its creator, before the
    /// thread first runs) may touch its `ProcData`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_raw(&self, slot: usize) -> &mut ProcData {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.pool[slot].data.get() }
    }

    fn pid_insert(&self, pid: Pid, slot: usize, g: &mut SpinLockGuard<'_, PidTable>) {
        let b = PidTable::bucket(pid);
        // SAFETY: the table lock is held.
        let shared = unsafe { self.shared_raw(slot) };
        shared.pid_next = g.buckets[b];
        g.buckets[b] = Some(slot);
    }

    fn pid_remove(&self, pid: Pid, g: &mut SpinLockGuard<'_, PidTable>) {
        let b = PidTable::bucket(pid);
        let mut cur = g.buckets[b];
        let mut prev: Option<usize> = None;
        while let Some(slot) = cur {
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(slot) };
            if shared.pid == pid {
                match prev {
                    // SAFETY: the table lock is held.
                    Some(p) => unsafe { self.shared_raw(p) }.pid_next = shared.pid_next,
                    None => g.buckets[b] = shared.pid_next,
                }
                shared.pid_next = None;
                return;
            }
            prev = Some(slot);
            cur = shared.pid_next;
        }
        panic!("pid_remove: pid {pid} not hashed");
    }

    /// O(1) expected pid lookup through the hash.
    pub fn pid_lookup(&self, pid: Pid, g: &mut SpinLockGuard<'_, PidTable>) -> Option<usize> {
        let mut cur = g.buckets[PidTable::bucket(pid)];
        while let Some(slot) = cur {
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(slot) };
            if shared.pid == pid && shared.state != ProcState::None {
                return Some(slot);
            }
            cur = shared.pid_next;
        }
        None
    }

    /// Claims an unused slot, assigns a pid, and leaves the process in
    /// the Embryo state with a cleared thread.
    fn alloc_slot(&self) -> Result<usize> {
        let mut g = self.table.lock();
        for slot in 0..NPROC {
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(slot) };
            if shared.state != ProcState::None {
                continue;
            }
            let pid = g.next_pid;
            g.next_pid += 1;
            shared.pid = pid;
            shared.pgid = pid;
            shared.parent = slot;
            shared.state = ProcState::Embryo;
            shared.xstate = 0;
            shared.times = Default::default();
            shared.sig = crate::signal::SignalState::new();
            shared.euid = 0;
            shared.ruid = 0;
            self.pid_insert(pid, slot, &mut g);
            self.pool[slot].clear_killed();
            return Ok(slot);
        }
        Err(KernelError::NoMem)
    }

    /// Makes an embryo runnable with a fresh kernel context starting in
    /// `forkret`.
    fn start_thread(&self, slot: usize) {
        let mut sched = kernel().sched().lock();
        // SAFETY: the run-queue lock is held.
        let th = unsafe { self.thread_raw(slot) };
        th.context = Default::default();
        th.context.ra = forkret as usize;
        th.context.sp = th.kstack + KSTACK_SIZE;
        make_runnable(slot, &mut sched);
    }

    /// Builds pid 1 from the packed initcode image.
    pub fn spawn_init(&self, image: &[u8]) -> Result<()> {
        let allocator = kernel().allocator();
        let slot = self.alloc_slot()?;

        let mut vm = VmSpace::new(allocator)?;
        let code_len = pg_round_up(image.len().max(1));
        vm.range_alloc(0, code_len, VmFlags::READ | VmFlags::WRITE | VmFlags::EXEC)?;
        vm.populate(0, code_len, allocator)?;
        vm.copy_out(0, image, allocator)?;
        vm.range_alloc(
            USER_STACK_TOP - PGSIZE,
            PGSIZE,
            VmFlags::READ | VmFlags::WRITE,
        )?;
        vm.populate(USER_STACK_TOP - PGSIZE, PGSIZE, allocator)?;
        vm.set_heap(code_len);

        // SAFETY: the embryo's thread has not started.
        let data = unsafe { self.data_raw(slot) };
        data.vm = Some(vm);
        data.cwd = None; // set in forkret, once the fs is mounted
        data.trap_frame = Default::default();
        data.trap_frame.pc = 0;
        data.trap_frame.sp = USER_STACK_TOP;
        data.set_name(b"init");

        {
            let _g = self.table.lock();
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(slot) };
            shared.state = ProcState::Active;
        }
        self.start_thread(slot);
        Ok(())
    }

    /// fork: clone the current process. Returns the child pid in the
    /// parent; the child returns 0 from its own trap frame.
    pub fn fork(&self) -> Result<Pid> {
        let cur = CurrentProc::get().expect("fork: no process");
        let allocator = kernel().allocator();
        // The embryo is torn down again if anything below fails.
        let slot = scopeguard::guard(self.alloc_slot()?, |slot| self.free_embryo(slot));

        let r = (|| {
            let slot = *slot;
            // Copy-on-write clone of the address space.
            let vm = cur.data().vm.as_mut().expect("fork: no vm").clone_cow(allocator)?;

            // SAFETY: the embryo's thread has not started.
            let data = unsafe { self.data_raw(slot) };
            data.vm = Some(vm);
            data.trap_frame = cur.data().trap_frame;
            data.trap_frame.set_retval(0);
            data.cred = cur.data().cred;
            data.cmask = cur.data().cmask;
            data.name = cur.data().name;
            data.cwd = cur.data().cwd.as_ref().map(|c| kernel().itable().dup(c));

            // Share every open descriptor.
            let parent_fds = cur.proc().files.lock();
            let mut child_fds = FdTable::new();
            for (fd, entry) in parent_fds.entries() {
                let _ = kernel().ftable().dup(entry.file);
                let replaced = child_fds.install_at(fd, entry.file)?;
                debug_assert!(replaced.is_none());
                child_fds.set_cloexec(fd, entry.cloexec)?;
            }
            drop(parent_fds);
            *self.pool[slot].files.lock() = child_fds;

            Ok(())
        })();

        r?;
        let slot = scopeguard::ScopeGuard::into_inner(slot);

        let pid;
        {
            let _g = self.table.lock();
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(slot) };
            // SAFETY: the table lock is held.
            let mine = unsafe { self.shared_raw(cur.slot()) };
            shared.parent = cur.slot();
            shared.pgid = mine.pgid;
            shared.euid = mine.euid;
            shared.ruid = mine.ruid;
            shared.sig = mine.sig.clone_for_fork();
            shared.state = ProcState::Active;
            pid = shared.pid;
        }
        self.start_thread(slot);
        Ok(pid)
    }

    /// Releases a half-built process that never ran.
    fn free_embryo(&self, slot: usize) {
        let fds: arrayvec::ArrayVec<crate::file::Fd, { crate::param::OPEN_MAX }> = {
            let mut files = self.pool[slot].files.lock();
            files.drain().collect()
        };
        for fd in fds {
            kernel().ftable().close(fd.file);
        }
        // SAFETY: the embryo's thread never started; the data is ours.
        let data = unsafe { self.data_raw(slot) };
        if let Some(vm) = data.vm.take() {
            vm.free(kernel().allocator());
        }
        if let Some(cwd) = data.cwd.take() {
            kernel().itable().put(cwd);
        }
        let mut g = self.table.lock();
        // SAFETY: the table lock is held.
        let shared = unsafe { self.shared_raw(slot) };
        self.pid_remove(shared.pid, &mut g);
        shared.state = ProcState::None;
    }

    /// Does `shared` match the wait selector, from the view of `me`?
    fn wait_matches(target: WaitTarget, shared: &ProcShared, my_pgid: Pid) -> bool {
        match target {
            WaitTarget::Any => true,
            WaitTarget::Pid(pid) => shared.pid == pid,
            WaitTarget::CallerGroup => shared.pgid == my_pgid,
            WaitTarget::Group(pgid) => shared.pgid == pgid,
        }
    }

    /// Waits for a matching child to die and reaps it.
    /// Returns (pid, status); with WNOHANG, (0, 0) when nothing is dead.
    pub fn wait(&self, target: WaitTarget, options: i32) -> Result<(Pid, i32)> {
        let cur = CurrentProc::get().expect("wait: no process");
        let me = cur.slot();

        let mut g = self.table.lock();
        loop {
            // SAFETY: the table lock is held.
            let my_pgid = unsafe { self.shared_raw(me) }.pgid;
            let mut have_kids = false;

            for slot in 0..NPROC {
                if slot == me {
                    continue;
                }
                // SAFETY: the table lock is held.
                let shared = unsafe { self.shared_raw(slot) };
                if shared.state == ProcState::None
                    || shared.state == ProcState::Embryo
                    || shared.parent != me
                {
                    continue;
                }
                if !Self::wait_matches(target, shared, my_pgid) {
                    continue;
                }
                have_kids = true;

                if shared.state != ProcState::Zombie {
                    continue;
                }
                // Make sure the child is really off its stack: its last
                // act was a switch made while holding the run-queue lock.
                {
                    let _sched = kernel().sched().lock();
                    // SAFETY: the run-queue lock is held.
                    let th = unsafe { self.thread_raw(slot) };
                    if th.state != ThreadState::Zombie {
                        continue;
                    }
                    th.state = ThreadState::Unused;
                }

                // Reap: fold times into ours, drop the pid, free the slot.
                let pid = shared.pid;
                let status = shared.xstate;
                let times = shared.times;
                shared.state = ProcState::None;
                self.pid_remove(pid, &mut g);
                // SAFETY: the table lock is held.
                let mine = unsafe { self.shared_raw(me) };
                mine.times.child_user += times.user + times.child_user;
                mine.times.child_system += times.system + times.child_system;
                return Ok((pid, status));
            }

            if !have_kids {
                return Err(KernelError::Child);
            }
            if options & WNOHANG != 0 {
                return Ok((0, 0));
            }
            // EINTR propagates; the interrupting signal stays pending.
            self.pool[me].child_wait.sleep_interruptible(&mut g)?;
        }
    }

    /// Exits the current process. Never returns.
    pub fn exit_current(&self, status: i32) -> ! {
        let cur = CurrentProc::get().expect("exit: no process");
        let me = cur.slot();

        // Close every descriptor and drop the working directory before
        // giving up the address space.
        let fds: arrayvec::ArrayVec<crate::file::Fd, { crate::param::OPEN_MAX }> = {
            let mut files = self.pool[me].files.lock();
            files.drain().collect()
        };
        for fd in fds {
            kernel().ftable().close(fd.file);
        }
        if let Some(cwd) = cur.data().cwd.take() {
            kernel().itable().put(cwd);
        }
        if let Some(vm) = cur.data().vm.take() {
            vm.free(kernel().allocator());
        }

        let mut g = self.table.lock();
        // SAFETY: the table lock is held.
        let parent = unsafe { self.shared_raw(me) }.parent;
        if parent == me {
            panic!("init exiting");
        }

        // Children are inherited by init (slot of pid 1).
        let init_slot = self
            .pid_lookup(1, &mut g)
            .expect("exit: no init process");
        for slot in 0..NPROC {
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(slot) };
            if shared.state != ProcState::None && shared.parent == me && slot != me {
                shared.parent = init_slot;
                if shared.state == ProcState::Zombie {
                    self.pool[init_slot].child_wait.wakeup_all();
                }
            }
        }

        // Tell the parent.
        self.post_signal_locked(
            parent,
            SigInfo {
                signo: SIGCHLD,
                code: 0,
                // SAFETY: the table lock is held.
                pid: unsafe { self.shared_raw(me) }.pid,
            },
        );
        self.pool[parent].child_wait.wakeup_all();

        // Become a zombie and give up the CPU for good. The run-queue
        // lock is held across the switch; holding it until the scheduler
        // resumes keeps the reaper from seeing a half-dead thread.
        let mut sched = kernel().sched().lock();
        {
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(me) };
            shared.xstate = status;
            shared.state = ProcState::Zombie;
        }
        {
            // SAFETY: the run-queue lock is held.
            let th = unsafe { self.thread_raw(me) };
            th.state = ThreadState::Zombie;
        }
        drop(g);
        // SAFETY: exactly the run-queue lock is held.
        unsafe { super::sched::switch_to_scheduler(&mut sched) };
        unreachable!("zombie exit");
    }

    /// Posts a signal to `slot`. The table lock must be held.
    fn post_signal_locked(&self, slot: usize, info: SigInfo) {
        // SAFETY: the table lock is held.
        let shared = unsafe { self.shared_raw(slot) };
        if shared.state == ProcState::None || shared.state == ProcState::Embryo {
            return;
        }
        if shared.sig.is_discarded(info.signo) {
            return;
        }
        shared.sig.post(info);

        match info.signo {
            SIGCONT => {
                if shared.state == ProcState::Stopped {
                    shared.state = ProcState::Active;
                    self.pool[slot].stop_wait.wakeup_all();
                }
            }
            SIGKILL => {
                self.pool[slot].kill();
                if shared.state == ProcState::Stopped {
                    shared.state = ProcState::Active;
                    self.pool[slot].stop_wait.wakeup_all();
                }
            }
            _ => {}
        }

        // Wake an interruptible sleeper so it notices the signal.
        let mut sched = kernel().sched().lock();
        // SAFETY: the run-queue lock is held.
        let th = unsafe { self.thread_raw(slot) };
        if th.state == ThreadState::Sleeping
            && (th.interruptible || info.signo == SIGKILL)
        {
            th.signaled = true;
            th.state = ThreadState::Runnable;
            th.sleeping_on = core::ptr::null();
            sched.run_queue.push(slot);
        }
        drop(sched);
    }

    /// Queues a kernel-generated signal (faults) for the current process.
    pub fn post_to_current(&self, signo: i32) {
        let cur = CurrentProc::get().expect("post_to_current: no process");
        let _g = self.table.lock();
        self.post_signal_locked(
            cur.slot(),
            SigInfo {
                signo,
                code: 0,
                pid: 0,
            },
        );
    }

    /// Generation: deliver `signo` to a pid or a process group.
    /// target > 0: that pid; 0: the caller's group; -1: every process the
    /// caller may signal except init; < -1: group |target|.
    pub fn signal_generate(&self, target: Pid, signo: i32, code: i32) -> Result<()> {
        if signo < 0 || signo as usize >= NSIG {
            return Err(KernelError::Inval);
        }
        let cur = CurrentProc::get().expect("kill: no process");
        let cred = cur.data().cred;
        let sender_pid = cur.pid();

        let g = self.table.lock();
        // SAFETY: the table lock is held.
        let my_pgid = unsafe { self.shared_raw(cur.slot()) }.pgid;

        let mut matched = false;
        for slot in 0..NPROC {
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(slot) };
            if shared.state == ProcState::None || shared.state == ProcState::Embryo {
                continue;
            }
            let hit = if target > 0 {
                shared.pid == target
            } else if target == 0 {
                shared.pgid == my_pgid
            } else if target == -1 {
                shared.pid != 1
            } else {
                shared.pgid == -target
            };
            if !hit {
                continue;
            }
            // Unprivileged senders may only signal processes of their
            // own user; the uid is mirrored into shared state for this.
            if cred.euid != 0 && shared.euid != cred.euid && shared.euid != cred.ruid {
                continue;
            }
            matched = true;
            if signo != 0 {
                self.post_signal_locked(
                    slot,
                    SigInfo {
                        signo,
                        code,
                        pid: sender_pid,
                    },
                );
            }
        }
        drop(g);

        if matched {
            Ok(())
        } else {
            Err(KernelError::Srch)
        }
    }

    /// Delivers pending signals at the return-to-user boundary.
    /// May not return (fatal defaults).
    pub fn deliver_signals(&self) {
        let cur = match CurrentProc::get() {
            Some(c) => c,
            None => return,
        };
        let me = cur.slot();

        loop {
            let mut g = self.table.lock();
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(me) };
            let Some(signo) = shared.sig.next_deliverable() else {
                drop(g);
                return;
            };
            shared.sig.pending.remove(signo);
            let info = shared.sig.info[signo as usize];
            let action = shared.sig.actions[signo as usize];
            let stub = shared.sig.stub;

            // SIGKILL and SIGSTOP cannot be caught.
            let handler = if signo == SIGKILL || signo == SIGSTOP {
                SIG_DFL
            } else {
                action.handler
            };

            match handler {
                SIG_IGN => {
                    drop(g);
                }
                SIG_DFL => match default_action(signo) {
                    Ignore | Continue => {
                        drop(g);
                    }
                    Terminate | Core => {
                        drop(g);
                        self.exit_current(signal_status(signo));
                    }
                    Stop => {
                        shared.state = ProcState::Stopped;
                        loop {
                            self.pool[me].stop_wait.sleep(&mut g);
                            // SAFETY: the table lock is held.
                            let shared = unsafe { self.shared_raw(me) };
                            if shared.state != ProcState::Stopped {
                                break;
                            }
                        }
                        drop(g);
                    }
                },
                _ => {
                    // Arrange the user handler frame; the stub trampoline
                    // calls the handler and then sigreturn.
                    let old_mask = shared.sig.mask;
                    shared.sig.mask.0 |= action.mask.0;
                    shared.sig.mask.add(signo);
                    drop(g);
                    if self.push_signal_frame(signo, info, handler, stub, old_mask).is_err() {
                        // A corrupt stack is fatal, like an uncaught
                        // SIGSEGV.
                        self.exit_current(signal_status(signo));
                    }
                }
            }
        }
    }

    /// Builds the user-mode handler frame for `signo`.
    fn push_signal_frame(
        &self,
        signo: i32,
        info: SigInfo,
        handler: usize,
        stub: usize,
        old_mask: SigSet,
    ) -> Result<()> {
        let cur = CurrentProc::get().expect("signal frame: no process");
        let data = cur.data();
        let allocator = kernel().allocator();
        let vm = data.vm.as_mut().expect("signal frame: no vm");

        let frame = SigFrame {
            mask: old_mask,
            info,
            tf: data.trap_frame,
        };
        let size = core::mem::size_of::<SigFrame>();
        let sp = (data.trap_frame.sp.checked_sub(size).ok_or(KernelError::Fault)?) & !0xf;
        if stub == 0 || stub >= USER_MAX {
            return Err(KernelError::Fault);
        }
        // SAFETY: SigFrame is plain data.
        let bytes = unsafe {
            core::slice::from_raw_parts(&frame as *const _ as *const u8, size)
        };
        vm.copy_out(sp, bytes, allocator)?;

        // Enter the trampoline: x0 = signo, x1 = &info, x2 = handler.
        data.trap_frame.sp = sp;
        data.trap_frame.pc = stub;
        data.trap_frame.x[0] = signo as usize;
        data.trap_frame.x[1] = sp + core::mem::offset_of!(SigFrame, info);
        data.trap_frame.x[2] = handler;
        Ok(())
    }

    /// sigreturn: restores the trap frame saved by `push_signal_frame`.
    pub fn signal_return(&self) -> Result<usize> {
        let cur = CurrentProc::get().expect("sigreturn: no process");
        let data = cur.data();
        let allocator = kernel().allocator();
        let vm = data.vm.as_mut().expect("sigreturn: no vm");

        let sp = data.trap_frame.sp;
        let mut bytes = [0u8; core::mem::size_of::<SigFrame>()];
        vm.copy_in(&mut bytes, sp, allocator)?;
        // SAFETY: SigFrame is plain data.
        let frame = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const SigFrame) };

        // The saved processor state is not trusted; keep the current one.
        let psr = data.trap_frame.psr;
        data.trap_frame = frame.tf;
        data.trap_frame.psr = psr;

        let g = self.table.lock();
        // SAFETY: the table lock is held.
        unsafe { self.shared_raw(cur.slot()) }.sig.mask = frame.mask;
        drop(g);

        Ok(data.trap_frame.x[0])
    }

    /// sigsuspend: install `mask`, wait for a deliverable signal, restore
    /// the old mask. Always "fails" with EINTR, per POSIX.
    pub fn sigsuspend(&self, mask: SigSet) -> Result<usize> {
        let cur = CurrentProc::get().expect("sigsuspend: no process");
        let me = cur.slot();

        let mut g = self.table.lock();
        // SAFETY: the table lock is held.
        let old = {
            let shared = unsafe { self.shared_raw(me) };
            let old = shared.sig.mask;
            shared.sig.mask = mask;
            old
        };
        loop {
            // SAFETY: the table lock is held.
            let shared = unsafe { self.shared_raw(me) };
            if shared.sig.next_deliverable().is_some() || self.pool[me].killed() {
                break;
            }
            if self.pool[me].suspend_wait.sleep_interruptible(&mut g).is_err() {
                break;
            }
        }
        // SAFETY: the table lock is held.
        unsafe { self.shared_raw(me) }.sig.mask = old;
        drop(g);
        Err(KernelError::Intr)
    }

    /// nanosleep, in clock ticks. EINTR if a signal arrives first.
    pub fn nanosleep(&self, ticks: u64) -> Result<()> {
        let mut now = kernel().ticks().lock();
        let end = *now + ticks;
        while *now < end {
            now.sleep_interruptible()?;
        }
        Ok(())
    }

    /// Timer-tick accounting for the process running on this CPU.
    pub fn update_times(&self, user: bool) {
        let Some(slot) = current_slot() else {
            return;
        };
        let _g = self.table.lock();
        // SAFETY: the table lock is held.
        let shared = unsafe { self.shared_raw(slot) };
        if user {
            shared.times.user += 1;
        } else {
            shared.times.system += 1;
        }
    }

    /// Sets the process group of `pid` (0 = caller). pgid 0 means "use
    /// the pid itself".
    pub fn set_pgid(&self, pid: Pid, pgid: Pid) -> Result<()> {
        if pgid < 0 {
            return Err(KernelError::Inval);
        }
        let cur = CurrentProc::get().expect("setpgid: no process");
        let mut g = self.table.lock();
        let slot = if pid == 0 {
            cur.slot()
        } else {
            self.pid_lookup(pid, &mut g).ok_or(KernelError::Srch)?
        };
        // SAFETY: the table lock is held.
        let shared = unsafe { self.shared_raw(slot) };
        shared.pgid = if pgid == 0 { shared.pid } else { pgid };
        Ok(())
    }

    pub fn get_pgid(&self, pid: Pid) -> Result<Pid> {
        let cur = CurrentProc::get().expect("getpgid: no process");
        let mut g = self.table.lock();
        let slot = if pid == 0 {
            cur.slot()
        } else {
            self.pid_lookup(pid, &mut g).ok_or(KernelError::Srch)?
        };
        // SAFETY: the table lock is held.
        Ok(unsafe { self.shared_raw(slot) }.pgid)
    }
}

/// The signal frame pushed on the user stack while a handler runs.
#[derive(Copy, Clone)]
#[repr(C)]
struct SigFrame {
    mask: SigSet,
    info: SigInfo,
    tf: crate::arch::TrapFrame,
}

/// A fork child's first scheduling arrives here; the run-queue lock is
/// still held from the scheduler's switch.
unsafe extern "C" fn forkret() -> ! {
    // SAFETY: the guard was never dropped on this side of the switch.
    unsafe { kernel().sched().unlock() };

    // The first process finishes kernel initialization that has to run
    // in process context: mounting the filesystem needs to sleep.
    kernel().finish_boot_in_process();

    let cur = CurrentProc::get().expect("forkret: no process");
    // SAFETY: returning to user space through the arch trap path.
    unsafe { crate::trap::user_trap_return(cur) }
}

/// A handle to the process running on this CPU.
#[derive(Copy, Clone)]
pub struct CurrentProc {
    slot: usize,
}

impl CurrentProc {
    pub fn get() -> Option<Self> {
        current_slot().map(|slot| Self { slot })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn proc(&self) -> &'static Proc {
        kernel().procs().pool(self.slot)
    }

    /// The process's private data. Only the process itself may call this,
    /// which is what makes the unguarded access sound.
    #[allow(clippy::mut_from_ref)]
    pub fn data(&self) -> &'static mut ProcData {
        // SAFETY: ProcData is private to the current process.
        unsafe { kernel().procs().data_raw(self.slot) }
    }

    pub fn pid(&self) -> Pid {
        let procs = kernel().procs();
        let _g = procs.table().lock();
        // SAFETY: the table lock is held.
        unsafe { procs.shared_raw(self.slot) }.pid
    }

    pub fn cred(&self) -> Cred {
        self.data().cred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_words() {
        // WEXITSTATUS(status) = (status >> 8) & 0xff.
        assert_eq!(exit_status(42) >> 8 & 0xff, 42);
        assert_eq!(exit_status(0x1ff) >> 8 & 0xff, 0xff);
        // Death by signal keeps the signal in the low bits.
        assert_eq!(signal_status(crate::signal::SIGSEGV), 11);
        assert_eq!(signal_status(crate::signal::SIGSEGV) & 0x7f, 11);
    }

    #[test]
    fn wait_selectors() {
        let mut shared = ProcShared::new();
        shared.pid = 7;
        shared.pgid = 3;
        assert!(Procs::wait_matches(WaitTarget::Any, &shared, 99));
        assert!(Procs::wait_matches(WaitTarget::Pid(7), &shared, 99));
        assert!(!Procs::wait_matches(WaitTarget::Pid(8), &shared, 99));
        assert!(Procs::wait_matches(WaitTarget::CallerGroup, &shared, 3));
        assert!(!Procs::wait_matches(WaitTarget::CallerGroup, &shared, 4));
        assert!(Procs::wait_matches(WaitTarget::Group(3), &shared, 99));
        assert!(!Procs::wait_matches(WaitTarget::Group(4), &shared, 99));
    }
}
