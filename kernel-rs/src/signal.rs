//! Signal state and bookkeeping.
//!
//! Generation marks a bit in the target's pending set (with a `SigInfo`
//! payload per signal number) and, for an interruptible sleeper, wakes the
//! thread. Delivery happens on the return-to-user path: the lowest-numbered
//! unmasked pending signal is taken, its action consulted, and either the
//! default applies or a handler frame is built on the user stack with the
//! `signal_stub` trampoline. All of this state lives in `ProcShared` and is
//! guarded by the process table lock.

use crate::param::NSIG;
use crate::proc::Pid;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGWINCH: i32 = 28;

/// Disposition constants in `SigAction::handler`.
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

/// `sigprocmask` operations.
pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// A set of signal numbers 1..NSIG, one bit each.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct SigSet(pub u32);

pub fn valid_signo(signo: i32) -> bool {
    signo >= 1 && (signo as usize) < NSIG
}

impl SigSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn single(signo: i32) -> Self {
        Self(1 << signo as u32)
    }

    pub fn add(&mut self, signo: i32) {
        self.0 |= 1 << signo as u32;
    }

    pub fn remove(&mut self, signo: i32) {
        self.0 &= !(1 << signo as u32);
    }

    pub fn contains(&self, signo: i32) -> bool {
        self.0 & (1 << signo as u32) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The lowest-numbered signal in the set.
    pub fn lowest(&self) -> Option<i32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as i32)
        }
    }
}

/// The action table entry for one signal.
#[derive(Copy, Clone)]
pub struct SigAction {
    /// `SIG_DFL`, `SIG_IGN`, or a user handler address.
    pub handler: usize,
    /// Signals additionally blocked while the handler runs.
    pub mask: SigSet,
    pub flags: u32,
}

impl SigAction {
    pub const fn default_action() -> Self {
        Self {
            handler: SIG_DFL,
            mask: SigSet::empty(),
            flags: 0,
        }
    }
}

/// Payload carried from generation to delivery.
#[derive(Copy, Clone, Default)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    /// Sending process, or 0 for the kernel.
    pub pid: Pid,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DefaultAction {
    Terminate,
    Core,
    Ignore,
    Stop,
    Continue,
}

/// The default action for each signal.
pub fn default_action(signo: i32) -> DefaultAction {
    match signo {
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV => DefaultAction::Core,
        _ => DefaultAction::Terminate,
    }
}

/// Per-process signal state.
pub struct SignalState {
    pub actions: [SigAction; NSIG],
    pub pending: SigSet,
    pub info: [SigInfo; NSIG],
    pub mask: SigSet,
    /// User-space trampoline that calls the handler and then sigreturn.
    pub stub: usize,
}

impl SignalState {
    pub const fn new() -> Self {
        Self {
            actions: [SigAction::default_action(); NSIG],
            pending: SigSet::empty(),
            info: [SigInfo {
                signo: 0,
                code: 0,
                pid: 0,
            }; NSIG],
            mask: SigSet::empty(),
            stub: 0,
        }
    }

    /// Queue `info.signo` for delivery. SIGKILL and SIGSTOP cannot be
    /// masked or handled, so their pending bits always matter.
    pub fn post(&mut self, info: SigInfo) {
        self.pending.add(info.signo);
        self.info[info.signo as usize] = info;
    }

    /// The lowest-numbered pending signal that is not masked, if any.
    /// SIGKILL and SIGSTOP ignore the mask.
    pub fn next_deliverable(&self) -> Option<i32> {
        let mut mask = self.mask;
        mask.remove(SIGKILL);
        mask.remove(SIGSTOP);
        SigSet(self.pending.0 & !mask.0).lowest()
    }

    /// Would `signo` do anything at all to this process right now?
    /// Generation skips ignored signals entirely.
    pub fn is_discarded(&self, signo: i32) -> bool {
        let action = &self.actions[signo as usize];
        if signo == SIGKILL || signo == SIGSTOP || signo == SIGCONT {
            return false;
        }
        match action.handler {
            SIG_IGN => true,
            SIG_DFL => default_action(signo) == DefaultAction::Ignore,
            _ => false,
        }
    }

    /// Fork keeps the action table and the mask; pending signals are not
    /// inherited.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            actions: self.actions,
            pending: SigSet::empty(),
            info: [SigInfo::default(); NSIG],
            mask: self.mask,
            stub: self.stub,
        }
    }

    /// Exec resets handled signals to the default disposition; ignored and
    /// default dispositions survive, as does the mask.
    pub fn reset_for_exec(&mut self) {
        for action in self.actions.iter_mut() {
            if action.handler != SIG_IGN {
                *action = SigAction::default_action();
            }
        }
        self.stub = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_pending_wins() {
        let mut s = SignalState::new();
        s.post(SigInfo {
            signo: SIGTERM,
            code: 0,
            pid: 1,
        });
        s.post(SigInfo {
            signo: SIGINT,
            code: 0,
            pid: 1,
        });
        assert_eq!(s.next_deliverable(), Some(SIGINT));
    }

    #[test]
    fn masked_signals_wait() {
        let mut s = SignalState::new();
        s.mask.add(SIGINT);
        s.post(SigInfo {
            signo: SIGINT,
            code: 0,
            pid: 1,
        });
        assert_eq!(s.next_deliverable(), None);
        s.mask.remove(SIGINT);
        assert_eq!(s.next_deliverable(), Some(SIGINT));
    }

    #[test]
    fn kill_ignores_the_mask() {
        let mut s = SignalState::new();
        s.mask = SigSet(!0);
        s.post(SigInfo {
            signo: SIGKILL,
            code: 0,
            pid: 1,
        });
        assert_eq!(s.next_deliverable(), Some(SIGKILL));
    }

    #[test]
    fn setmask_round_trip_restores_prior_mask() {
        // sigprocmask(SETMASK, &m, &old); sigprocmask(SETMASK, &old, NULL).
        let mut s = SignalState::new();
        s.mask.add(SIGHUP);
        let old = s.mask;
        s.mask = SigSet(0xbeef);
        s.mask = old;
        assert!(s.mask.contains(SIGHUP));
        assert_eq!(s.mask, old);
    }

    #[test]
    fn fork_drops_pending_keeps_actions() {
        let mut s = SignalState::new();
        s.actions[SIGUSR1 as usize].handler = 0x4000;
        s.post(SigInfo {
            signo: SIGUSR2,
            code: 0,
            pid: 3,
        });
        let child = s.clone_for_fork();
        assert_eq!(child.actions[SIGUSR1 as usize].handler, 0x4000);
        assert!(child.pending.is_empty());
    }

    #[test]
    fn exec_resets_handlers_but_not_ignores() {
        let mut s = SignalState::new();
        s.actions[SIGUSR1 as usize].handler = 0x4000;
        s.actions[SIGUSR2 as usize].handler = SIG_IGN;
        s.reset_for_exec();
        assert_eq!(s.actions[SIGUSR1 as usize].handler, SIG_DFL);
        assert_eq!(s.actions[SIGUSR2 as usize].handler, SIG_IGN);
    }

    #[test]
    fn discarded_signals() {
        let s = SignalState::new();
        assert!(s.is_discarded(SIGCHLD));
        assert!(!s.is_discarded(SIGTERM));
        assert!(!s.is_discarded(SIGKILL));
    }
}
