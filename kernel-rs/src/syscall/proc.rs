//! Process, signal and time system calls.

use crate::error::{KernelError, Result};
use crate::exec;
use crate::kernel::kernel;
use crate::param::{PATH_MAX, TICKS_PER_SECOND};
use crate::proc::{CurrentProc, WaitTarget};
use crate::signal::{valid_signo, SigAction, SigSet, SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK};

pub fn sys_fork(_cur: CurrentProc) -> Result<usize> {
    Ok(kernel().procs().fork()? as usize)
}

pub fn sys_exec(cur: CurrentProc) -> Result<usize> {
    let mut path = [0u8; PATH_MAX];
    let len = cur.arg_str(0, &mut path)?;
    if len == 0 {
        return Err(KernelError::NoEnt);
    }
    let uargv = cur.arg(1);
    let uenvp = cur.arg(2);
    exec::exec(cur, &path[..len], uargv, uenvp)
}

pub fn sys_exit(cur: CurrentProc) -> Result<usize> {
    let status = cur.arg_i32(0);
    kernel().procs().exit_current(crate::proc::exit_status(status));
}

/// wait(pid, &status, options)
pub fn sys_wait(cur: CurrentProc) -> Result<usize> {
    let pid = cur.arg_i32(0);
    let status_addr = cur.arg(1);
    let options = cur.arg_i32(2);

    let target = if pid > 0 {
        WaitTarget::Pid(pid)
    } else if pid == 0 {
        WaitTarget::CallerGroup
    } else if pid == -1 {
        WaitTarget::Any
    } else {
        WaitTarget::Group(-pid)
    };

    let (child, status) = kernel().procs().wait(target, options)?;
    if child != 0 && status_addr != 0 {
        cur.copy_out_val(status_addr, &status)?;
    }
    Ok(child as usize)
}

pub fn sys_getpid(cur: CurrentProc) -> Result<usize> {
    Ok(cur.pid() as usize)
}

pub fn sys_getppid(cur: CurrentProc) -> Result<usize> {
    let procs = kernel().procs();
    let _g = procs.table().lock();
    // SAFETY: the table lock is held.
    let parent = unsafe { procs.shared_raw(cur.slot()) }.parent;
    // SAFETY: the table lock is held.
    Ok(unsafe { procs.shared_raw(parent) }.pid as usize)
}

/// kill(pid, signo)
pub fn sys_kill(cur: CurrentProc) -> Result<usize> {
    let pid = cur.arg_i32(0);
    let signo = cur.arg_i32(1);
    let _ = cur;
    kernel().procs().signal_generate(pid, signo, 0)?;
    Ok(0)
}

/// The user-visible sigaction record.
#[derive(Copy, Clone, Default)]
#[repr(C)]
struct UserSigAction {
    handler: usize,
    mask: u32,
    flags: u32,
}

/// sigaction(signo, stub, &act, &oldact)
///
/// `stub` is the user trampoline that calls the handler and sigreturn;
/// the C library passes it with every registration.
pub fn sys_sigaction(cur: CurrentProc) -> Result<usize> {
    let signo = cur.arg_i32(0);
    let stub = cur.arg(1);
    let act_addr = cur.arg(2);
    let oldact_addr = cur.arg(3);

    if !valid_signo(signo) || signo == crate::signal::SIGKILL || signo == crate::signal::SIGSTOP
    {
        return Err(KernelError::Inval);
    }

    let new = if act_addr != 0 {
        Some(cur.copy_in_val::<UserSigAction>(act_addr)?)
    } else {
        None
    };

    let procs = kernel().procs();
    let g = procs.table().lock();
    // SAFETY: the table lock is held.
    let shared = unsafe { procs.shared_raw(cur.slot()) };
    let old = shared.sig.actions[signo as usize];
    if let Some(new) = new {
        shared.sig.actions[signo as usize] = SigAction {
            handler: new.handler,
            mask: SigSet(new.mask),
            flags: new.flags,
        };
        shared.sig.stub = stub;
    }
    drop(g);

    if oldact_addr != 0 {
        cur.copy_out_val(
            oldact_addr,
            &UserSigAction {
                handler: old.handler,
                mask: old.mask.0,
                flags: old.flags,
            },
        )?;
    }
    Ok(0)
}

pub fn sys_sigreturn(cur: CurrentProc) -> Result<usize> {
    kernel().procs().signal_return().map(|_| ())?;
    // The restored frame's x0 is the interrupted value; dispatch will
    // overwrite x0 with our return value, so return exactly that.
    Ok(cur.data().trap_frame.x[0])
}

/// sigprocmask(how, &set, &oldset)
pub fn sys_sigprocmask(cur: CurrentProc) -> Result<usize> {
    let how = cur.arg_i32(0);
    let set_addr = cur.arg(1);
    let old_addr = cur.arg(2);

    let new = if set_addr != 0 {
        Some(cur.copy_in_val::<u32>(set_addr)?)
    } else {
        None
    };

    let procs = kernel().procs();
    let g = procs.table().lock();
    // SAFETY: the table lock is held.
    let shared = unsafe { procs.shared_raw(cur.slot()) };
    let old = shared.sig.mask;
    if let Some(new) = new {
        let mut mask = match how {
            SIG_BLOCK => SigSet(old.0 | new),
            SIG_UNBLOCK => SigSet(old.0 & !new),
            SIG_SETMASK => SigSet(new),
            _ => return Err(KernelError::Inval),
        };
        // SIGKILL and SIGSTOP are never blockable.
        mask.remove(crate::signal::SIGKILL);
        mask.remove(crate::signal::SIGSTOP);
        shared.sig.mask = mask;
    }
    drop(g);

    if old_addr != 0 {
        cur.copy_out_val(old_addr, &old.0)?;
    }
    Ok(0)
}

pub fn sys_sigpending(cur: CurrentProc) -> Result<usize> {
    let addr = cur.arg(0);
    let procs = kernel().procs();
    let g = procs.table().lock();
    // SAFETY: the table lock is held.
    let pending = unsafe { procs.shared_raw(cur.slot()) }.sig.pending;
    drop(g);
    cur.copy_out_val(addr, &pending.0)?;
    Ok(0)
}

pub fn sys_sigsuspend(cur: CurrentProc) -> Result<usize> {
    let addr = cur.arg(0);
    let mask = SigSet(cur.copy_in_val::<u32>(addr)?);
    kernel().procs().sigsuspend(mask)
}

/// nanosleep(&req, &rem)
pub fn sys_nanosleep(cur: CurrentProc) -> Result<usize> {
    let req_addr = cur.arg(0);
    let rem_addr = cur.arg(1);

    #[derive(Copy, Clone, Default)]
    #[repr(C)]
    struct Timespec {
        sec: i64,
        nsec: i64,
    }

    let req = cur.copy_in_val::<Timespec>(req_addr)?;
    if req.sec < 0 || !(0..1_000_000_000).contains(&req.nsec) {
        return Err(KernelError::Inval);
    }
    let ticks = req.sec as u64 * TICKS_PER_SECOND
        + (req.nsec as u64 * TICKS_PER_SECOND).div_ceil(1_000_000_000);

    let r = kernel().procs().nanosleep(ticks);
    if r.is_err() && rem_addr != 0 {
        // Interrupted: report that the whole interval remains, which is
        // the coarsest correct answer at tick granularity.
        cur.copy_out_val(rem_addr, &req)?;
    }
    r.map(|()| 0)
}

/// brk via process_grow: moves the break by a signed delta, returning the
/// old break.
pub fn sys_brk(cur: CurrentProc) -> Result<usize> {
    let delta = cur.arg(0) as isize;
    let data = cur.data();
    let vm = data.vm.as_mut().ok_or(KernelError::NoMem)?;
    vm.grow(delta, kernel().allocator())
}

/// The utsname record returned by uname.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Utsname {
    pub sysname: [u8; 65],
    pub nodename: [u8; 65],
    pub release: [u8; 65],
    pub version: [u8; 65],
    pub machine: [u8; 65],
}

fn uts_field(s: &[u8]) -> [u8; 65] {
    let mut f = [0u8; 65];
    f[..s.len()].copy_from_slice(s);
    f
}

pub fn sys_uname(cur: CurrentProc) -> Result<usize> {
    let addr = cur.arg(0);
    let node = kernel().nodename();
    let uts = Utsname {
        sysname: uts_field(b"Argentum"),
        nodename: uts_field(if node.is_empty() { b"localhost" } else { node.as_slice() }),
        release: uts_field(b"0.1.0"),
        version: uts_field(b"argentum-kernel"),
        machine: uts_field(b"arm"),
    };
    cur.copy_out_val(addr, &uts)?;
    Ok(0)
}

/// times(&tms): returns ticks since boot.
pub fn sys_times(cur: CurrentProc) -> Result<usize> {
    let addr = cur.arg(0);

    #[derive(Copy, Clone, Default)]
    #[repr(C)]
    struct Tms {
        utime: u64,
        stime: u64,
        cutime: u64,
        cstime: u64,
    }

    let procs = kernel().procs();
    let g = procs.table().lock();
    // SAFETY: the table lock is held.
    let times = unsafe { procs.shared_raw(cur.slot()) }.times;
    drop(g);

    if addr != 0 {
        cur.copy_out_val(
            addr,
            &Tms {
                utime: times.user,
                stime: times.system,
                cutime: times.child_user,
                cstime: times.child_system,
            },
        )?;
    }
    Ok(*kernel().ticks().lock() as usize)
}

pub fn sys_getpgid(cur: CurrentProc) -> Result<usize> {
    let pid = cur.arg_i32(0);
    Ok(kernel().procs().get_pgid(pid)? as usize)
}

pub fn sys_setpgid(cur: CurrentProc) -> Result<usize> {
    let pid = cur.arg_i32(0);
    let pgid = cur.arg_i32(1);
    kernel().procs().set_pgid(pid, pgid)?;
    Ok(0)
}
