//! System call dispatch.
//!
//! Arguments arrive in the trap frame's registers; the number is in x8.
//! A syscall returns a small non-negative integer or `-errno`.

use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::proc::CurrentProc;

mod file;
mod proc;

pub const SYS_FORK: usize = 1;
pub const SYS_EXEC: usize = 2;
pub const SYS_EXIT: usize = 3;
pub const SYS_WAIT: usize = 4;
pub const SYS_GETPID: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_SIGACTION: usize = 7;
pub const SYS_SIGRETURN: usize = 8;
pub const SYS_SIGPROCMASK: usize = 9;
pub const SYS_NANOSLEEP: usize = 10;
pub const SYS_OPEN: usize = 11;
pub const SYS_CLOSE: usize = 12;
pub const SYS_READ: usize = 13;
pub const SYS_WRITE: usize = 14;
pub const SYS_LSEEK: usize = 15;
pub const SYS_STAT: usize = 16;
pub const SYS_FSTAT: usize = 17;
pub const SYS_CHDIR: usize = 18;
pub const SYS_CHMOD: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_MKNOD: usize = 21;
pub const SYS_LINK: usize = 22;
pub const SYS_UNLINK: usize = 23;
pub const SYS_RMDIR: usize = 24;
pub const SYS_DUP: usize = 25;
pub const SYS_PIPE: usize = 26;
pub const SYS_GETDENTS: usize = 27;
pub const SYS_IOCTL: usize = 28;
pub const SYS_SOCKET: usize = 29;
pub const SYS_BIND: usize = 30;
pub const SYS_LISTEN: usize = 31;
pub const SYS_ACCEPT: usize = 32;
pub const SYS_CONNECT: usize = 33;
pub const SYS_SEND: usize = 34;
pub const SYS_RECV: usize = 35;
pub const SYS_SETSOCKOPT: usize = 36;
pub const SYS_BRK: usize = 37;
pub const SYS_UNAME: usize = 38;
pub const SYS_GETPPID: usize = 39;
pub const SYS_DUP2: usize = 40;
pub const SYS_UMASK: usize = 41;
pub const SYS_TIMES: usize = 42;
pub const SYS_GETPGID: usize = 43;
pub const SYS_SETPGID: usize = 44;
pub const SYS_SIGPENDING: usize = 45;
pub const SYS_SIGSUSPEND: usize = 46;
pub const SYS_FCNTL: usize = 47;

/// Runs the system call named by the trap frame. The returned word is
/// what lands in the user's x0.
pub fn dispatch(cur: CurrentProc) -> isize {
    let num = cur.data().trap_frame.syscall_no();
    let r = match num {
        SYS_FORK => proc::sys_fork(cur),
        SYS_EXEC => proc::sys_exec(cur),
        SYS_EXIT => proc::sys_exit(cur),
        SYS_WAIT => proc::sys_wait(cur),
        SYS_GETPID => proc::sys_getpid(cur),
        SYS_GETPPID => proc::sys_getppid(cur),
        SYS_KILL => proc::sys_kill(cur),
        SYS_SIGACTION => proc::sys_sigaction(cur),
        SYS_SIGRETURN => proc::sys_sigreturn(cur),
        SYS_SIGPROCMASK => proc::sys_sigprocmask(cur),
        SYS_SIGPENDING => proc::sys_sigpending(cur),
        SYS_SIGSUSPEND => proc::sys_sigsuspend(cur),
        SYS_NANOSLEEP => proc::sys_nanosleep(cur),
        SYS_BRK => proc::sys_brk(cur),
        SYS_UNAME => proc::sys_uname(cur),
        SYS_TIMES => proc::sys_times(cur),
        SYS_GETPGID => proc::sys_getpgid(cur),
        SYS_SETPGID => proc::sys_setpgid(cur),
        SYS_OPEN => file::sys_open(cur),
        SYS_CLOSE => file::sys_close(cur),
        SYS_READ => file::sys_read(cur),
        SYS_WRITE => file::sys_write(cur),
        SYS_LSEEK => file::sys_lseek(cur),
        SYS_STAT => file::sys_stat(cur),
        SYS_FSTAT => file::sys_fstat(cur),
        SYS_CHDIR => file::sys_chdir(cur),
        SYS_CHMOD => file::sys_chmod(cur),
        SYS_MKDIR => file::sys_mkdir(cur),
        SYS_MKNOD => file::sys_mknod(cur),
        SYS_LINK => file::sys_link(cur),
        SYS_UNLINK => file::sys_unlink(cur),
        SYS_RMDIR => file::sys_rmdir(cur),
        SYS_DUP => file::sys_dup(cur),
        SYS_DUP2 => file::sys_dup2(cur),
        SYS_PIPE => file::sys_pipe(cur),
        SYS_GETDENTS => file::sys_getdents(cur),
        SYS_IOCTL => file::sys_ioctl(cur),
        SYS_FCNTL => file::sys_fcntl(cur),
        SYS_UMASK => file::sys_umask(cur),
        // The network stack is an external collaborator; its syscalls
        // exist but are not wired up here.
        SYS_SOCKET | SYS_BIND | SYS_LISTEN | SYS_ACCEPT | SYS_CONNECT | SYS_SEND | SYS_RECV
        | SYS_SETSOCKOPT => Err(KernelError::NoSys),
        _ => {
            log::warn!("pid {}: unknown syscall {}", cur.pid(), num);
            Err(KernelError::NoSys)
        }
    };
    match r {
        Ok(v) => v as isize,
        Err(e) => e.to_errno(),
    }
}

impl CurrentProc {
    /// The nth register argument.
    pub fn arg(&self, n: usize) -> usize {
        self.data().trap_frame.arg(n)
    }

    pub fn arg_i32(&self, n: usize) -> i32 {
        self.arg(n) as i32
    }

    /// Copies a NUL-terminated user string argument into `buf`, returning
    /// its length.
    pub fn arg_str(&self, n: usize, buf: &mut [u8]) -> Result<usize> {
        let addr = self.arg(n);
        if addr == 0 {
            return Err(KernelError::Fault);
        }
        self.data()
            .vm
            .as_mut()
            .ok_or(KernelError::Fault)?
            .copy_in_str(buf, addr, kernel().allocator())
    }

    /// Copies `dst.len()` bytes from user address `addr`.
    pub fn copy_in(&self, dst: &mut [u8], addr: usize) -> Result<()> {
        self.data()
            .vm
            .as_mut()
            .ok_or(KernelError::Fault)?
            .copy_in(dst, addr, kernel().allocator())
    }

    /// Copies `src` to user address `addr`.
    pub fn copy_out(&self, addr: usize, src: &[u8]) -> Result<()> {
        self.data()
            .vm
            .as_mut()
            .ok_or(KernelError::Fault)?
            .copy_out(addr, src, kernel().allocator())
    }

    /// Copies a plain-data value to user address `addr`.
    pub fn copy_out_val<T: Copy>(&self, addr: usize, val: &T) -> Result<()> {
        // SAFETY: T is plain data by the bound's convention here; every
        // caller passes repr(C) value types.
        let bytes = unsafe {
            core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.copy_out(addr, bytes)
    }

    /// Copies a plain-data value from user address `addr`.
    pub fn copy_in_val<T: Copy + Default>(&self, addr: usize) -> Result<T> {
        let mut val = T::default();
        // SAFETY: as in copy_out_val.
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(
                &mut val as *mut T as *mut u8,
                core::mem::size_of::<T>(),
            )
        };
        self.copy_in(bytes, addr)?;
        Ok(val)
    }
}
