//! File and filesystem system calls.

use crate::error::{KernelError, Result};
use crate::file::{
    File, FileType, O_ACCMODE, O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY,
};
use crate::fs::stat::{is_dir, S_IFMT, S_IFREG};
use crate::fs::{self, InodeRef};
use crate::kernel::kernel;
use crate::param::{BSIZE, PATH_MAX};
use crate::pipe;
use crate::proc::CurrentProc;

/// fcntl commands.
const F_DUPFD: i32 = 0;
const F_GETFD: i32 = 1;
const F_SETFD: i32 = 2;
const F_GETFL: i32 = 3;
const FD_CLOEXEC: i32 = 1;

fn with_path<T>(cur: &CurrentProc, n: usize, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
    let mut buf = [0u8; PATH_MAX];
    let len = cur.arg_str(n, &mut buf)?;
    if len == 0 {
        return Err(KernelError::NoEnt);
    }
    f(&buf[..len])
}

fn cwd(cur: &CurrentProc) -> Result<&InodeRef> {
    cur.data().cwd.as_ref().ok_or(KernelError::NoEnt)
}

/// open(path, flags, mode)
pub fn sys_open(cur: CurrentProc) -> Result<usize> {
    let flags = cur.arg(1) as u32;
    let mode = cur.arg(2) as u16;
    let cred = cur.cred();

    with_path(&cur, 0, |path| {
        let itable = kernel().itable();

        let ip = if flags & O_CREAT != 0 {
            match fs::fs_create(
                path,
                (mode & 0o7777) | S_IFREG,
                0,
                cwd(&cur)?,
                &cred,
                cur.data().cmask,
            ) {
                Ok(ip) => ip,
                Err(KernelError::Exist) if flags & O_EXCL == 0 => {
                    fs::name_lookup(path, cwd(&cur)?, &cred)?
                }
                Err(e) => return Err(e),
            }
        } else {
            fs::name_lookup(path, cwd(&cur)?, &cred)?
        };

        let readable = flags & O_ACCMODE != O_WRONLY;
        let writable = flags & O_ACCMODE != O_RDONLY;

        let mut g = itable.lock(&ip);
        let r = (|| {
            if is_dir(g.mode) && writable {
                return Err(KernelError::IsDir);
            }
            if writable && !fs::can_write(&g, &cred) {
                return Err(KernelError::Perm);
            }
            if readable && !fs::can_read(&g, &cred) {
                return Err(KernelError::Perm);
            }
            if flags & O_TRUNC != 0 && writable {
                fs::inode_truncate(&mut g, &cred)?;
            }
            Ok(())
        })();
        if let Err(e) = r {
            itable.unlock_put(g, ip);
            return Err(e);
        }
        itable.unlock(g);

        let file = match kernel().ftable().alloc(File {
            typ: FileType::Inode {
                ip,
                off: core::cell::UnsafeCell::new(0),
            },
            readable,
            writable,
            flags: flags & O_APPEND,
        }) {
            Ok(f) => f,
            Err(f) => {
                kernel().ftable().discard(f);
                return Err(KernelError::MFile);
            }
        };

        let fd = {
            let mut fds = cur.proc().files.lock();
            fds.alloc(file)
        };
        match fd {
            Ok(fd) => Ok(fd),
            Err(e) => {
                kernel().ftable().close(file);
                Err(e)
            }
        }
    })
}

pub fn sys_close(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let entry = {
        let mut fds = cur.proc().files.lock();
        fds.take(fd)?
    };
    kernel().ftable().close(entry.file);
    Ok(0)
}

pub fn sys_read(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let addr = cur.arg(1);
    let mut n = cur.arg(2);
    let entry = cur.proc().files.lock().get(fd)?;
    let cred = cur.cred();

    let mut total = 0;
    let mut chunk = [0u8; BSIZE];
    while n > 0 {
        let want = n.min(chunk.len());
        let got = kernel().ftable().read(entry.file, &mut chunk[..want], &cred)?;
        if got == 0 {
            break;
        }
        cur.copy_out(addr + total, &chunk[..got])?;
        total += got;
        n -= got;
        if got < want {
            break;
        }
    }
    Ok(total)
}

pub fn sys_write(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let addr = cur.arg(1);
    let mut n = cur.arg(2);
    let entry = cur.proc().files.lock().get(fd)?;
    let cred = cur.cred();

    let mut total = 0;
    let mut chunk = [0u8; BSIZE];
    while n > 0 {
        let want = n.min(chunk.len());
        cur.copy_in(&mut chunk[..want], addr + total)?;
        let put = match kernel().ftable().write(entry.file, &chunk[..want], &cred) {
            Ok(put) => put,
            Err(KernelError::Pipe) => {
                // A broken pipe also raises SIGPIPE at the writer.
                kernel().procs().post_to_current(crate::signal::SIGPIPE);
                return Err(KernelError::Pipe);
            }
            Err(e) => return Err(e),
        };
        total += put;
        n -= put;
        if put < want {
            break;
        }
    }
    Ok(total)
}

/// lseek(fd, offset, whence)
pub fn sys_lseek(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let offset = cur.arg_i32(1);
    let whence = cur.arg_i32(2);
    let entry = cur.proc().files.lock().get(fd)?;
    Ok(kernel().ftable().seek(entry.file, offset, whence)? as usize)
}

pub fn sys_stat(cur: CurrentProc) -> Result<usize> {
    let addr = cur.arg(1);
    let cred = cur.cred();
    let st = with_path(&cur, 0, |path| {
        let itable = kernel().itable();
        let ip = fs::name_lookup(path, cwd(&cur)?, &cred)?;
        let g = itable.lock(&ip);
        let st = fs::inode_stat(&g);
        itable.unlock_put(g, ip);
        Ok(st)
    })?;
    cur.copy_out_val(addr, &st)?;
    Ok(0)
}

pub fn sys_fstat(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let addr = cur.arg(1);
    let entry = cur.proc().files.lock().get(fd)?;
    let st = kernel().ftable().stat(entry.file)?;
    cur.copy_out_val(addr, &st)?;
    Ok(0)
}

pub fn sys_chdir(cur: CurrentProc) -> Result<usize> {
    let cred = cur.cred();
    with_path(&cur, 0, |path| {
        let ip = fs::name_lookup(path, cwd(&cur)?, &cred)?;
        if let Err(e) = fs::fs_chdir_inode(&ip, &cred) {
            kernel().itable().put(ip);
            return Err(e);
        }
        let data = cur.data();
        if let Some(old) = data.cwd.replace(ip) {
            kernel().itable().put(old);
        }
        Ok(0)
    })
}

pub fn sys_chmod(cur: CurrentProc) -> Result<usize> {
    let mode = cur.arg(1) as u16;
    let cred = cur.cred();
    with_path(&cur, 0, |path| {
        fs::fs_chmod(path, mode, cwd(&cur)?, &cred)?;
        Ok(0)
    })
}

pub fn sys_mkdir(cur: CurrentProc) -> Result<usize> {
    let mode = cur.arg(1) as u16;
    let cred = cur.cred();
    with_path(&cur, 0, |path| {
        let ip = fs::fs_create(
            path,
            (mode & 0o7777) | crate::fs::stat::S_IFDIR,
            0,
            cwd(&cur)?,
            &cred,
            cur.data().cmask,
        )?;
        kernel().itable().put(ip);
        Ok(0)
    })
}

/// mknod(path, mode, dev)
pub fn sys_mknod(cur: CurrentProc) -> Result<usize> {
    let mode = cur.arg(1) as u16;
    let rdev = cur.arg(2) as u32;
    let cred = cur.cred();
    if mode & S_IFMT == 0 {
        return Err(KernelError::Inval);
    }
    with_path(&cur, 0, |path| {
        let ip = fs::fs_create(path, mode, rdev, cwd(&cur)?, &cred, cur.data().cmask)?;
        kernel().itable().put(ip);
        Ok(0)
    })
}

pub fn sys_link(cur: CurrentProc) -> Result<usize> {
    let cred = cur.cred();
    let mut buf2 = [0u8; PATH_MAX];
    let len2 = cur.arg_str(1, &mut buf2)?;
    if len2 == 0 {
        return Err(KernelError::NoEnt);
    }
    with_path(&cur, 0, |path1| {
        fs::fs_link(path1, &buf2[..len2], cwd(&cur)?, &cred)?;
        Ok(0)
    })
}

pub fn sys_unlink(cur: CurrentProc) -> Result<usize> {
    let cred = cur.cred();
    with_path(&cur, 0, |path| {
        fs::fs_unlink(path, cwd(&cur)?, &cred)?;
        Ok(0)
    })
}

pub fn sys_rmdir(cur: CurrentProc) -> Result<usize> {
    let cred = cur.cred();
    with_path(&cur, 0, |path| {
        fs::fs_rmdir(path, cwd(&cur)?, &cred)?;
        Ok(0)
    })
}

pub fn sys_dup(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let mut fds = cur.proc().files.lock();
    let entry = fds.get(fd)?;
    let file = kernel().ftable().dup(entry.file);
    match fds.alloc(file) {
        Ok(newfd) => Ok(newfd),
        Err(e) => {
            drop(fds);
            kernel().ftable().close(file);
            Err(e)
        }
    }
}

pub fn sys_dup2(cur: CurrentProc) -> Result<usize> {
    let oldfd = cur.arg(0);
    let newfd = cur.arg(1);
    let mut fds = cur.proc().files.lock();
    let entry = fds.get(oldfd)?;
    if oldfd == newfd {
        return Ok(newfd);
    }
    let file = kernel().ftable().dup(entry.file);
    let replaced = match fds.install_at(newfd, file) {
        Ok(r) => r,
        Err(e) => {
            drop(fds);
            kernel().ftable().close(file);
            return Err(e);
        }
    };
    drop(fds);
    if let Some(old) = replaced {
        kernel().ftable().close(old.file);
    }
    Ok(newfd)
}

/// pipe(fds[2])
pub fn sys_pipe(cur: CurrentProc) -> Result<usize> {
    let addr = cur.arg(0);
    let (rend, wend) = pipe::alloc()?;

    let rfile = match kernel().ftable().alloc(File {
        typ: FileType::Pipe { end: rend },
        readable: true,
        writable: false,
        flags: 0,
    }) {
        Ok(f) => f,
        Err(f) => {
            kernel().ftable().discard(f);
            pipe::close(wend);
            return Err(KernelError::MFile);
        }
    };
    let wfile = match kernel().ftable().alloc(File {
        typ: FileType::Pipe { end: wend },
        readable: false,
        writable: true,
        flags: 0,
    }) {
        Ok(f) => f,
        Err(f) => {
            kernel().ftable().discard(f);
            kernel().ftable().close(rfile);
            return Err(KernelError::MFile);
        }
    };

    let r = (|| {
        let mut fds = cur.proc().files.lock();
        let rfd = fds.alloc(rfile)?;
        match fds.alloc(wfile) {
            Ok(wfd) => Ok((rfd, wfd)),
            Err(e) => {
                let _ = fds.take(rfd);
                Err(e)
            }
        }
    })();
    let (rfd, wfd) = match r {
        Ok(v) => v,
        Err(e) => {
            kernel().ftable().close(rfile);
            kernel().ftable().close(wfile);
            return Err(e);
        }
    };

    let words = [(rfd as u32).to_le_bytes(), (wfd as u32).to_le_bytes()];
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&words[0]);
    out[4..].copy_from_slice(&words[1]);
    if let Err(e) = cur.copy_out(addr, &out) {
        let mut fds = cur.proc().files.lock();
        let _ = fds.take(rfd);
        let _ = fds.take(wfd);
        drop(fds);
        kernel().ftable().close(rfile);
        kernel().ftable().close(wfile);
        return Err(e);
    }
    Ok(0)
}

/// getdents(fd, buf, len)
pub fn sys_getdents(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let addr = cur.arg(1);
    let len = cur.arg(2).min(BSIZE);
    let entry = cur.proc().files.lock().get(fd)?;
    let cred = cur.cred();

    let mut buf = [0u8; BSIZE];
    let n = kernel().ftable().getdents(entry.file, &mut buf[..len], &cred)?;
    cur.copy_out(addr, &buf[..n])?;
    Ok(n)
}

/// ioctl: the console has no controls yet.
pub fn sys_ioctl(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let _ = cur.proc().files.lock().get(fd)?;
    Err(KernelError::Inval)
}

pub fn sys_fcntl(cur: CurrentProc) -> Result<usize> {
    let fd = cur.arg(0);
    let cmd = cur.arg_i32(1);
    let arg = cur.arg(2);
    match cmd {
        F_DUPFD => sys_dup(cur),
        F_GETFD => {
            let entry = cur.proc().files.lock().get(fd)?;
            Ok(if entry.cloexec { FD_CLOEXEC as usize } else { 0 })
        }
        F_SETFD => {
            let mut fds = cur.proc().files.lock();
            fds.set_cloexec(fd, arg as i32 & FD_CLOEXEC != 0)?;
            Ok(0)
        }
        F_GETFL => {
            let entry = cur.proc().files.lock().get(fd)?;
            let readable = kernel().ftable().readable(entry.file);
            let writable = kernel().ftable().writable(entry.file);
            let accmode = match (readable, writable) {
                (true, true) => O_RDWR,
                (false, true) => O_WRONLY,
                _ => O_RDONLY,
            };
            Ok((kernel().ftable().flags(entry.file) | accmode) as usize)
        }
        _ => Err(KernelError::Inval),
    }
}

/// umask(mask): returns the previous mask.
pub fn sys_umask(cur: CurrentProc) -> Result<usize> {
    let new = cur.arg(0) as u32 & 0o777;
    let data = cur.data();
    let old = data.cmask;
    data.cmask = new;
    Ok(old as usize)
}
