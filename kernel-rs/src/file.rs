//! File objects.
//!
//! A `File` is the reference-counted object behind a file descriptor:
//! an inode with a seek offset, one end of a pipe, or a socket handle.
//! fork and dup share the object (and therefore the offset); open creates
//! a new one. The global table holds every open file in the system.

use core::cell::UnsafeCell;
use core::mem;

use kernel_lib::cache::SlotCache;

use crate::error::{KernelError, Result};
use crate::fs::stat::{is_reg, Stat};
use crate::fs::{self, InodeRef};
use crate::kernel::kernel;
use crate::lock::SpinLock;
use crate::param::{NFILE, OPEN_MAX};
use crate::pipe::{self, PipeEnd};
use crate::proc::Cred;

pub const O_RDONLY: u32 = 0o0;
pub const O_WRONLY: u32 = 0o1;
pub const O_RDWR: u32 = 0o2;
pub const O_ACCMODE: u32 = 0o3;
pub const O_CREAT: u32 = 0o100;
pub const O_EXCL: u32 = 0o200;
pub const O_TRUNC: u32 = 0o1000;
pub const O_APPEND: u32 = 0o2000;

/// lseek whence values.
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

pub enum FileType {
    None,
    Inode {
        ip: InodeRef,
        /// Seek offset; shared by every descriptor referring to this
        /// object. Only read and written with the inode mutex held.
        off: UnsafeCell<u32>,
    },
    Pipe {
        end: PipeEnd,
    },
    Socket {
        id: u32,
    },
}

pub struct File {
    pub typ: FileType,
    pub readable: bool,
    pub writable: bool,
    pub flags: u32,
}

impl File {
    const fn closed() -> Self {
        Self {
            typ: FileType::None,
            readable: false,
            writable: false,
            flags: 0,
        }
    }
}

/// Index of a `File` in the global table. The holder owns one reference.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FileId(usize);

pub struct FileTable {
    table: SpinLock<SlotCache<File, NFILE>>,
}

// SAFETY: a File's fields are immutable once allocated (the offset cell
// is guarded by the inode mutex), and slots stay alive while referenced.
unsafe impl Sync for FileTable {}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            table: SpinLock::new("ftable", SlotCache::new([const { File::closed() }; NFILE])),
        }
    }

    /// Allocates a file object with one reference. On a full table the
    /// file comes back to the caller, who owns its inner references.
    pub fn alloc(&self, f: File) -> core::result::Result<FileId, File> {
        let mut f = Some(f);
        let slot = self.table.lock().alloc(|entry| *entry = f.take().unwrap());
        match slot {
            Some(slot) => Ok(FileId(slot)),
            None => Err(f.take().unwrap()),
        }
    }

    /// Releases the pieces of a file object that never made it into the
    /// table.
    pub fn discard(&self, f: File) {
        match f.typ {
            FileType::Inode { ip, .. } => kernel().itable().put(ip),
            FileType::Pipe { end } => pipe::close(end),
            FileType::Socket { .. } | FileType::None => {}
        }
    }

    /// Takes another reference, for dup and fork.
    pub fn dup(&self, id: FileId) -> FileId {
        self.table.lock().dup(id.0);
        id
    }

    /// Drops a reference; the last one closes the underlying object.
    pub fn close(&self, id: FileId) {
        let finalize = {
            let mut t = self.table.lock();
            if t.put(id.0) {
                Some(mem::replace(&mut t.get_mut(id.0).typ, FileType::None))
            } else {
                None
            }
        };
        // The actual teardown may sleep; do it without the table lock.
        match finalize {
            Some(FileType::Inode { ip, .. }) => kernel().itable().put(ip),
            Some(FileType::Pipe { end }) => pipe::close(end),
            Some(FileType::Socket { .. }) | Some(FileType::None) | None => {}
        }
    }

    /// Shared access to a live file object. The reference is valid while
    /// the caller holds a file reference.
    fn get(&self, id: FileId) -> &File {
        let t = self.table.lock();
        assert!(t.refcnt(id.0) > 0, "ftable: use of closed file");
        // SAFETY: the slot cannot be recycled while referenced, and no
        // one mutates a live File.
        unsafe { &*(t.get(id.0) as *const File) }
    }

    pub fn readable(&self, id: FileId) -> bool {
        self.get(id).readable
    }

    pub fn writable(&self, id: FileId) -> bool {
        self.get(id).writable
    }

    pub fn flags(&self, id: FileId) -> u32 {
        self.get(id).flags
    }

    /// Reads from the file into `dst`, advancing the offset for inodes.
    pub fn read(&self, id: FileId, dst: &mut [u8], cred: &Cred) -> Result<usize> {
        let f = self.get(id);
        if !f.readable {
            return Err(KernelError::BadFd);
        }
        match &f.typ {
            FileType::Inode { ip, off } => {
                let itable = kernel().itable();
                let mut g = itable.lock(ip);
                // SAFETY: the inode mutex guards the offset cell.
                let cur = unsafe { &mut *off.get() };
                let r = fs::inode_read(&mut g, dst, cur, cred);
                itable.unlock(g);
                r
            }
            FileType::Pipe { end } => pipe::read(*end, dst),
            FileType::Socket { .. } => Err(KernelError::Inval),
            FileType::None => panic!("file read: closed"),
        }
    }

    /// Writes `src` to the file, advancing the offset for inodes.
    pub fn write(&self, id: FileId, src: &[u8], cred: &Cred) -> Result<usize> {
        let f = self.get(id);
        if !f.writable {
            return Err(KernelError::BadFd);
        }
        match &f.typ {
            FileType::Inode { ip, off } => {
                let itable = kernel().itable();
                let mut g = itable.lock(ip);
                // SAFETY: the inode mutex guards the offset cell.
                let cur = unsafe { &mut *off.get() };
                if f.flags & O_APPEND != 0 && is_reg(g.mode) {
                    *cur = g.size;
                }
                let r = fs::inode_write(&mut g, src, cur, cred);
                itable.unlock(g);
                r
            }
            FileType::Pipe { end } => pipe::write(*end, src),
            FileType::Socket { .. } => Err(KernelError::Inval),
            FileType::None => panic!("file write: closed"),
        }
    }

    /// Moves the seek offset. Only meaningful for inode files.
    pub fn seek(&self, id: FileId, offset: i32, whence: i32) -> Result<u32> {
        let f = self.get(id);
        match &f.typ {
            FileType::Inode { ip, off } => {
                let itable = kernel().itable();
                let g = itable.lock(ip);
                // SAFETY: the inode mutex guards the offset cell.
                let cur = unsafe { &mut *off.get() };
                let base = match whence {
                    SEEK_SET => 0,
                    SEEK_CUR => *cur as i64,
                    SEEK_END => g.size as i64,
                    _ => {
                        itable.unlock(g);
                        return Err(KernelError::Inval);
                    }
                };
                let new = base + offset as i64;
                let r = if !(0..=u32::MAX as i64).contains(&new) {
                    Err(KernelError::Inval)
                } else {
                    *cur = new as u32;
                    Ok(new as u32)
                };
                itable.unlock(g);
                r
            }
            _ => Err(KernelError::Inval),
        }
    }

    pub fn stat(&self, id: FileId) -> Result<Stat> {
        let f = self.get(id);
        match &f.typ {
            FileType::Inode { ip, .. } => {
                let itable = kernel().itable();
                let g = itable.lock(ip);
                let st = fs::inode_stat(&g);
                itable.unlock(g);
                Ok(st)
            }
            _ => Err(KernelError::BadFd),
        }
    }

    /// getdents: fills `dst` with dirent records.
    pub fn getdents(&self, id: FileId, dst: &mut [u8], cred: &Cred) -> Result<usize> {
        let f = self.get(id);
        match &f.typ {
            FileType::Inode { ip, off } => {
                let itable = kernel().itable();
                let mut g = itable.lock(ip);
                // SAFETY: the inode mutex guards the offset cell.
                let cur = unsafe { &mut *off.get() };
                let r = fs::inode_read_dir(&mut g, dst, cur, cred);
                itable.unlock(g);
                r
            }
            _ => Err(KernelError::NotDir),
        }
    }
}

/// One file descriptor: a file reference plus per-descriptor flags.
#[derive(Copy, Clone, Debug)]
pub struct Fd {
    pub file: FileId,
    pub cloexec: bool,
}

/// A process's descriptor table, behind the per-process fd spinlock.
pub struct FdTable {
    slots: [Option<Fd>; OPEN_MAX],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; OPEN_MAX],
        }
    }

    /// Installs `file` at the lowest free descriptor.
    pub fn alloc(&mut self, file: FileId) -> Result<usize> {
        let fd = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::MFile)?;
        self.slots[fd] = Some(Fd {
            file,
            cloexec: false,
        });
        Ok(fd)
    }

    /// Installs `file` at a specific descriptor, closing what was there.
    /// Returns the replaced entry, which the caller must close.
    pub fn install_at(&mut self, fd: usize, file: FileId) -> Result<Option<Fd>> {
        if fd >= OPEN_MAX {
            return Err(KernelError::BadFd);
        }
        Ok(self.slots[fd].replace(Fd {
            file,
            cloexec: false,
        }))
    }

    pub fn get(&self, fd: usize) -> Result<Fd> {
        self.slots
            .get(fd)
            .copied()
            .flatten()
            .ok_or(KernelError::BadFd)
    }

    pub fn take(&mut self, fd: usize) -> Result<Fd> {
        self.slots
            .get_mut(fd)
            .ok_or(KernelError::BadFd)?
            .take()
            .ok_or(KernelError::BadFd)
    }

    pub fn set_cloexec(&mut self, fd: usize, on: bool) -> Result<()> {
        let slot = self
            .slots
            .get_mut(fd)
            .ok_or(KernelError::BadFd)?
            .as_mut()
            .ok_or(KernelError::BadFd)?;
        slot.cloexec = on;
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, Fd)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, s)| s.map(|f| (fd, f)))
    }

    /// Empties the table, handing back every entry for closing.
    pub fn drain(&mut self) -> impl Iterator<Item = Fd> + '_ {
        self.slots.iter_mut().filter_map(|s| s.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_table_allocates_lowest_free() {
        let mut t = FdTable::new();
        let id = FileId(1);
        assert_eq!(t.alloc(id).unwrap(), 0);
        assert_eq!(t.alloc(id).unwrap(), 1);
        let _ = t.take(0).unwrap();
        assert_eq!(t.alloc(id).unwrap(), 0);
    }

    #[test]
    fn bad_descriptors_are_ebadf() {
        let mut t = FdTable::new();
        assert_eq!(t.get(0).unwrap_err(), KernelError::BadFd);
        assert_eq!(t.get(OPEN_MAX + 5).unwrap_err(), KernelError::BadFd);
        assert_eq!(t.take(3).unwrap_err(), KernelError::BadFd);
    }

    #[test]
    fn cloexec_flag_round_trip() {
        let mut t = FdTable::new();
        let fd = t.alloc(FileId(2)).unwrap();
        t.set_cloexec(fd, true).unwrap();
        assert!(t.get(fd).unwrap().cloexec);
    }
}
