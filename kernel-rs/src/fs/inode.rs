//! The in-core inode cache and the operations on inodes.
//!
//! An in-core inode caches one on-disk inode's metadata plus bookkeeping
//! the disk never sees: the cache reference count, and the VALID and DIRTY
//! bits. The cache keeps an entry's (dev, ino) identity after the last
//! reference is dropped, so a re-get hits the same slot.
//!
//! Locking: the cache map has a spinlock; each inode's metadata is behind
//! a sleeping mutex, taken by `lock` and dropped by `unlock`. Every
//! operation that inspects or mutates metadata takes an `InodeGuard`,
//! which is the type-level proof that the mutex is held. When two inodes
//! must be locked at once they are locked in cache-slot order, low first.
//!
//! A typical sequence is:
//!
//!   let ip = itable.get(dev, ino)?;
//!   let mut g = itable.lock(&ip);
//!   ... examine and modify ...
//!   itable.unlock(g);
//!   itable.put(ip);

use core::cell::UnsafeCell;
use core::mem;
use core::ops::{Deref, DerefMut};

use kernel_lib::cache::SlotCache;

use super::ext2::{self, Ext2Fs, FT_BLK, FT_CHR, FT_DIR, FT_REG, ROOT_INO};
use super::stat::{
    is_device, is_dir, is_reg, Stat, S_IFBLK, S_IFCHR, S_IFDIR, S_IFMT, S_IFREG, S_IXGRP,
    S_IXOTH, S_IXUSR,
};
use super::InodeBody;
use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{LINK_MAX, NINODE, ROOTDEV};
use crate::proc::Cred;

#[derive(Copy, Clone, PartialEq, Eq, Default)]
struct InodeKey {
    dev: u32,
    ino: u32,
}

/// A counted, unlocked reference to a cached inode.
/// Obtained from `Itable::get`, returned with `Itable::put`.
#[derive(Debug)]
pub struct InodeRef {
    slot: usize,
    pub dev: u32,
    pub ino: u32,
}

/// Proof that the inode's mutex is held. Dereferences to the metadata.
pub struct InodeGuard {
    slot: usize,
    pub dev: u32,
    pub ino: u32,
}

impl Deref for InodeGuard {
    type Target = InodeBody;

    fn deref(&self) -> &InodeBody {
        // SAFETY: the guard holds the inode's sleep lock.
        unsafe { &*kernel().itable().bodies[self.slot].get() }
    }
}

impl DerefMut for InodeGuard {
    fn deref_mut(&mut self) -> &mut InodeBody {
        // SAFETY: the guard holds the inode's sleep lock exclusively.
        unsafe { &mut *kernel().itable().bodies[self.slot].get() }
    }
}

pub struct Itable {
    map: SpinLock<SlotCache<InodeKey, NINODE>>,
    locks: [SleepLock<()>; NINODE],
    bodies: [UnsafeCell<InodeBody>; NINODE],
}

// SAFETY: bodies are only reached through a held sleep lock.
unsafe impl Sync for Itable {}

impl Itable {
    pub const fn new() -> Self {
        Self {
            map: SpinLock::new("itable", SlotCache::new([InodeKey { dev: 0, ino: 0 }; NINODE])),
            locks: [const { SleepLock::new("inode", ()) }; NINODE],
            bodies: [const { UnsafeCell::new(InodeBody::new()) }; NINODE],
        }
    }

    /// Finds or creates the cache entry for (dev, ino) and takes a
    /// reference. The metadata is not necessarily valid yet.
    pub fn get(&self, dev: u32, ino: u32) -> Result<InodeRef> {
        let key = InodeKey { dev, ino };
        let mut recycled = false;
        let slot = self
            .map
            .lock()
            .find_or_alloc(
                |k| *k == key,
                |k| {
                    *k = key;
                    recycled = true;
                },
            )
            .ok_or(KernelError::NoMem)?;
        if recycled {
            // The slot had no references, so nobody holds its mutex.
            // SAFETY: exclusive by the argument above.
            let body = unsafe { &mut *self.bodies[slot].get() };
            assert!(!body.dirty, "itable: recycling dirty inode");
            body.valid = false;
        }
        Ok(InodeRef { slot, dev, ino })
    }

    /// The root directory of the root device.
    pub fn root(&self) -> Result<InodeRef> {
        self.get(ROOTDEV, ROOT_INO)
    }

    /// Takes another reference to the same inode.
    pub fn dup(&self, r: &InodeRef) -> InodeRef {
        self.map.lock().dup(r.slot);
        InodeRef {
            slot: r.slot,
            dev: r.dev,
            ino: r.ino,
        }
    }

    /// Locks the inode, reading the metadata from disk on first lock.
    pub fn lock(&self, r: &InodeRef) -> InodeGuard {
        mem::forget(self.locks[r.slot].lock());
        let guard = InodeGuard {
            slot: r.slot,
            dev: r.dev,
            ino: r.ino,
        };
        // SAFETY: we hold the mutex.
        let body = unsafe { &mut *self.bodies[r.slot].get() };
        if !body.valid {
            assert!(!body.dirty, "itable: invalid inode is dirty");
            ext2::read_inode(self.fs(r.dev), r.ino, body);
            body.valid = true;
        }
        guard
    }

    /// Unlocks the inode, writing the metadata back if it is dirty.
    pub fn unlock(&self, mut g: InodeGuard) {
        assert!(g.valid, "itable: unlocking invalid inode");
        if g.dirty {
            let fs = self.fs(g.dev);
            ext2::write_inode(fs, g.ino, &g);
            g.dirty = false;
        }
        // SAFETY: the guard was created with a forgotten sleep lock guard.
        unsafe { self.locks[g.slot].unlock() };
        mem::forget(g);
    }

    /// Temporarily releases the inode mutex around `f`; used by device
    /// I/O, which may sleep on the console. Dirty metadata is flushed
    /// first, exactly as a real unlock would.
    pub fn reacquire_after<T>(&self, g: &mut InodeGuard, f: impl FnOnce() -> T) -> T {
        if g.dirty {
            let fs = self.fs(g.dev);
            ext2::write_inode(fs, g.ino, g);
            g.dirty = false;
        }
        // SAFETY: paired with the relock below; `g` is not used between.
        unsafe { self.locks[g.slot].unlock() };
        let v = f();
        mem::forget(self.locks[g.slot].lock());
        // The reference count kept the slot ours, but the metadata may
        // need re-reading if the entry was invalidated meanwhile.
        // SAFETY: the mutex is held again.
        let body = unsafe { &mut *self.bodies[g.slot].get() };
        if !body.valid {
            ext2::read_inode(self.fs(g.dev), g.ino, body);
            body.valid = true;
        }
        v
    }

    /// Unlock then put, the common tail of most operations.
    pub fn unlock_put(&self, g: InodeGuard, r: InodeRef) {
        debug_assert_eq!(g.slot, r.slot, "unlock_put: mismatched inode");
        self.unlock(g);
        self.put(r);
    }

    /// Drops a reference. If this was the last reference to an unlinked
    /// file, the on-disk inode is freed first.
    pub fn put(&self, r: InodeRef) {
        let g = self.lock(&r);
        assert!(!g.dirty, "itable: put of dirty inode");
        if g.valid && g.nlink == 0 && self.map.lock().refcnt(r.slot) == 1 {
            // Last reference to a deleted file: release its data and the
            // on-disk inode, and forget the cached metadata.
            let mut g = g;
            let fs = self.fs(r.dev);
            ext2::inode_trunc(fs, &mut g);
            ext2::write_inode(fs, r.ino, &g);
            ext2::free_inode(fs, r.ino);
            g.valid = false;
            // SAFETY: as in unlock; an invalid inode must not write back.
            unsafe { self.locks[g.slot].unlock() };
            mem::forget(g);
        } else {
            self.unlock(g);
        }
        let _ = self.map.lock().put(r.slot);
    }

    /// Locks two distinct inodes in cache-slot order to avoid deadlock.
    /// Returns the guards in argument order.
    pub fn lock_two(&self, a: &InodeRef, b: &InodeRef) -> (InodeGuard, InodeGuard) {
        assert_ne!(a.slot, b.slot, "lock_two: same inode");
        if a.slot < b.slot {
            let ga = self.lock(a);
            let gb = self.lock(b);
            (ga, gb)
        } else {
            let gb = self.lock(b);
            let ga = self.lock(a);
            (ga, gb)
        }
    }

    pub fn unlock_two(&self, a: InodeGuard, b: InodeGuard) {
        if a.slot < b.slot {
            self.unlock(b);
            self.unlock(a);
        } else {
            self.unlock(a);
            self.unlock(b);
        }
    }

    fn fs(&self, dev: u32) -> &Ext2Fs {
        let fs = kernel().fs().ext2();
        assert_eq!(fs.dev, dev, "itable: unknown device");
        fs
    }

    /// Allocates a fresh on-disk inode with the given attributes and
    /// returns a reference to it.
    fn alloc_inode(&self, dev: u32, mode: u16, cred: &Cred, rdev: u32) -> Result<InodeRef> {
        let fs = self.fs(dev);
        let ino = ext2::alloc_inode(fs)?;
        let now = kernel().wall_time();
        let mut body = InodeBody::new();
        body.valid = true;
        body.mode = mode;
        body.uid = cred.euid as u16;
        body.gid = cred.egid as u16;
        body.nlink = 0;
        body.atime = now;
        body.mtime = now;
        body.ctime = now;
        if is_device(mode) {
            body.block[0] = rdev;
        }
        ext2::write_inode(fs, ino, &body);
        self.get(dev, ino)
    }
}

/// Classic UNIX permission bits against effective credentials. Root may
/// read and write anything; execute still requires at least one x bit.
pub fn permits(body: &InodeBody, cred: &Cred, read: bool, write: bool, exec: bool) -> bool {
    if cred.euid == 0 {
        if exec {
            return body.mode & (S_IXUSR | S_IXGRP | S_IXOTH) != 0;
        }
        return true;
    }
    let shift = if cred.euid as u16 == body.uid {
        6
    } else if cred.egid as u16 == body.gid {
        3
    } else {
        0
    };
    let mut want: u16 = 0;
    if read {
        want |= 4;
    }
    if write {
        want |= 2;
    }
    if exec {
        want |= 1;
    }
    (body.mode >> shift) & want == want
}

pub fn can_read(body: &InodeBody, cred: &Cred) -> bool {
    permits(body, cred, true, false, false)
}

pub fn can_write(body: &InodeBody, cred: &Cred) -> bool {
    permits(body, cred, false, true, false)
}

pub fn can_exec(body: &InodeBody, cred: &Cred) -> bool {
    permits(body, cred, false, false, true)
}

/// Reads from a locked inode at `*off`, advancing it.
/// Character and block device inodes are routed to the console.
pub fn inode_read(g: &mut InodeGuard, dst: &mut [u8], off: &mut u32, cred: &Cred) -> Result<usize> {
    if !can_read(g, cred) {
        return Err(KernelError::Perm);
    }

    if is_device(g.mode) {
        // The console may sleep waiting for input; the inode mutex must
        // not be held across that.
        return kernel()
            .itable()
            .reacquire_after(g, || kernel().console().read(dst));
    }

    if off.checked_add(dst.len() as u32).is_none() {
        return Err(KernelError::Inval);
    }
    let fs = kernel().fs().ext2();
    let n = ext2::inode_read(fs, g, *off, dst)?;
    *off += n as u32;
    Ok(n)
}

/// Writes to a locked inode at `*off`, advancing it.
pub fn inode_write(g: &mut InodeGuard, src: &[u8], off: &mut u32, cred: &Cred) -> Result<usize> {
    if !can_write(g, cred) {
        return Err(KernelError::Perm);
    }

    if is_device(g.mode) {
        return kernel()
            .itable()
            .reacquire_after(g, || kernel().console().write(src));
    }

    if off.checked_add(src.len() as u32).is_none() {
        return Err(KernelError::Inval);
    }
    let fs = kernel().fs().ext2();
    let n = ext2::inode_write(fs, g, *off, src)?;
    if n > 0 {
        *off += n as u32;
        g.mtime = kernel().wall_time();
        g.dirty = true;
    }
    Ok(n)
}

/// The dirent record returned to user space by getdents.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Dirent {
    pub d_ino: u32,
    pub d_off: u32,
    pub d_reclen: u16,
    pub d_namelen: u8,
    pub d_type: u8,
}

/// `d_reclen` = offset of the name + the name length.
pub const DIRENT_NAME_OFFSET: usize = mem::size_of::<Dirent>();

/// Fills `dst` with as many whole dirent records as fit, starting at
/// directory offset `*off`. Fails with EINVAL if not even the first
/// record fits.
pub fn inode_read_dir(
    g: &mut InodeGuard,
    dst: &mut [u8],
    off: &mut u32,
    cred: &Cred,
) -> Result<usize> {
    if !is_dir(g.mode) {
        return Err(KernelError::NotDir);
    }
    if !can_read(g, cred) {
        return Err(KernelError::Perm);
    }

    let fs = kernel().fs().ext2();
    let mut total = 0;
    loop {
        let Some(entry) = ext2::dir_read(fs, g, *off)? else {
            break;
        };
        let reclen = DIRENT_NAME_OFFSET + entry.name_len;
        if total + reclen > dst.len() {
            if total == 0 {
                return Err(KernelError::Inval);
            }
            break;
        }
        let rec = Dirent {
            d_ino: entry.ino,
            d_off: entry.next_off,
            d_reclen: reclen as u16,
            d_namelen: entry.name_len as u8,
            d_type: entry.file_type,
        };
        // SAFETY: in-bounds plain-data store.
        unsafe {
            core::ptr::write_unaligned(dst[total..].as_mut_ptr() as *mut Dirent, rec);
        }
        dst[total + DIRENT_NAME_OFFSET..total + reclen]
            .copy_from_slice(&entry.name[..entry.name_len]);
        total += reclen;
        *off = entry.next_off;
    }
    Ok(total)
}

pub fn inode_stat(g: &InodeGuard) -> Stat {
    Stat {
        dev: g.dev,
        ino: g.ino,
        mode: g.mode as u32,
        nlink: g.nlink as u32,
        uid: g.uid as u32,
        gid: g.gid as u32,
        size: g.size,
        atime: g.atime,
        mtime: g.mtime,
        ctime: g.ctime,
    }
}

fn file_type_of(mode: u16) -> u8 {
    match mode & S_IFMT {
        S_IFDIR => FT_DIR,
        S_IFCHR => FT_CHR,
        S_IFBLK => FT_BLK,
        S_IFREG => FT_REG,
        _ => FT_REG,
    }
}

/// Creates a node (regular, directory, or device by `mode`) under the
/// parent of `path`. Returns a reference to the new inode.
pub fn fs_create(
    path: &[u8],
    mode: u16,
    rdev: u32,
    cwd: &InodeRef,
    cred: &Cred,
    cmask: u32,
) -> Result<InodeRef> {
    let itable = kernel().itable();
    let (dir, name) = super::path::parent_lookup(path, cwd, cred)?;
    let mode = (mode & S_IFMT) | (mode & 0o7777 & !(cmask as u16));

    let mut dg = itable.lock(&dir);
    let r = fs_create_locked(itable, &mut dg, &name, mode, rdev, cred);
    itable.unlock_put(dg, dir);
    r
}

fn fs_create_locked(
    itable: &Itable,
    dg: &mut InodeGuard,
    name: &[u8],
    mode: u16,
    rdev: u32,
    cred: &Cred,
) -> Result<InodeRef> {
    if !is_dir(dg.mode) {
        return Err(KernelError::NotDir);
    }
    if !can_write(dg, cred) {
        return Err(KernelError::Perm);
    }
    let fs = kernel().fs().ext2();
    if ext2::dir_lookup(fs, dg, name)?.is_some() {
        return Err(KernelError::Exist);
    }

    let ip = itable.alloc_inode(dg.dev, mode, cred, rdev)?;
    let mut g = itable.lock(&ip);
    let r = (|| {
        g.nlink = 1;
        if is_dir(mode) {
            // "." and ".." are born with the directory.
            g.nlink = 2;
            ext2::dir_enter(fs, &mut g, b".", ip.ino, FT_DIR)?;
            ext2::dir_enter(fs, &mut g, b"..", dg.ino, FT_DIR)?;
        }
        g.dirty = true;
        ext2::dir_enter(fs, dg, name, ip.ino, file_type_of(mode))?;
        if is_dir(mode) {
            dg.nlink += 1; // the child's ".."
            dg.dirty = true;
        }
        dg.mtime = kernel().wall_time();
        dg.dirty = true;
        Ok(())
    })();
    match r {
        Ok(()) => {
            itable.unlock(g);
            Ok(ip)
        }
        Err(e) => {
            // Undo the allocation: with nlink 0, put frees it on disk.
            g.nlink = 0;
            g.dirty = true;
            itable.unlock_put(g, ip);
            Err(e)
        }
    }
}

/// Creates a hard link `path2` to the file at `path1`.
pub fn fs_link(path1: &[u8], path2: &[u8], cwd: &InodeRef, cred: &Cred) -> Result<()> {
    let itable = kernel().itable();
    let ip = super::path::name_lookup(path1, cwd, cred)?;

    let (dir, name) = match super::path::parent_lookup(path2, cwd, cred) {
        Ok(v) => v,
        Err(e) => {
            itable.put(ip);
            return Err(e);
        }
    };

    let r = (|| {
        if dir.dev != ip.dev {
            return Err(KernelError::XDev);
        }
        if dir.slot == ip.slot {
            // Linking a directory into itself; directories cannot be
            // linked at all.
            return Err(KernelError::Perm);
        }
        let (mut dg, mut ig) = itable.lock_two(&dir, &ip);
        let r = (|| {
            if !is_dir(dg.mode) {
                return Err(KernelError::NotDir);
            }
            if !can_write(&dg, cred) {
                return Err(KernelError::Perm);
            }
            if is_dir(ig.mode) {
                return Err(KernelError::Perm);
            }
            if ig.nlink as usize >= LINK_MAX {
                return Err(KernelError::MLink);
            }
            let fs = kernel().fs().ext2();
            if ext2::dir_lookup(fs, &mut dg, &name)?.is_some() {
                return Err(KernelError::Exist);
            }
            ext2::dir_enter(fs, &mut dg, &name, ip.ino, file_type_of(ig.mode))?;
            let now = kernel().wall_time();
            ig.nlink += 1;
            ig.ctime = now;
            ig.dirty = true;
            dg.mtime = now;
            dg.dirty = true;
            Ok(())
        })();
        itable.unlock_two(dg, ig);
        r
    })();

    itable.put(dir);
    itable.put(ip);
    r
}

/// Common removal: resolve parent, find the victim, lock both in order.
fn fs_remove(path: &[u8], rmdir: bool, cwd: &InodeRef, cred: &Cred) -> Result<()> {
    let itable = kernel().itable();
    let (dir, name) = super::path::parent_lookup(path, cwd, cred)?;

    if &name[..] == b"." || &name[..] == b".." {
        itable.put(dir);
        return Err(KernelError::Inval);
    }

    // Find the victim with only the parent locked, then take both locks
    // in order and re-check the entry, since it may have raced away.
    let mut dg = itable.lock(&dir);
    let fs = kernel().fs().ext2();
    let found = ext2::dir_lookup(fs, &mut dg, &name);
    itable.unlock(dg);
    let Some((ino, _)) = (match found {
        Ok(v) => v,
        Err(e) => {
            itable.put(dir);
            return Err(e);
        }
    }) else {
        itable.put(dir);
        return Err(KernelError::NoEnt);
    };
    if ino == dir.ino {
        // Only a corrupt directory names itself under another entry.
        itable.put(dir);
        return Err(KernelError::Inval);
    }
    let ip = match itable.get(dir.dev, ino) {
        Ok(ip) => ip,
        Err(e) => {
            itable.put(dir);
            return Err(e);
        }
    };

    let (mut dg, mut ig) = itable.lock_two(&dir, &ip);
    let r = (|| {
        if !can_write(&dg, cred) {
            return Err(KernelError::Perm);
        }
        match ext2::dir_lookup(fs, &mut dg, &name)? {
            Some((now_ino, _)) if now_ino == ip.ino => {}
            _ => return Err(KernelError::NoEnt),
        }
        if rmdir {
            if !is_dir(ig.mode) {
                return Err(KernelError::NotDir);
            }
            if !ext2::dir_is_empty(fs, &mut ig)? {
                return Err(KernelError::NotEmpty);
            }
        } else if is_dir(ig.mode) {
            return Err(KernelError::Perm);
        }

        ext2::dir_remove(fs, &mut dg, &name)?;
        let now = kernel().wall_time();
        if rmdir {
            // The victim's "." and ".." go with it.
            ig.nlink = 0;
            dg.nlink -= 1;
        } else {
            ig.nlink -= 1;
        }
        ig.ctime = now;
        ig.dirty = true;
        dg.mtime = now;
        dg.dirty = true;
        Ok(())
    })();
    itable.unlock_two(dg, ig);
    itable.put(dir);
    itable.put(ip);
    r
}

pub fn fs_unlink(path: &[u8], cwd: &InodeRef, cred: &Cred) -> Result<()> {
    fs_remove(path, false, cwd, cred)
}

pub fn fs_rmdir(path: &[u8], cwd: &InodeRef, cred: &Cred) -> Result<()> {
    fs_remove(path, true, cwd, cred)
}

/// chmod: owner or root only. Sets ctime and marks the inode dirty.
pub fn fs_chmod(path: &[u8], mode: u16, cwd: &InodeRef, cred: &Cred) -> Result<()> {
    let itable = kernel().itable();
    let ip = super::path::name_lookup(path, cwd, cred)?;
    let mut g = itable.lock(&ip);
    let r = if cred.euid != 0 && g.uid as u32 != cred.euid {
        Err(KernelError::Perm)
    } else {
        g.mode = (g.mode & S_IFMT) | (mode & 0o7777);
        g.ctime = kernel().wall_time();
        g.dirty = true;
        Ok(())
    };
    itable.unlock_put(g, ip);
    r
}

/// Validates an inode as a working directory: a searchable directory.
pub fn fs_chdir_inode(ip: &InodeRef, cred: &Cred) -> Result<()> {
    let itable = kernel().itable();
    let g = itable.lock(ip);
    let r = if !is_dir(g.mode) {
        Err(KernelError::NotDir)
    } else if !can_exec(&g, cred) {
        Err(KernelError::Perm)
    } else {
        Ok(())
    };
    itable.unlock(g);
    r
}

/// Truncate a regular file to length zero (open with O_TRUNC).
pub fn inode_truncate(g: &mut InodeGuard, cred: &Cred) -> Result<()> {
    if !can_write(g, cred) {
        return Err(KernelError::Perm);
    }
    if !is_reg(g.mode) {
        return Err(KernelError::Inval);
    }
    let fs = kernel().fs().ext2();
    ext2::inode_trunc(fs, g);
    g.mtime = kernel().wall_time();
    g.dirty = true;
    Ok(())
}

