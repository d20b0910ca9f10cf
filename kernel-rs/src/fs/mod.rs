//! The filesystem: ext2 on-disk layer, the in-core inode cache, and path
//! resolution on top of it.

use core::cell::UnsafeCell;

pub mod ext2;
mod inode;
mod path;
pub mod stat;

pub use inode::{
    can_exec, can_read, can_write, fs_chdir_inode, fs_chmod, fs_create, fs_link, fs_rmdir,
    fs_unlink, inode_read, inode_read_dir, inode_stat, inode_truncate, inode_write, permits,
    Dirent, InodeGuard, InodeRef, Itable, DIRENT_NAME_OFFSET,
};
pub use path::{name_lookup, parent_lookup};

use crate::error::Result;
use ext2::Ext2Fs;

/// In-core inode body: the on-disk metadata plus the cache state bits.
/// Guarded by the inode's sleep lock.
pub struct InodeBody {
    /// Has the on-disk metadata been read in?
    pub valid: bool,
    /// Must the metadata be written back before the inode is unlocked for
    /// the last time?
    pub dirty: bool,

    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub nlink: u16,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// 512-byte sectors backing the file.
    pub blocks: u32,
    /// Direct and indirect block pointers.
    pub block: [u32; 15],
}

impl InodeBody {
    pub const fn new() -> Self {
        Self {
            valid: false,
            dirty: false,
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            blocks: 0,
            block: [0; 15],
        }
    }
}

/// The mounted filesystem plus the inode cache.
pub struct FileSystem {
    /// Written once at mount time.
    ext2: UnsafeCell<Option<Ext2Fs>>,
    pub itable: Itable,
}

// SAFETY: `ext2` is written once during single-threaded boot.
unsafe impl Sync for FileSystem {}

impl FileSystem {
    pub const fn new() -> Self {
        Self {
            ext2: UnsafeCell::new(None),
            itable: Itable::new(),
        }
    }

    /// Mounts the root device.
    ///
    /// # Safety
    ///
    /// Single-threaded boot only, after the buffer cache has a device.
    pub unsafe fn mount(&self, dev: u32) -> Result<()> {
        let fs = Ext2Fs::mount(dev)?;
        // SAFETY: no reader exists yet.
        unsafe { *self.ext2.get() = Some(fs) };
        Ok(())
    }

    pub fn ext2(&self) -> &Ext2Fs {
        // SAFETY: written once before use.
        unsafe { (*self.ext2.get()).as_ref().expect("fs: not mounted") }
    }
}

#[cfg(test)]
mod tests {
    use super::stat::{is_dir, S_IFDIR, S_IFREG};
    use super::*;
    use crate::error::KernelError;
    use crate::file::{File, FileType, SEEK_CUR, SEEK_SET};
    use crate::kernel::kernel;
    use crate::proc::Cred;

    const ROOT: Cred = Cred {
        ruid: 0,
        euid: 0,
        rgid: 0,
        egid: 0,
    };

    const NOBODY: Cred = Cred {
        ruid: 5,
        euid: 5,
        rgid: 5,
        egid: 5,
    };

    fn root_dir() -> InodeRef {
        kernel().itable().root().unwrap()
    }

    fn open_file(path: &[u8]) -> crate::file::FileId {
        let cwd = root_dir();
        let ip = name_lookup(path, &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
        kernel()
            .ftable()
            .alloc(File {
                typ: FileType::Inode {
                    ip,
                    off: core::cell::UnsafeCell::new(0),
                },
                readable: true,
                writable: true,
                flags: 0,
            })
            .ok()
            .unwrap()
    }

    #[test]
    fn root_is_a_directory() {
        let _g = crate::kernel::test_support::setup();
        let itable = kernel().itable();
        let root = itable.root().unwrap();
        let g = itable.lock(&root);
        assert!(is_dir(g.mode));
        assert!(g.nlink >= 2);
        itable.unlock_put(g, root);
    }

    #[test]
    fn write_seek_read_round_trip() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let ip = fs_create(b"/roundtrip", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(ip);
        kernel().itable().put(cwd);

        let fd = open_file(b"/roundtrip");
        let msg = b"the quick brown fox";
        assert_eq!(kernel().ftable().write(fd, msg, &ROOT).unwrap(), msg.len());

        // write; lseek(-n, CUR); read  =>  the same bytes.
        let pos = kernel()
            .ftable()
            .seek(fd, -(msg.len() as i32), SEEK_CUR)
            .unwrap();
        assert_eq!(pos, 0);
        let mut back = [0u8; 19];
        assert_eq!(kernel().ftable().read(fd, &mut back, &ROOT).unwrap(), 19);
        assert_eq!(&back, msg);
        kernel().ftable().close(fd);

        let cwd = root_dir();
        fs_unlink(b"/roundtrip", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn writes_cross_block_boundaries() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let ip = fs_create(b"/big", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(ip);
        kernel().itable().put(cwd);

        let fd = open_file(b"/big");
        let chunk = [0xabu8; 700];
        // Three chunks span two 1 KiB blocks.
        for _ in 0..3 {
            assert_eq!(kernel().ftable().write(fd, &chunk, &ROOT).unwrap(), 700);
        }
        assert_eq!(kernel().ftable().seek(fd, 0, SEEK_SET).unwrap(), 0);
        let mut total = 0;
        let mut buf = [0u8; 512];
        loop {
            let n = kernel().ftable().read(fd, &mut buf, &ROOT).unwrap();
            if n == 0 {
                break;
            }
            assert!(buf[..n].iter().all(|&b| b == 0xab));
            total += n;
        }
        assert_eq!(total, 2100);
        kernel().ftable().close(fd);

        let cwd = root_dir();
        fs_unlink(b"/big", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn directory_link_unlink_scenario() {
        let _g = crate::kernel::test_support::setup();
        let itable = kernel().itable();
        let cwd = root_dir();

        let d = fs_create(b"/d", S_IFDIR | 0o755, 0, &cwd, &ROOT, 0).unwrap();
        itable.put(d);
        let f = fs_create(b"/d/f", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        let f_ino = f.ino;
        itable.put(f);

        fs_link(b"/d/f", b"/d/g", &cwd, &ROOT).unwrap();
        fs_unlink(b"/d/f", &cwd, &ROOT).unwrap();

        // The surviving name keeps the inode, with one link left.
        let g_ref = name_lookup(b"/d/g", &cwd, &ROOT).unwrap();
        assert_eq!(g_ref.ino, f_ino);
        let g = itable.lock(&g_ref);
        assert_eq!(g.nlink, 1);
        itable.unlock_put(g, g_ref);

        assert_eq!(
            name_lookup(b"/d/f", &cwd, &ROOT).unwrap_err(),
            KernelError::NoEnt
        );

        fs_unlink(b"/d/g", &cwd, &ROOT).unwrap();
        fs_rmdir(b"/d", &cwd, &ROOT).unwrap();
        itable.put(cwd);
    }

    #[test]
    fn link_refuses_directories() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let d = fs_create(b"/linkdir", S_IFDIR | 0o755, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(d);
        assert_eq!(
            fs_link(b"/linkdir", b"/linkdir2", &cwd, &ROOT).unwrap_err(),
            KernelError::Perm
        );
        fs_rmdir(b"/linkdir", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn rmdir_refuses_non_empty() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let d = fs_create(b"/full", S_IFDIR | 0o755, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(d);
        let f = fs_create(b"/full/x", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(f);

        assert_eq!(
            fs_rmdir(b"/full", &cwd, &ROOT).unwrap_err(),
            KernelError::NotEmpty
        );
        // unlink of a directory is refused too.
        assert_eq!(
            fs_unlink(b"/full", &cwd, &ROOT).unwrap_err(),
            KernelError::Perm
        );

        fs_unlink(b"/full/x", &cwd, &ROOT).unwrap();
        fs_rmdir(b"/full", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn create_existing_name_is_eexist() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let f = fs_create(b"/dup", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(f);
        assert_eq!(
            fs_create(b"/dup", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap_err(),
            KernelError::Exist
        );
        fs_unlink(b"/dup", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn lookup_error_cases() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        assert_eq!(
            name_lookup(b"", &cwd, &ROOT).unwrap_err(),
            KernelError::NoEnt
        );
        assert_eq!(
            name_lookup(b"/no/such/file", &cwd, &ROOT).unwrap_err(),
            KernelError::NoEnt
        );

        // A path component that walks through a regular file.
        let f = fs_create(b"/plain", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(f);
        assert_eq!(
            name_lookup(b"/plain/sub", &cwd, &ROOT).unwrap_err(),
            KernelError::NotDir
        );

        // ".." from the root stays at the root.
        let up = name_lookup(b"/..", &cwd, &ROOT).unwrap();
        assert_eq!(up.ino, ext2::ROOT_INO);
        kernel().itable().put(up);

        fs_unlink(b"/plain", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn chmod_requires_owner_or_root() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let f = fs_create(b"/modefile", S_IFREG | 0o600, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(f);

        assert_eq!(
            fs_chmod(b"/modefile", 0o640, &cwd, &NOBODY).unwrap_err(),
            KernelError::Perm
        );
        fs_chmod(b"/modefile", 0o640, &cwd, &ROOT).unwrap();

        let ip = name_lookup(b"/modefile", &cwd, &ROOT).unwrap();
        let g = kernel().itable().lock(&ip);
        assert_eq!(g.mode & 0o7777, 0o640);
        kernel().itable().unlock_put(g, ip);

        fs_unlink(b"/modefile", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn getdents_records_and_short_buffer() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let d = fs_create(b"/entries", S_IFDIR | 0o755, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(d);
        let f = fs_create(b"/entries/hello", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(f);

        let dirref = name_lookup(b"/entries", &cwd, &ROOT).unwrap();
        let itable = kernel().itable();
        let mut g = itable.lock(&dirref);

        let mut buf = [0u8; 256];
        let mut off = 0u32;
        let n = inode_read_dir(&mut g, &mut buf, &mut off, &ROOT).unwrap();
        assert!(n > 0);

        // Parse the records: ".", "..", "hello", each with
        // d_reclen = header + name length.
        let mut names = Vec::new();
        let mut pos = 0;
        while pos < n {
            // SAFETY: records were produced by inode_read_dir.
            let rec = unsafe {
                core::ptr::read_unaligned(buf[pos..].as_ptr() as *const Dirent)
            };
            assert_eq!(
                rec.d_reclen as usize,
                DIRENT_NAME_OFFSET + rec.d_namelen as usize
            );
            let name =
                buf[pos + DIRENT_NAME_OFFSET..pos + rec.d_reclen as usize].to_vec();
            names.push(name);
            pos += rec.d_reclen as usize;
        }
        assert_eq!(pos, n);
        assert!(names.contains(&b".".to_vec()));
        assert!(names.contains(&b"..".to_vec()));
        assert!(names.contains(&b"hello".to_vec()));

        // A buffer too small for even the first record fails with EINVAL.
        let mut tiny = [0u8; 8];
        let mut off = 0u32;
        assert_eq!(
            inode_read_dir(&mut g, &mut tiny, &mut off, &ROOT).unwrap_err(),
            KernelError::Inval
        );

        itable.unlock_put(g, dirref);
        fs_unlink(b"/entries/hello", &cwd, &ROOT).unwrap();
        fs_rmdir(b"/entries", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn unlinked_file_is_deleted_on_last_put() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let f = fs_create(b"/victim", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();

        // Hold a reference across the unlink, like an open descriptor.
        fs_unlink(b"/victim", &cwd, &ROOT).unwrap();
        assert_eq!(
            name_lookup(b"/victim", &cwd, &ROOT).unwrap_err(),
            KernelError::NoEnt
        );
        // Dropping the last reference frees the on-disk inode; the name
        // can be recreated from scratch.
        kernel().itable().put(f);

        let f2 = fs_create(b"/victim", S_IFREG | 0o644, 0, &cwd, &ROOT, 0).unwrap();
        kernel().itable().put(f2);
        fs_unlink(b"/victim", &cwd, &ROOT).unwrap();
        kernel().itable().put(cwd);
    }

    #[test]
    fn metadata_survives_writeback() {
        let _g = crate::kernel::test_support::setup();
        let cwd = root_dir();
        let f = fs_create(b"/meta", S_IFREG | 0o751, 0, &cwd, &ROOT, 0).unwrap();
        let itable = kernel().itable();

        // ext2_write_inode then ext2_read_inode gives back equal metadata.
        let mut g = itable.lock(&f);
        g.size = 12345;
        g.mtime = 777;
        g.dirty = true;
        itable.unlock(g); // writes back

        let mut fresh = InodeBody::new();
        ext2::read_inode(kernel().fs().ext2(), f.ino, &mut fresh);
        assert_eq!(fresh.mode & 0o7777, 0o751);
        assert_eq!(fresh.size, 12345);
        assert_eq!(fresh.mtime, 777);

        // Undo the fake size before letting the delete path truncate.
        let mut g = itable.lock(&f);
        g.size = 0;
        g.dirty = true;
        itable.unlock(g);
        fs_unlink(b"/meta", &cwd, &ROOT).unwrap();
        itable.put(f);
        itable.put(cwd);
    }
}
