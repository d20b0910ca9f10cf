//! Directory blocks.
//!
//! A directory is a file of variable-length records; records never cross
//! a block boundary, and the records in one block always cover it exactly,
//! so deletion folds a record into its predecessor and insertion splits
//! the slack off an existing record.

use super::{
    dirent_reclen, inode_read, inode_write, Ext2Fs, DIRENT_HEAD_SIZE, FT_UNKNOWN,
};
use crate::error::{KernelError, Result};
use crate::fs::InodeBody;
use crate::param::{BSIZE, NAME_MAX};

#[derive(Copy, Clone)]
struct RawEntry {
    inode: u32,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
}

fn entry_at(block: &[u8; BSIZE], off: usize) -> RawEntry {
    // SAFETY: callers keep off within the block with room for a header.
    let head = unsafe {
        core::ptr::read_unaligned(block[off..].as_ptr() as *const super::DirEntryHead)
    };
    RawEntry {
        inode: head.inode,
        rec_len: head.rec_len as usize,
        name_len: head.name_len as usize,
        file_type: head.file_type,
    }
}

fn write_entry(block: &mut [u8; BSIZE], off: usize, e: RawEntry, name: &[u8]) {
    let head = super::DirEntryHead {
        inode: e.inode,
        rec_len: e.rec_len as u16,
        name_len: e.name_len as u8,
        file_type: e.file_type,
    };
    // SAFETY: as in entry_at.
    unsafe {
        core::ptr::write_unaligned(block[off..].as_mut_ptr() as *mut super::DirEntryHead, head);
    }
    block[off + DIRENT_HEAD_SIZE..off + DIRENT_HEAD_SIZE + name.len()].copy_from_slice(name);
}

fn entry_name<'a>(block: &'a [u8; BSIZE], off: usize, e: &RawEntry) -> &'a [u8] {
    &block[off + DIRENT_HEAD_SIZE..off + DIRENT_HEAD_SIZE + e.name_len]
}

fn read_block(fs: &Ext2Fs, dir: &mut InodeBody, bn: usize, block: &mut [u8; BSIZE]) -> Result<()> {
    let n = inode_read(fs, dir, (bn * BSIZE) as u32, block)?;
    if n != BSIZE {
        return Err(KernelError::Inval);
    }
    Ok(())
}

fn write_block(fs: &Ext2Fs, dir: &mut InodeBody, bn: usize, block: &[u8; BSIZE]) -> Result<()> {
    let n = inode_write(fs, dir, (bn * BSIZE) as u32, block)?;
    debug_assert_eq!(n, BSIZE);
    Ok(())
}

/// Looks `name` up, returning its inode number and file type.
pub fn dir_lookup(fs: &Ext2Fs, dir: &mut InodeBody, name: &[u8]) -> Result<Option<(u32, u8)>> {
    let mut block = [0u8; BSIZE];
    for bn in 0..(dir.size as usize).div_ceil(BSIZE) {
        read_block(fs, dir, bn, &mut block)?;
        let mut off = 0;
        while off + DIRENT_HEAD_SIZE <= BSIZE {
            let e = entry_at(&block, off);
            if e.rec_len < DIRENT_HEAD_SIZE || off + e.rec_len > BSIZE {
                return Err(KernelError::Inval);
            }
            if e.inode != 0 && entry_name(&block, off, &e) == name {
                return Ok(Some((e.inode, e.file_type)));
            }
            off += e.rec_len;
        }
    }
    Ok(None)
}

/// Adds the entry (name, ino). The caller has checked for duplicates.
pub fn dir_enter(
    fs: &Ext2Fs,
    dir: &mut InodeBody,
    name: &[u8],
    ino: u32,
    file_type: u8,
) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(KernelError::NameTooLong);
    }
    let needed = dirent_reclen(name.len());
    let mut block = [0u8; BSIZE];

    for bn in 0..(dir.size as usize).div_ceil(BSIZE) {
        read_block(fs, dir, bn, &mut block)?;
        let mut off = 0;
        while off + DIRENT_HEAD_SIZE <= BSIZE {
            let e = entry_at(&block, off);
            if e.rec_len < DIRENT_HEAD_SIZE || off + e.rec_len > BSIZE {
                return Err(KernelError::Inval);
            }
            if e.inode == 0 && e.rec_len >= needed {
                // A dead record big enough to take over.
                write_entry(
                    &mut block,
                    off,
                    RawEntry {
                        inode: ino,
                        rec_len: e.rec_len,
                        name_len: name.len(),
                        file_type,
                    },
                    name,
                );
                return write_block(fs, dir, bn, &block);
            }
            let used = if e.inode == 0 { 0 } else { dirent_reclen(e.name_len) };
            if e.rec_len >= used + needed {
                // Split the slack off a live record.
                let mut pname = [0u8; NAME_MAX];
                pname[..e.name_len].copy_from_slice(entry_name(&block, off, &e));
                write_entry(
                    &mut block,
                    off,
                    RawEntry {
                        rec_len: used,
                        ..e
                    },
                    &pname[..e.name_len],
                );
                write_entry(
                    &mut block,
                    off + used,
                    RawEntry {
                        inode: ino,
                        rec_len: e.rec_len - used,
                        name_len: name.len(),
                        file_type,
                    },
                    name,
                );
                return write_block(fs, dir, bn, &block);
            }
            off += e.rec_len;
        }
    }

    // No room anywhere: append a fresh block holding just this entry.
    let bn = (dir.size as usize).div_ceil(BSIZE);
    block.fill(0);
    write_entry(
        &mut block,
        0,
        RawEntry {
            inode: ino,
            rec_len: BSIZE,
            name_len: name.len(),
            file_type,
        },
        name,
    );
    write_block(fs, dir, bn, &block)
}

/// Removes the entry for `name`.
pub fn dir_remove(fs: &Ext2Fs, dir: &mut InodeBody, name: &[u8]) -> Result<()> {
    let mut block = [0u8; BSIZE];
    for bn in 0..(dir.size as usize).div_ceil(BSIZE) {
        read_block(fs, dir, bn, &mut block)?;
        let mut prev: Option<usize> = None;
        let mut off = 0;
        while off + DIRENT_HEAD_SIZE <= BSIZE {
            let e = entry_at(&block, off);
            if e.rec_len < DIRENT_HEAD_SIZE || off + e.rec_len > BSIZE {
                return Err(KernelError::Inval);
            }
            if e.inode != 0 && entry_name(&block, off, &e) == name {
                match prev {
                    Some(p) => {
                        // Fold into the predecessor.
                        let mut pe = entry_at(&block, p);
                        pe.rec_len += e.rec_len;
                        let pname: [u8; NAME_MAX] = {
                            let mut tmp = [0u8; NAME_MAX];
                            tmp[..pe.name_len]
                                .copy_from_slice(entry_name(&block, p, &pe));
                            tmp
                        };
                        write_entry(&mut block, p, pe, &pname[..pe.name_len]);
                    }
                    None => {
                        // First in the block: just kill it.
                        let mut dead = e;
                        dead.inode = 0;
                        dead.name_len = 0;
                        write_entry(&mut block, off, dead, &[]);
                    }
                }
                return write_block(fs, dir, bn, &block);
            }
            prev = Some(off);
            off += e.rec_len;
        }
    }
    Err(KernelError::NoEnt)
}

/// Is the directory empty apart from "." and ".."?
pub fn dir_is_empty(fs: &Ext2Fs, dir: &mut InodeBody) -> Result<bool> {
    let mut block = [0u8; BSIZE];
    for bn in 0..(dir.size as usize).div_ceil(BSIZE) {
        read_block(fs, dir, bn, &mut block)?;
        let mut off = 0;
        while off + DIRENT_HEAD_SIZE <= BSIZE {
            let e = entry_at(&block, off);
            if e.rec_len < DIRENT_HEAD_SIZE || off + e.rec_len > BSIZE {
                return Err(KernelError::Inval);
            }
            if e.inode != 0 {
                let n = entry_name(&block, off, &e);
                if n != b"." && n != b".." {
                    return Ok(false);
                }
            }
            off += e.rec_len;
        }
    }
    Ok(true)
}

/// One entry as handed to getdents.
pub struct DirEntryInfo {
    pub ino: u32,
    pub file_type: u8,
    pub name_len: usize,
    pub name: [u8; NAME_MAX],
    /// Offset of the record after this one.
    pub next_off: u32,
}

/// Reads the first live entry at or after byte offset `off`.
/// `Ok(None)` at end of directory.
pub fn dir_read(fs: &Ext2Fs, dir: &mut InodeBody, mut off: u32) -> Result<Option<DirEntryInfo>> {
    let mut block = [0u8; BSIZE];
    while (off as usize) < dir.size as usize {
        let bn = off as usize / BSIZE;
        read_block(fs, dir, bn, &mut block)?;
        let mut pos = off as usize % BSIZE;
        while pos + DIRENT_HEAD_SIZE <= BSIZE {
            let e = entry_at(&block, pos);
            if e.rec_len < DIRENT_HEAD_SIZE || pos + e.rec_len > BSIZE {
                return Err(KernelError::Inval);
            }
            let next = (bn * BSIZE + pos + e.rec_len) as u32;
            if e.inode != 0 {
                let mut name = [0u8; NAME_MAX];
                name[..e.name_len].copy_from_slice(entry_name(&block, pos, &e));
                return Ok(Some(DirEntryInfo {
                    ino: e.inode,
                    file_type: if e.file_type <= 4 { e.file_type } else { FT_UNKNOWN },
                    name_len: e.name_len,
                    name,
                    next_off: next,
                }));
            }
            pos += e.rec_len;
        }
        off = ((bn + 1) * BSIZE) as u32;
    }
    Ok(None)
}
