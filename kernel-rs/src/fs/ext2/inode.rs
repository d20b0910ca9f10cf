//! On-disk inode I/O: metadata read/write, the block pointer tree, and
//! file content read/write/truncate.

use super::{
    alloc_block, free_block, inode_pos, Ext2Fs, MAXBLOCKS, NDIRECT, NINDIRECT,
};
use crate::error::{KernelError, Result};
use crate::fs::InodeBody;
use crate::kernel::kernel;
use crate::param::BSIZE;

/// Reads the on-disk metadata of `ino` into `body`.
pub fn read_inode(fs: &Ext2Fs, ino: u32, body: &mut InodeBody) {
    let (blockno, off) = inode_pos(fs, ino);
    let buf = kernel().bcache().read(fs.dev, blockno);
    // SAFETY: DiskInode is repr(C) plain data within the block.
    let dip = unsafe {
        core::ptr::read_unaligned(
            kernel().bcache().data(&buf).as_slice()[off..].as_ptr() as *const super::DiskInode
        )
    };
    kernel().bcache().release(buf);

    body.mode = dip.mode;
    body.uid = dip.uid;
    body.gid = dip.gid;
    body.nlink = dip.links_count;
    body.size = dip.size;
    body.atime = dip.atime;
    body.mtime = dip.mtime;
    body.ctime = dip.ctime;
    body.blocks = dip.blocks;
    body.block = dip.block;
}

/// Writes `body` back to the inode table.
pub fn write_inode(fs: &Ext2Fs, ino: u32, body: &InodeBody) {
    let (blockno, off) = inode_pos(fs, ino);
    let mut buf = kernel().bcache().read(fs.dev, blockno);
    let bytes = kernel().bcache().data_mut(&mut buf).as_mut_slice();
    // SAFETY: DiskInode is repr(C) plain data within the block.
    let mut dip = unsafe {
        core::ptr::read_unaligned(bytes[off..].as_ptr() as *const super::DiskInode)
    };
    dip.mode = body.mode;
    dip.uid = body.uid;
    dip.gid = body.gid;
    dip.links_count = body.nlink;
    dip.size = body.size;
    dip.atime = body.atime;
    dip.mtime = body.mtime;
    dip.ctime = body.ctime;
    dip.blocks = body.blocks;
    dip.block = body.block;
    // SAFETY: as above.
    unsafe {
        core::ptr::write_unaligned(bytes[off..].as_mut_ptr() as *mut super::DiskInode, dip);
    }
    kernel().bcache().write(&mut buf);
    kernel().bcache().release(buf);
}

/// Reads pointer `index` of the table block `table`, allocating a block
/// into the slot first when `alloc` and the slot is a hole.
fn chase(fs: &Ext2Fs, table: u32, index: usize, alloc: bool) -> Result<u32> {
    let mut buf = kernel().bcache().read(fs.dev, table);
    let bytes = kernel().bcache().data_mut(&mut buf).as_mut_slice();
    let off = index * core::mem::size_of::<u32>();
    // SAFETY: in-bounds u32 within the block.
    let mut entry = unsafe {
        core::ptr::read_unaligned(bytes[off..].as_ptr() as *const u32)
    };
    if entry == 0 && alloc {
        // Careful: alloc_block takes other buffers; release ours first to
        // respect the one-buffer-at-a-time discipline.
        kernel().bcache().release(buf);
        entry = alloc_block(fs)?;
        let mut buf = kernel().bcache().read(fs.dev, table);
        let bytes = kernel().bcache().data_mut(&mut buf).as_mut_slice();
        // SAFETY: as above.
        unsafe {
            core::ptr::write_unaligned(bytes[off..].as_mut_ptr() as *mut u32, entry);
        }
        kernel().bcache().write(&mut buf);
        kernel().bcache().release(buf);
        return Ok(entry);
    }
    kernel().bcache().release(buf);
    Ok(entry)
}

/// Maps file block `bn` to its disk block. Returns 0 for a hole unless
/// `alloc` is set, in which case blocks (and intermediate pointer blocks)
/// are allocated on the way down.
pub fn bmap(fs: &Ext2Fs, body: &mut InodeBody, bn: usize, alloc: bool) -> Result<u32> {
    if bn >= MAXBLOCKS {
        return Err(KernelError::FBig);
    }

    if bn < NDIRECT {
        if body.block[bn] == 0 && alloc {
            body.block[bn] = alloc_block(fs)?;
            body.blocks += (BSIZE / 512) as u32;
        }
        return Ok(body.block[bn]);
    }

    // (slot in body.block, chain of per-level indices)
    let bn = bn - NDIRECT;
    let (slot, indices) = if bn < NINDIRECT {
        (NDIRECT, [bn, 0, 0])
    } else {
        let bn2 = bn - NINDIRECT;
        if bn2 < NINDIRECT * NINDIRECT {
            (NDIRECT + 1, [bn2 / NINDIRECT, bn2 % NINDIRECT, 0])
        } else {
            let bn3 = bn2 - NINDIRECT * NINDIRECT;
            (
                NDIRECT + 2,
                [
                    bn3 / (NINDIRECT * NINDIRECT),
                    bn3 / NINDIRECT % NINDIRECT,
                    bn3 % NINDIRECT,
                ],
            )
        }
    };
    let levels = slot - NDIRECT + 1;

    let mut table = body.block[slot];
    if table == 0 {
        if !alloc {
            return Ok(0);
        }
        table = alloc_block(fs)?;
        body.block[slot] = table;
        body.blocks += (BSIZE / 512) as u32;
    }
    for level in 0..levels {
        let last = level == levels - 1;
        let next = chase(fs, table, indices[level], alloc)?;
        if next == 0 {
            debug_assert!(!alloc);
            return Ok(0);
        }
        if last {
            return Ok(next);
        }
        table = next;
    }
    unreachable!("bmap: level walk");
}

/// Reads up to `dst.len()` bytes at byte offset `off`. Short reads happen
/// at end of file; holes read as zeroes.
pub fn inode_read(fs: &Ext2Fs, body: &mut InodeBody, off: u32, dst: &mut [u8]) -> Result<usize> {
    if off >= body.size {
        return Ok(0);
    }
    let n = dst.len().min((body.size - off) as usize);
    let mut done = 0;
    while done < n {
        let pos = off as usize + done;
        let chunk = (BSIZE - pos % BSIZE).min(n - done);
        let blockno = bmap(fs, body, pos / BSIZE, false)?;
        if blockno == 0 {
            dst[done..done + chunk].fill(0);
        } else {
            let buf = kernel().bcache().read(fs.dev, blockno);
            let start = pos % BSIZE;
            dst[done..done + chunk]
                .copy_from_slice(&kernel().bcache().data(&buf).as_slice()[start..start + chunk]);
            kernel().bcache().release(buf);
        }
        done += chunk;
    }
    Ok(n)
}

/// Writes `src` at byte offset `off`, extending the file as needed.
pub fn inode_write(fs: &Ext2Fs, body: &mut InodeBody, off: u32, src: &[u8]) -> Result<usize> {
    if off as usize > body.size as usize {
        return Err(KernelError::Inval);
    }
    let end = (off as usize).checked_add(src.len()).ok_or(KernelError::Inval)?;
    if end > MAXBLOCKS * BSIZE {
        return Err(KernelError::FBig);
    }

    let mut done = 0;
    while done < src.len() {
        let pos = off as usize + done;
        let chunk = (BSIZE - pos % BSIZE).min(src.len() - done);
        let blockno = bmap(fs, body, pos / BSIZE, true)?;
        let mut buf = kernel().bcache().read(fs.dev, blockno);
        let start = pos % BSIZE;
        kernel().bcache().data_mut(&mut buf).as_mut_slice()[start..start + chunk]
            .copy_from_slice(&src[done..done + chunk]);
        kernel().bcache().write(&mut buf);
        kernel().bcache().release(buf);
        done += chunk;
    }

    if end as u32 > body.size {
        body.size = end as u32;
    }
    Ok(src.len())
}

/// Frees every pointer block reachable from `table` at `level` levels of
/// indirection, then `table` itself.
fn free_tree(fs: &Ext2Fs, table: u32, level: usize) {
    if level > 0 {
        for index in 0..NINDIRECT {
            let buf = kernel().bcache().read(fs.dev, table);
            // SAFETY: in-bounds u32 within the block.
            let entry = unsafe {
                core::ptr::read_unaligned(
                    kernel().bcache().data(&buf).as_slice()[index * 4..].as_ptr() as *const u32,
                )
            };
            kernel().bcache().release(buf);
            if entry != 0 {
                free_tree(fs, entry, level - 1);
            }
        }
    }
    free_block(fs, table);
}

/// Discards the file's contents.
pub fn inode_trunc(fs: &Ext2Fs, body: &mut InodeBody) {
    for bn in 0..NDIRECT {
        if body.block[bn] != 0 {
            free_block(fs, body.block[bn]);
            body.block[bn] = 0;
        }
    }
    for (slot, level) in [(NDIRECT, 1), (NDIRECT + 1, 2), (NDIRECT + 2, 3)] {
        if body.block[slot] != 0 {
            free_tree(fs, body.block[slot], level);
            body.block[slot] = 0;
        }
    }
    body.size = 0;
    body.blocks = 0;
}
