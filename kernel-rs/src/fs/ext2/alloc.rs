//! Block and inode allocation: the per-group bitmaps.

use super::Ext2Fs;
use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::param::BSIZE;

/// Finds and sets the first clear bit in the bitmap block, up to
/// `max_bits`. Returns the bit index.
fn bitmap_alloc(dev: u32, bitmap_block: u32, max_bits: u32) -> Option<u32> {
    let mut buf = kernel().bcache().read(dev, bitmap_block);
    let bytes = kernel().bcache().data_mut(&mut buf).as_mut_slice();
    let mut found = None;
    'scan: for (i, byte) in bytes.iter_mut().enumerate().take(BSIZE.min(max_bits as usize / 8 + 1)) {
        if *byte == 0xff {
            continue;
        }
        for bit in 0..8 {
            let index = (i * 8 + bit) as u32;
            if index >= max_bits {
                break 'scan;
            }
            if *byte & (1 << bit) == 0 {
                *byte |= 1 << bit;
                found = Some(index);
                break 'scan;
            }
        }
    }
    if found.is_some() {
        kernel().bcache().write(&mut buf);
    }
    kernel().bcache().release(buf);
    found
}

fn bitmap_clear(dev: u32, bitmap_block: u32, index: u32) {
    let mut buf = kernel().bcache().read(dev, bitmap_block);
    let bytes = kernel().bcache().data_mut(&mut buf).as_mut_slice();
    let byte = &mut bytes[index as usize / 8];
    assert!(*byte & (1 << (index % 8)) != 0, "freeing a free bit");
    *byte &= !(1 << (index % 8));
    kernel().bcache().write(&mut buf);
    kernel().bcache().release(buf);
}

/// Allocates one zero-filled block.
pub fn alloc_block(fs: &Ext2Fs) -> Result<u32> {
    for group in 0..fs.ngroups {
        let mut desc = fs.group_desc(group);
        let Some(bit) = bitmap_alloc(fs.dev, desc.block_bitmap, fs.sb.blocks_per_group) else {
            continue;
        };
        desc.free_blocks_count = desc.free_blocks_count.saturating_sub(1);
        fs.write_group_desc(group, &desc);

        let blockno = fs.sb.first_data_block + group * fs.sb.blocks_per_group + bit;
        let mut buf = kernel().bcache().read(fs.dev, blockno);
        kernel().bcache().data_mut(&mut buf).as_mut_slice().fill(0);
        kernel().bcache().write(&mut buf);
        kernel().bcache().release(buf);
        return Ok(blockno);
    }
    Err(KernelError::NoMem)
}

pub fn free_block(fs: &Ext2Fs, blockno: u32) {
    let rel = blockno - fs.sb.first_data_block;
    let group = rel / fs.sb.blocks_per_group;
    let mut desc = fs.group_desc(group);
    bitmap_clear(fs.dev, desc.block_bitmap, rel % fs.sb.blocks_per_group);
    desc.free_blocks_count += 1;
    fs.write_group_desc(group, &desc);
}

/// Allocates an inode number. The caller initializes the on-disk inode.
pub fn alloc_inode(fs: &Ext2Fs) -> Result<u32> {
    for group in 0..fs.ngroups {
        let mut desc = fs.group_desc(group);
        let Some(bit) = bitmap_alloc(fs.dev, desc.inode_bitmap, fs.sb.inodes_per_group) else {
            continue;
        };
        desc.free_inodes_count = desc.free_inodes_count.saturating_sub(1);
        fs.write_group_desc(group, &desc);
        return Ok(group * fs.sb.inodes_per_group + bit + 1);
    }
    Err(KernelError::NoMem)
}

pub fn free_inode(fs: &Ext2Fs, ino: u32) {
    let group = fs.inode_group(ino);
    let mut desc = fs.group_desc(group);
    bitmap_clear(fs.dev, desc.inode_bitmap, fs.inode_index(ino));
    desc.free_inodes_count += 1;
    fs.write_group_desc(group, &desc);
}
