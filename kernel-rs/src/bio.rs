//! Buffer cache.
//!
//! A fixed set of block-sized buffers caching disk contents, MRU-ordered.
//! There is at most one buffer per (device, block number); the per-buffer
//! sleep lock makes it the synchronization point for that disk block.
//!
//! Interface:
//! * `read` returns the locked buffer for a block, reading it from the
//!   device if the cached copy is not valid.
//! * `write` marks a locked buffer dirty.
//! * `release` unlocks the buffer; a dirty buffer is written back first.
//! * Do not hold a buffer longer than necessary, and release it before
//!   sleeping on anything that could need the same block.

use core::cell::UnsafeCell;
use core::mem;

use kernel_lib::cache::MruCache;

use crate::lock::{SleepLock, SpinLock};
use crate::param::{BSIZE, NBUF};

/// Disk-like devices the cache can sit on. The IDE driver and the boot
/// RAM disk both implement this.
pub trait BlockDevice: Sync {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]);
    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]);
}

#[derive(Copy, Clone, PartialEq, Eq, Default)]
struct BufKey {
    dev: u32,
    blockno: u32,
}

#[repr(align(8))]
pub struct BufData {
    bytes: [u8; BSIZE],
}

impl BufData {
    pub fn as_slice(&self) -> &[u8; BSIZE] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8; BSIZE] {
        &mut self.bytes
    }
}

struct BufInner {
    /// Has the data been read from the device?
    valid: bool,
    /// Must the data be written back before reuse?
    dirty: bool,
    data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            dirty: false,
            data: BufData { bytes: [0; BSIZE] },
        }
    }
}

/// A locked buffer. The holder has exclusive access to the block's bytes
/// until `Bcache::release`.
pub struct Buf {
    slot: usize,
    dev: u32,
    pub blockno: u32,
}

impl Buf {
    pub fn dev(&self) -> u32 {
        self.dev
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        panic!("Buf leaked without release");
    }
}

pub struct Bcache {
    map: SpinLock<MruCache<BufKey, NBUF>>,
    bufs: [SleepLock<()>; NBUF],
    inner: [UnsafeCell<BufInner>; NBUF],
    device: UnsafeCell<Option<&'static dyn BlockDevice>>,
}

// SAFETY: each BufInner is only reached while its sleep lock is held (or
// while recycling a slot with no references); the device reference is
// written once during boot.
unsafe impl Sync for Bcache {}

impl Bcache {
    pub const fn new() -> Self {
        Self {
            map: SpinLock::new("bcache", MruCache::new([BufKey { dev: 0, blockno: 0 }; NBUF])),
            bufs: [const { SleepLock::new("buffer", ()) }; NBUF],
            inner: [const { UnsafeCell::new(BufInner::new()) }; NBUF],
            device: UnsafeCell::new(None),
        }
    }

    /// Attaches the backing device. Must happen before the first `read`.
    ///
    /// # Safety
    ///
    /// Single-threaded boot only.
    pub unsafe fn init(&self, device: &'static dyn BlockDevice) {
        // SAFETY: no reader exists yet.
        unsafe { *self.device.get() = Some(device) };
    }

    fn device(&self) -> &'static dyn BlockDevice {
        // SAFETY: written once before use.
        unsafe { (*self.device.get()).expect("bcache: no device") }
    }

    /// Looks up the buffer for (dev, blockno), locking it. The buffer's
    /// data is valid on return.
    pub fn read(&self, dev: u32, blockno: u32) -> Buf {
        let buf = self.get(dev, blockno);
        // SAFETY: we hold the buffer's sleep lock.
        let inner = unsafe { &mut *self.inner[buf.slot].get() };
        if !inner.valid {
            self.device().read_block(blockno, &mut inner.data.bytes);
            inner.valid = true;
        }
        buf
    }

    fn get(&self, dev: u32, blockno: u32) -> Buf {
        let key = BufKey { dev, blockno };
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
            .expect("bcache: no buffers");
        if recycled {
            // The slot had no references, so nobody holds its lock; the
            // stale contents belong to the evicted block.
            // SAFETY: exclusive by the argument above.
            let inner = unsafe { &mut *self.inner[slot].get() };
            assert!(!inner.dirty, "bcache: evicting dirty buffer");
            inner.valid = false;
        }
        // Serialize with any current holder of this block.
        mem::forget(self.bufs[slot].lock());
        Buf {
            slot,
            dev,
            blockno,
        }
    }

    /// Exclusive access to a locked buffer's bytes.
    pub fn data<'a>(&'a self, buf: &'a Buf) -> &'a BufData {
        // SAFETY: buf holds the sleep lock.
        unsafe { &(*self.inner[buf.slot].get()).data }
    }

    pub fn data_mut<'a>(&'a self, buf: &'a mut Buf) -> &'a mut BufData {
        // SAFETY: buf holds the sleep lock and is borrowed mutably.
        unsafe { &mut (*self.inner[buf.slot].get()).data }
    }

    /// Marks a locked buffer dirty; it is flushed on release.
    pub fn write(&self, buf: &mut Buf) {
        // SAFETY: buf holds the sleep lock.
        unsafe { (*self.inner[buf.slot].get()).dirty = true };
    }

    /// Unlocks the buffer, writing it back first if dirty, and drops the
    /// cache reference.
    pub fn release(&self, buf: Buf) {
        // SAFETY: buf holds the sleep lock.
        let inner = unsafe { &mut *self.inner[buf.slot].get() };
        if inner.dirty {
            self.device().write_block(buf.blockno, &inner.data.bytes);
            inner.dirty = false;
        }
        // SAFETY: buf was created with a forgotten guard.
        unsafe { self.bufs[buf.slot].unlock() };
        let _ = self.map.lock().put(buf.slot);
        mem::forget(buf);
    }
}

/// A memory-backed block device: the boot filesystem image, and the disk
/// used by the filesystem tests.
pub struct RamDisk {
    inner: SpinLock<RamDiskInner>,
}

struct RamDiskInner {
    base: *mut u8,
    nblocks: u32,
}

// SAFETY: the backing region is only touched under the lock.
unsafe impl Send for RamDiskInner {}

impl RamDisk {
    /// # Safety
    ///
    /// `base..base + nblocks * BSIZE` must be exclusively owned RAM.
    pub unsafe fn new(base: *mut u8, nblocks: u32) -> Self {
        Self {
            inner: SpinLock::new("ramdisk", RamDiskInner { base, nblocks }),
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let inner = self.inner.lock();
        assert!(blockno < inner.nblocks, "ramdisk: block out of range");
        // SAFETY: in-bounds by the assertion and the construction contract.
        unsafe {
            core::ptr::copy_nonoverlapping(
                inner.base.add(blockno as usize * BSIZE),
                buf.as_mut_ptr(),
                BSIZE,
            );
        }
    }

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) {
        let inner = self.inner.lock();
        assert!(blockno < inner.nblocks, "ramdisk: block out of range");
        // SAFETY: in-bounds by the assertion and the construction contract.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                inner.base.add(blockno as usize * BSIZE),
                BSIZE,
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_disk(nblocks: u32) -> &'static RamDisk {
        let region = Box::leak(vec![0u8; nblocks as usize * BSIZE].into_boxed_slice());
        // SAFETY: the leaked region is exclusively ours.
        Box::leak(Box::new(unsafe { RamDisk::new(region.as_mut_ptr(), nblocks) }))
    }

    pub(crate) fn test_bcache(nblocks: u32) -> &'static Bcache {
        let disk = test_disk(nblocks);
        let bcache = Box::leak(Box::new(Bcache::new()));
        // SAFETY: single-threaded test setup.
        unsafe { bcache.init(disk) };
        bcache
    }

    #[test]
    fn write_then_read_hits_cache() {
        let _lock = crate::kernel::test_support::lock();
        let bcache = test_bcache(64);
        let mut buf = bcache.read(0, 3);
        bcache.data_mut(&mut buf).as_mut_slice()[0..4].copy_from_slice(b"abcd");
        bcache.write(&mut buf);
        bcache.release(buf);

        let buf = bcache.read(0, 3);
        assert_eq!(&bcache.data(&buf).as_slice()[0..4], b"abcd");
        bcache.release(buf);
    }

    #[test]
    fn contents_survive_eviction() {
        let _lock = crate::kernel::test_support::lock();
        let bcache = test_bcache(NBUF as u32 * 4);
        let mut buf = bcache.read(0, 1);
        bcache.data_mut(&mut buf).as_mut_slice()[0] = 0x5a;
        bcache.write(&mut buf);
        bcache.release(buf);

        // Cycle enough other blocks through to evict block 1.
        for b in 10..(10 + NBUF as u32 * 2) {
            let buf = bcache.read(0, b);
            bcache.release(buf);
        }

        let buf = bcache.read(0, 1);
        assert_eq!(bcache.data(&buf).as_slice()[0], 0x5a);
        bcache.release(buf);
    }

    #[test]
    fn one_entry_per_block() {
        let _lock = crate::kernel::test_support::lock();
        let bcache = test_bcache(64);
        let a = bcache.read(0, 7);
        let slot = a.slot;
        bcache.release(a);
        let b = bcache.read(0, 7);
        assert_eq!(b.slot, slot);
        bcache.release(b);
    }
}
