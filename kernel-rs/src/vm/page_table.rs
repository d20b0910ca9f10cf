//! User page tables.
//!
//! A two-level radix table: 512 entries per level, 4 KiB pages, covering
//! user addresses below `USER_MAX`. Entries pack the frame number with the
//! permission bits below it; the architecture's MMU descriptor layout is
//! produced from these portable bits by the arch backend when the table is
//! activated.

use bitflags::bitflags;

use crate::arch::{PGSHIFT, PGSIZE, USER_MAX};
use crate::error::{KernelError, Result};
use crate::vm::PageAllocator;

bitflags! {
    /// Portable page-table entry bits.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC = 1 << 3;
        const USER = 1 << 4;
        /// Write-protected alias of a shared frame.
        const COW = 1 << 5;
    }
}

const ENTRIES: usize = PGSIZE / core::mem::size_of::<u64>();
const FLAG_BITS: usize = 10;

const fn level1_index(va: usize) -> usize {
    (va >> (PGSHIFT + 9)) & (ENTRIES - 1)
}

const fn level0_index(va: usize) -> usize {
    (va >> PGSHIFT) & (ENTRIES - 1)
}

fn pte_make(pa: usize, flags: PteFlags) -> u64 {
    (((pa >> PGSHIFT) as u64) << FLAG_BITS) | flags.bits()
}

fn pte_pa(pte: u64) -> usize {
    ((pte >> FLAG_BITS) as usize) << PGSHIFT
}

fn pte_flags(pte: u64) -> PteFlags {
    PteFlags::from_bits_truncate(pte)
}

/// One user address space's translation table.
pub struct PageTable {
    /// Physical address of the root table frame.
    root: usize,
}

impl PageTable {
    pub fn new(allocator: &PageAllocator) -> Result<Self> {
        let root = allocator.alloc()?;
        Ok(Self { root })
    }

    fn table(pa: usize) -> *mut u64 {
        pa as *mut u64
    }

    /// Returns a pointer to the leaf entry for `va`, allocating the
    /// intermediate table if `alloc` says so.
    fn walk(&mut self, va: usize, allocator: &PageAllocator, alloc: bool) -> Result<*mut u64> {
        if va >= USER_MAX {
            return Err(KernelError::Fault);
        }
        // SAFETY: root is a live table frame.
        let l1 = unsafe { Self::table(self.root).add(level1_index(va)) };
        // SAFETY: in-bounds entry of a live table.
        let l1e = unsafe { *l1 };
        let l0_pa = if pte_flags(l1e).contains(PteFlags::VALID) {
            pte_pa(l1e)
        } else {
            if !alloc {
                return Err(KernelError::Fault);
            }
            let pa = allocator.alloc()?;
            // SAFETY: writing the entry we just read.
            unsafe { *l1 = pte_make(pa, PteFlags::VALID) };
            pa
        };
        // SAFETY: the level-0 table is live.
        Ok(unsafe { Self::table(l0_pa).add(level0_index(va)) })
    }

    /// Installs a mapping for the page containing `va`.
    /// Remapping a present page is a kernel bug.
    pub fn map(
        &mut self,
        va: usize,
        pa: usize,
        flags: PteFlags,
        allocator: &PageAllocator,
    ) -> Result<()> {
        debug_assert_eq!(va % PGSIZE, 0, "map: unaligned va");
        let pte = self.walk(va, allocator, true)?;
        // SAFETY: walk returned a valid leaf entry.
        unsafe {
            assert!(
                !pte_flags(*pte).contains(PteFlags::VALID),
                "map: remap of {va:#x}"
            );
            *pte = pte_make(pa, flags | PteFlags::VALID);
        }
        Ok(())
    }

    /// Removes the mapping for the page containing `va`, returning the
    /// frame it pointed at.
    pub fn unmap(&mut self, va: usize, allocator: &PageAllocator) -> Result<usize> {
        let pte = self.walk(va, allocator, false)?;
        // SAFETY: walk returned a valid leaf entry.
        unsafe {
            if !pte_flags(*pte).contains(PteFlags::VALID) {
                return Err(KernelError::Fault);
            }
            let pa = pte_pa(*pte);
            *pte = 0;
            Ok(pa)
        }
    }

    /// The frame and flags currently mapped at `va`, if present.
    pub fn translate(&mut self, va: usize, allocator: &PageAllocator) -> Option<(usize, PteFlags)> {
        let pte = self.walk(va, allocator, false).ok()?;
        // SAFETY: walk returned a valid leaf entry.
        let pte = unsafe { *pte };
        let flags = pte_flags(pte);
        if !flags.contains(PteFlags::VALID) {
            return None;
        }
        Some((pte_pa(pte), flags))
    }

    /// Rewrites the flags of a present mapping.
    pub fn set_flags(&mut self, va: usize, flags: PteFlags, allocator: &PageAllocator) -> Result<()> {
        let pte = self.walk(va, allocator, false)?;
        // SAFETY: walk returned a valid leaf entry.
        unsafe {
            if !pte_flags(*pte).contains(PteFlags::VALID) {
                return Err(KernelError::Fault);
            }
            *pte = pte_make(pte_pa(*pte), flags | PteFlags::VALID);
        }
        Ok(())
    }

    /// Physical address of the root frame; the arch backend loads this
    /// into the translation base register.
    pub fn root(&self) -> usize {
        self.root
    }

    /// Tears the whole table down, dropping one share of every mapped
    /// frame and freeing the table frames themselves.
    pub fn free(mut self, allocator: &PageAllocator) {
        for i1 in 0..ENTRIES {
            // SAFETY: root is live; entry in bounds.
            let l1e = unsafe { *Self::table(self.root).add(i1) };
            if !pte_flags(l1e).contains(PteFlags::VALID) {
                continue;
            }
            let l0_pa = pte_pa(l1e);
            for i0 in 0..ENTRIES {
                // SAFETY: the level-0 table is live.
                let pte = unsafe { *Self::table(l0_pa).add(i0) };
                if pte_flags(pte).contains(PteFlags::VALID) {
                    allocator.decref(pte_pa(pte));
                }
            }
            allocator.decref(l0_pa);
        }
        allocator.decref(self.root);
        self.root = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::tests::test_allocator;

    #[test]
    fn map_translate_unmap() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(16);
        let mut pt = PageTable::new(a).unwrap();
        let frame = a.alloc().unwrap();
        let flags = PteFlags::READ | PteFlags::WRITE | PteFlags::USER;
        pt.map(0x1000, frame, flags, a).unwrap();
        let (pa, f) = pt.translate(0x1000, a).unwrap();
        assert_eq!(pa, frame);
        assert!(f.contains(PteFlags::VALID | PteFlags::WRITE));
        assert!(pt.translate(0x2000, a).is_none());
        assert_eq!(pt.unmap(0x1000, a).unwrap(), frame);
        assert!(pt.translate(0x1000, a).is_none());
        a.decref(frame);
        pt.free(a);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_panics() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(16);
        let mut pt = PageTable::new(a).unwrap();
        let frame = a.alloc().unwrap();
        pt.map(0x3000, frame, PteFlags::READ, a).unwrap();
        let frame2 = a.alloc().unwrap();
        pt.map(0x3000, frame2, PteFlags::READ, a).unwrap();
    }

    #[test]
    fn out_of_range_is_fault() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(16);
        let mut pt = PageTable::new(a).unwrap();
        let frame = a.alloc().unwrap();
        assert_eq!(
            pt.map(USER_MAX, frame, PteFlags::READ, a),
            Err(KernelError::Fault)
        );
        a.decref(frame);
        pt.free(a);
    }

    #[test]
    fn free_releases_every_frame() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(16);
        let before = a.free_pages();
        let mut pt = PageTable::new(a).unwrap();
        for i in 0..4 {
            let frame = a.alloc().unwrap();
            pt.map(i * PGSIZE, frame, PteFlags::READ | PteFlags::USER, a)
                .unwrap();
        }
        pt.free(a);
        assert_eq!(a.free_pages(), before);
    }
}
