//! Per-process address spaces.

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::arch::{pg_round_down, pg_round_up, PGSIZE, USER_MAX};
use crate::error::{KernelError, Result};
use crate::vm::{PageAllocator, PageTable, PteFlags};

/// Mapped ranges per address space.
const NAREA: usize = 16;

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl VmFlags {
    fn pte_flags(self) -> PteFlags {
        let mut f = PteFlags::USER;
        if self.contains(VmFlags::READ) {
            f |= PteFlags::READ;
        }
        if self.contains(VmFlags::WRITE) {
            f |= PteFlags::WRITE;
        }
        if self.contains(VmFlags::EXEC) {
            f |= PteFlags::EXEC;
        }
        f
    }
}

/// One mapped range. Page-aligned, non-empty.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VmAreaEntry {
    pub start: usize,
    pub len: usize,
    pub flags: VmFlags,
}

impl VmAreaEntry {
    fn end(&self) -> usize {
        self.start + self.len
    }

    fn contains(&self, va: usize) -> bool {
        va >= self.start && va < self.end()
    }
}

/// A user address space: the page table plus the ordered map-entry list.
///
/// Invariant: entries are sorted by start and pairwise non-overlapping;
/// every present user page lies inside exactly one entry.
pub struct VmSpace {
    pt: PageTable,
    areas: ArrayVec<VmAreaEntry, NAREA>,
    /// Program break; the heap occupies `heap_base..brk`.
    heap_base: usize,
    brk: usize,
}

impl VmSpace {
    pub fn new(allocator: &PageAllocator) -> Result<Self> {
        Ok(Self {
            pt: PageTable::new(allocator)?,
            areas: ArrayVec::new(),
            heap_base: 0,
            brk: 0,
        })
    }

    pub fn areas(&self) -> &[VmAreaEntry] {
        &self.areas
    }

    pub fn page_table_root(&self) -> usize {
        self.pt.root()
    }

    fn area_containing(&self, va: usize) -> Option<&VmAreaEntry> {
        self.areas.iter().find(|a| a.contains(va))
    }

    /// Inserts the range `addr..addr+len`, merging with adjacent entries of
    /// equal flags. Pages are mapped lazily, on first fault.
    pub fn range_alloc(&mut self, addr: usize, len: usize, flags: VmFlags) -> Result<()> {
        let start = pg_round_down(addr);
        let end = pg_round_up(addr + len);
        if len == 0 {
            return Ok(());
        }
        if end <= start || end > USER_MAX {
            return Err(KernelError::Inval);
        }
        if self.areas.iter().any(|a| start < a.end() && a.start < end) {
            return Err(KernelError::Inval);
        }

        let pos = self
            .areas
            .iter()
            .position(|a| a.start > start)
            .unwrap_or(self.areas.len());

        // Merge with the neighbor below and/or above when compatible.
        let merges_prev =
            pos > 0 && self.areas[pos - 1].end() == start && self.areas[pos - 1].flags == flags;
        let merges_next =
            pos < self.areas.len() && self.areas[pos].start == end && self.areas[pos].flags == flags;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next_end = self.areas[pos].end();
                self.areas[pos - 1].len = next_end - self.areas[pos - 1].start;
                let _ = self.areas.remove(pos);
            }
            (true, false) => {
                self.areas[pos - 1].len = end - self.areas[pos - 1].start;
            }
            (false, true) => {
                let next_end = self.areas[pos].end();
                self.areas[pos] = VmAreaEntry {
                    start,
                    len: next_end - start,
                    flags,
                };
            }
            (false, false) => {
                if self.areas.is_full() {
                    return Err(KernelError::NoMem);
                }
                self.areas.insert(
                    pos,
                    VmAreaEntry {
                        start,
                        len: end - start,
                        flags,
                    },
                );
            }
        }
        Ok(())
    }

    /// Removes the range `addr..addr+len`, unmapping any present pages and
    /// splitting entries that straddle the boundary.
    pub fn range_free(&mut self, addr: usize, len: usize, allocator: &PageAllocator) -> Result<()> {
        let start = pg_round_down(addr);
        let end = pg_round_up(addr + len);
        if len == 0 {
            return Ok(());
        }

        let mut va = start;
        while va < end {
            if let Some((pa, _)) = self.pt.translate(va, allocator) {
                let _ = self.pt.unmap(va, allocator)?;
                allocator.decref(pa);
            }
            va += PGSIZE;
        }

        let mut i = 0;
        while i < self.areas.len() {
            let a = self.areas[i];
            if a.end() <= start || a.start >= end {
                i += 1;
                continue;
            }
            let keeps_head = a.start < start;
            let keeps_tail = a.end() > end;
            match (keeps_head, keeps_tail) {
                (false, false) => {
                    let _ = self.areas.remove(i);
                }
                (true, false) => {
                    self.areas[i].len = start - a.start;
                    i += 1;
                }
                (false, true) => {
                    self.areas[i] = VmAreaEntry {
                        start: end,
                        len: a.end() - end,
                        flags: a.flags,
                    };
                    i += 1;
                }
                (true, true) => {
                    if self.areas.is_full() {
                        return Err(KernelError::NoMem);
                    }
                    self.areas[i].len = start - a.start;
                    self.areas.insert(
                        i + 1,
                        VmAreaEntry {
                            start: end,
                            len: a.end() - end,
                            flags: a.flags,
                        },
                    );
                    i += 2;
                }
            }
        }
        Ok(())
    }

    /// Resolves a fault at `va`. On success the faulting access can be
    /// retried; on error the caller delivers SIGSEGV.
    pub fn handle_fault(&mut self, va: usize, write: bool, allocator: &PageAllocator) -> Result<()> {
        let area = *self.area_containing(va).ok_or(KernelError::Fault)?;
        if write && !area.flags.contains(VmFlags::WRITE) {
            return Err(KernelError::Fault);
        }

        let page = pg_round_down(va);
        match self.pt.translate(page, allocator) {
            None => {
                // Demand-zero page; mapped with the area's permissions.
                let pa = allocator.alloc()?;
                self.pt.map(page, pa, area.flags.pte_flags(), allocator)?;
                Ok(())
            }
            Some((pa, flags)) if write && flags.contains(PteFlags::COW) => {
                self.cow_split(page, pa, flags, allocator)
            }
            Some((_, flags)) => {
                // Present already: spurious unless the access needed a
                // right the mapping lacks.
                if write && !flags.contains(PteFlags::WRITE) {
                    Err(KernelError::Fault)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Write fault on a shared copy-on-write page: take the frame if we
    /// are the last sharer, else copy it.
    fn cow_split(
        &mut self,
        page: usize,
        pa: usize,
        flags: PteFlags,
        allocator: &PageAllocator,
    ) -> Result<()> {
        let new_flags = (flags - PteFlags::COW) | PteFlags::WRITE;
        if allocator.refcnt(pa) == 1 {
            self.pt.set_flags(page, new_flags, allocator)
        } else {
            let new_pa = allocator.alloc()?;
            // SAFETY: both frames are live whole pages.
            unsafe {
                core::ptr::copy_nonoverlapping(pa as *const u8, new_pa as *mut u8, PGSIZE);
            }
            let _ = self.pt.unmap(page, allocator)?;
            allocator.decref(pa);
            self.pt.map(page, new_pa, new_flags, allocator)
        }
    }

    /// Maps every page of the range now instead of on first touch.
    pub fn populate(&mut self, addr: usize, len: usize, allocator: &PageAllocator) -> Result<()> {
        let mut va = pg_round_down(addr);
        let end = pg_round_up(addr + len);
        while va < end {
            if self.pt.translate(va, allocator).is_none() {
                self.handle_fault(va, false, allocator)?;
            }
            va += PGSIZE;
        }
        Ok(())
    }

    /// Copy-on-write clone for fork. Every present page becomes a shared
    /// read-only alias in both spaces.
    pub fn clone_cow(&mut self, allocator: &PageAllocator) -> Result<VmSpace> {
        let mut child = VmSpace::new(allocator)?;
        child.areas = self.areas.clone();
        child.heap_base = self.heap_base;
        child.brk = self.brk;

        for area in self.areas.clone().iter() {
            let mut va = area.start;
            while va < area.end() {
                if let Some((pa, flags)) = self.pt.translate(va, allocator) {
                    let shared = if flags.contains(PteFlags::WRITE) || flags.contains(PteFlags::COW)
                    {
                        (flags - PteFlags::WRITE) | PteFlags::COW
                    } else {
                        flags
                    };
                    if shared != flags {
                        self.pt.set_flags(va, shared, allocator)?;
                    }
                    allocator.incref(pa);
                    child.pt.map(va, pa, shared, allocator)?;
                }
                va += PGSIZE;
            }
        }
        Ok(child)
    }

    fn user_page(
        &mut self,
        va: usize,
        write: bool,
        allocator: &PageAllocator,
    ) -> Result<*mut u8> {
        let page = pg_round_down(va);
        let (pa, flags) = self
            .pt
            .translate(page, allocator)
            .ok_or(KernelError::Fault)?;
        if !flags.contains(PteFlags::USER) {
            return Err(KernelError::Fault);
        }
        if write {
            if flags.contains(PteFlags::COW) {
                let area = self.area_containing(va).ok_or(KernelError::Fault)?;
                if !area.flags.contains(VmFlags::WRITE) {
                    return Err(KernelError::Fault);
                }
                self.cow_split(page, pa, flags, allocator)?;
                let (pa, _) = self.pt.translate(page, allocator).ok_or(KernelError::Fault)?;
                return Ok((pa + (va - page)) as *mut u8);
            }
            if !flags.contains(PteFlags::WRITE) {
                return Err(KernelError::Fault);
            }
        } else if !flags.contains(PteFlags::READ) {
            return Err(KernelError::Fault);
        }
        Ok((pa + (va - page)) as *mut u8)
    }

    /// Writes into the space ignoring user permission bits. Only the
    /// exec loader uses this, to fill freshly mapped pages before the
    /// image's own permissions apply; the pages must be present and
    /// unshared.
    pub fn write_for_load(&mut self, va: usize, src: &[u8], allocator: &PageAllocator) -> Result<()> {
        let mut off = 0;
        while off < src.len() {
            let dst_va = va + off;
            let n = (PGSIZE - dst_va % PGSIZE).min(src.len() - off);
            let page = pg_round_down(dst_va);
            let (pa, flags) = self
                .pt
                .translate(page, allocator)
                .ok_or(KernelError::Fault)?;
            if flags.contains(PteFlags::COW) {
                return Err(KernelError::Fault);
            }
            // SAFETY: pa is a live frame mapped only in this new space.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src[off..].as_ptr(),
                    (pa + (dst_va - page)) as *mut u8,
                    n,
                );
            }
            off += n;
        }
        Ok(())
    }

    /// Copies `src` into this space at `va`. Every page must be present
    /// and writable (a shared COW page is split, never faulted in).
    pub fn copy_out(&mut self, va: usize, src: &[u8], allocator: &PageAllocator) -> Result<()> {
        let mut off = 0;
        while off < src.len() {
            let dst_va = va + off;
            let n = (PGSIZE - dst_va % PGSIZE).min(src.len() - off);
            let dst = self.user_page(dst_va, true, allocator)?;
            // SAFETY: dst points at n in-frame bytes.
            unsafe { core::ptr::copy_nonoverlapping(src[off..].as_ptr(), dst, n) };
            off += n;
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes from this space at `va`.
    pub fn copy_in(&mut self, dst: &mut [u8], va: usize, allocator: &PageAllocator) -> Result<()> {
        let mut off = 0;
        while off < dst.len() {
            let src_va = va + off;
            let n = (PGSIZE - src_va % PGSIZE).min(dst.len() - off);
            let src = self.user_page(src_va, false, allocator)?;
            // SAFETY: src points at n in-frame bytes.
            unsafe { core::ptr::copy_nonoverlapping(src, dst[off..].as_mut_ptr(), n) };
            off += n;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from `va` into `buf`, returning its
    /// length without the terminator.
    pub fn copy_in_str(
        &mut self,
        buf: &mut [u8],
        va: usize,
        allocator: &PageAllocator,
    ) -> Result<usize> {
        let mut off = 0;
        loop {
            if off == buf.len() {
                return Err(KernelError::NameTooLong);
            }
            let src_va = va + off;
            let n = (PGSIZE - src_va % PGSIZE).min(buf.len() - off);
            let src = self.user_page(src_va, false, allocator)?;
            for i in 0..n {
                // SAFETY: in-frame byte.
                let b = unsafe { *src.add(i) };
                buf[off + i] = b;
                if b == 0 {
                    return Ok(off + i);
                }
            }
            off += n;
        }
    }

    /// Establishes the heap for a fresh image; `process_grow` moves the
    /// break from here on.
    pub fn set_heap(&mut self, base: usize) {
        self.heap_base = base;
        self.brk = base;
    }

    pub fn brk(&self) -> usize {
        self.brk
    }

    /// Moves the program break by `delta` bytes, returning the old break.
    pub fn grow(&mut self, delta: isize, allocator: &PageAllocator) -> Result<usize> {
        let old = self.brk;
        let new = old
            .checked_add_signed(delta)
            .filter(|&b| b >= self.heap_base && b <= USER_MAX)
            .ok_or(KernelError::NoMem)?;
        if delta > 0 {
            let mapped_end = pg_round_up(old.max(self.heap_base));
            if pg_round_up(new) > mapped_end {
                self.range_alloc(
                    mapped_end,
                    pg_round_up(new) - mapped_end,
                    VmFlags::READ | VmFlags::WRITE,
                )?;
            }
        } else if delta < 0 {
            let keep = pg_round_up(new);
            let old_end = pg_round_up(old);
            if old_end > keep {
                self.range_free(keep, old_end - keep, allocator)?;
            }
        }
        self.brk = new;
        Ok(old)
    }

    /// Releases every mapping and the table itself.
    pub fn free(self, allocator: &PageAllocator) {
        self.pt.free(allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::tests::test_allocator;

    fn space(a: &PageAllocator) -> VmSpace {
        VmSpace::new(a).unwrap()
    }

    #[test]
    fn areas_stay_sorted_and_disjoint() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.range_alloc(0x4000, PGSIZE, VmFlags::READ).unwrap();
        vm.range_alloc(0x1000, PGSIZE, VmFlags::READ).unwrap();
        vm.range_alloc(0x8000, PGSIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        let areas = vm.areas();
        for w in areas.windows(2) {
            assert!(w[0].start < w[1].start);
            assert!(w[0].end() <= w[1].start);
        }
        // Overlap is rejected.
        assert_eq!(
            vm.range_alloc(0x4000, PGSIZE, VmFlags::READ),
            Err(KernelError::Inval)
        );
        vm.free(a);
    }

    #[test]
    fn adjacent_compatible_areas_merge() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.range_alloc(0x1000, PGSIZE, VmFlags::READ).unwrap();
        vm.range_alloc(0x2000, PGSIZE, VmFlags::READ).unwrap();
        assert_eq!(vm.areas().len(), 1);
        assert_eq!(vm.areas()[0].len, 2 * PGSIZE);
        // Different flags do not merge.
        vm.range_alloc(0x3000, PGSIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        assert_eq!(vm.areas().len(), 2);
        vm.free(a);
    }

    #[test]
    fn range_free_splits_straddled_area() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.range_alloc(0x1000, 4 * PGSIZE, VmFlags::READ).unwrap();
        vm.range_free(0x2000, PGSIZE, a).unwrap();
        let areas = vm.areas();
        assert_eq!(areas.len(), 2);
        assert_eq!((areas[0].start, areas[0].len), (0x1000, PGSIZE));
        assert_eq!((areas[1].start, areas[1].len), (0x3000, 2 * PGSIZE));
        vm.free(a);
    }

    #[test]
    fn fault_outside_any_area_is_segv() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        assert!(vm.handle_fault(0x7000, false, a).is_err());
        vm.free(a);
    }

    #[test]
    fn demand_zero_then_write_round_trip() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.range_alloc(0x1000, PGSIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        vm.handle_fault(0x1234, true, a).unwrap();
        vm.copy_out(0x1200, b"hello", a).unwrap();
        let mut back = [0u8; 5];
        vm.copy_in(&mut back, 0x1200, a).unwrap();
        assert_eq!(&back, b"hello");
        vm.free(a);
    }

    #[test]
    fn write_fault_on_readonly_area_is_segv() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.range_alloc(0x1000, PGSIZE, VmFlags::READ).unwrap();
        assert!(vm.handle_fault(0x1000, true, a).is_err());
        vm.free(a);
    }

    #[test]
    fn cow_clone_diverges() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(64);
        let mut parent = space(a);
        parent
            .range_alloc(0x1000, PGSIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        parent.handle_fault(0x1000, true, a).unwrap();
        parent.copy_out(0x1000, b"A", a).unwrap();

        let mut child = parent.clone_cow(a).unwrap();

        // The child sees the parent's data without copying up front.
        let mut b = [0u8; 1];
        child.copy_in(&mut b, 0x1000, a).unwrap();
        assert_eq!(&b, b"A");

        // Parent writes after the fork; the child must keep the old data.
        parent.copy_out(0x1000, b"B", a).unwrap();
        child.copy_in(&mut b, 0x1000, a).unwrap();
        assert_eq!(&b, b"A");
        let mut p = [0u8; 1];
        parent.copy_in(&mut p, 0x1000, a).unwrap();
        assert_eq!(&p, b"B");

        parent.free(a);
        child.free(a);
    }

    #[test]
    fn cow_last_sharer_takes_the_frame() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(64);
        let mut parent = space(a);
        parent
            .range_alloc(0x1000, PGSIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        parent.handle_fault(0x1000, true, a).unwrap();
        let child = parent.clone_cow(a).unwrap();
        child.free(a);
        let before = a.free_pages();
        // Only one sharer left: the write fault must not allocate.
        parent.handle_fault(0x1000, true, a).unwrap();
        assert_eq!(a.free_pages(), before);
        parent.free(a);
    }

    #[test]
    fn copy_out_does_not_fault_in() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.range_alloc(0x1000, PGSIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        // Page not yet present: EFAULT, not demand allocation.
        assert_eq!(vm.copy_out(0x1000, b"x", a), Err(KernelError::Fault));
        vm.free(a);
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.range_alloc(0x1000, PGSIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        vm.handle_fault(0x1000, true, a).unwrap();
        vm.copy_out(0x1000, b"/bin/sh\0garbage", a).unwrap();
        let mut buf = [0u8; 32];
        let n = vm.copy_in_str(&mut buf, 0x1000, a).unwrap();
        assert_eq!(&buf[..n], b"/bin/sh");
        // Unterminated string overflowing the buffer.
        let mut tiny = [0u8; 4];
        assert_eq!(
            vm.copy_in_str(&mut tiny, 0x1000, a),
            Err(KernelError::NameTooLong)
        );
        vm.free(a);
    }

    #[test]
    fn grow_moves_the_break_and_back() {
        let _lock = crate::kernel::test_support::lock();
        let a = test_allocator(32);
        let mut vm = space(a);
        vm.set_heap(0x10000);
        let old = vm.grow(3 * PGSIZE as isize, a).unwrap();
        assert_eq!(old, 0x10000);
        assert_eq!(vm.brk(), 0x10000 + 3 * PGSIZE);
        vm.handle_fault(0x10000, true, a).unwrap();
        vm.copy_out(0x10000, b"heap", a).unwrap();
        let old = vm.grow(-(3 * PGSIZE as isize), a).unwrap();
        assert_eq!(old, 0x10000 + 3 * PGSIZE);
        assert_eq!(vm.brk(), 0x10000);
        // The freed pages are gone from the page table.
        let mut b = [0u8; 1];
        assert_eq!(vm.copy_in(&mut b, 0x10000, a), Err(KernelError::Fault));
        vm.free(a);
    }
}
