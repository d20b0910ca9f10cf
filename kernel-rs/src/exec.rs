//! exec: replace the current image with an ELF executable.
//!
//! The new address space is built completely before the old one is
//! touched, so any failure up to the commit point leaves the process
//! unchanged.

use arrayvec::ArrayVec;

use crate::arch::{pg_round_up, PGSIZE, USER_STACK_TOP};
use crate::elf::{ElfHeader, ProgHeader, ELF_PROG_FLAG_WRITE, ELF_PROG_LOAD};
use crate::error::{KernelError, Result};
use crate::fs::{self, can_exec, name_lookup, stat::is_reg};
use crate::kernel::kernel;
use crate::param::MAXARG;
use crate::proc::CurrentProc;
use crate::vm::{VmFlags, VmSpace};

/// Pages of user stack an exec'd image starts with.
const USTACK_PAGES: usize = 4;

/// Longest single argument or environment string.
const ARG_MAX_LEN: usize = 256;

/// Loads `filesz` bytes of the segment at `off` in the executable into
/// the new space at `vaddr`; the rest of `memsz` stays zero-filled.
fn load_segment(
    vm: &mut VmSpace,
    g: &mut fs::InodeGuard,
    vaddr: usize,
    off: u32,
    filesz: usize,
) -> Result<()> {
    let allocator = kernel().allocator();
    let mut chunk = [0u8; 512];
    let mut done = 0;
    while done < filesz {
        let n = chunk.len().min(filesz - done);
        let read = crate::fs::ext2::inode_read(
            kernel().fs().ext2(),
            g,
            off + done as u32,
            &mut chunk[..n],
        )?;
        if read != n {
            return Err(KernelError::Inval);
        }
        vm.write_for_load(vaddr + done, &chunk[..n], allocator)?;
        done += n;
    }
    Ok(())
}

/// Copies the strings of a user argv/envp vector into the new stack,
/// pushing a null-terminated pointer array afterwards. Returns the user
/// address of the array and the count.
fn copy_vector(
    old_vm: &mut VmSpace,
    new_vm: &mut VmSpace,
    uvec: usize,
    sp: &mut usize,
) -> Result<(usize, usize)> {
    let allocator = kernel().allocator();
    let mut ptrs: ArrayVec<usize, { MAXARG + 1 }> = ArrayVec::new();

    if uvec != 0 {
        for i in 0..=MAXARG {
            if i == MAXARG {
                return Err(KernelError::Inval);
            }
            let mut pbytes = [0u8; core::mem::size_of::<usize>()];
            let pbytes_len = pbytes.len();
            old_vm.copy_in(&mut pbytes, uvec + i * pbytes_len, allocator)?;
            let ustr = usize::from_le_bytes(pbytes);
            if ustr == 0 {
                break;
            }
            let mut buf = [0u8; ARG_MAX_LEN];
            let len = old_vm.copy_in_str(&mut buf, ustr, allocator)?;
            *sp -= len + 1;
            new_vm.copy_out(*sp, &buf[..=len], allocator)?;
            ptrs.push(*sp);
        }
    }

    // The pointer array, null terminated, 16-byte aligned below the
    // strings.
    let bytes = (ptrs.len() + 1) * core::mem::size_of::<usize>();
    *sp = (*sp - bytes) & !0xf;
    for (i, p) in ptrs.iter().enumerate() {
        new_vm.copy_out(
            *sp + i * core::mem::size_of::<usize>(),
            &p.to_le_bytes(),
            allocator,
        )?;
    }
    new_vm.copy_out(
        *sp + ptrs.len() * core::mem::size_of::<usize>(),
        &0usize.to_le_bytes(),
        allocator,
    )?;
    Ok((*sp, ptrs.len()))
}

/// exec(path, argv, envp). On success the process returns to user mode
/// at the new entry point; the old image is gone. Descriptors survive,
/// minus the close-on-exec ones; caught signals revert to their default
/// disposition.
pub fn exec(cur: CurrentProc, path: &[u8], uargv: usize, uenvp: usize) -> Result<usize> {
    let itable = kernel().itable();
    let allocator = kernel().allocator();
    let cred = cur.cred();

    let ip = name_lookup(path, cur.data().cwd.as_ref().ok_or(KernelError::NoEnt)?, &cred)?;
    let mut g = itable.lock(&ip);

    let r = (|| {
        if !is_reg(g.mode) {
            return Err(KernelError::Perm);
        }
        if !can_exec(&g, &cred) {
            return Err(KernelError::Perm);
        }

        // The ELF header.
        let mut head_bytes = [0u8; core::mem::size_of::<ElfHeader>()];
        let n = crate::fs::ext2::inode_read(kernel().fs().ext2(), &mut g, 0, &mut head_bytes)?;
        if n != head_bytes.len() {
            return Err(KernelError::Inval);
        }
        // SAFETY: ElfHeader is plain data.
        let elf =
            unsafe { core::ptr::read_unaligned(head_bytes.as_ptr() as *const ElfHeader) };
        if !elf.is_valid() {
            return Err(KernelError::Inval);
        }

        // Build the whole new space before touching the old one.
        let mut vm = VmSpace::new(allocator)?;
        let r = (|| {
            let mut image_top = 0usize;
            for i in 0..elf.phnum {
                let mut ph_bytes = [0u8; core::mem::size_of::<ProgHeader>()];
                let off = elf.phoff as u32 + i as u32 * ph_bytes.len() as u32;
                let n = crate::fs::ext2::inode_read(
                    kernel().fs().ext2(),
                    &mut g,
                    off,
                    &mut ph_bytes,
                )?;
                if n != ph_bytes.len() {
                    return Err(KernelError::Inval);
                }
                // SAFETY: ProgHeader is plain data.
                let ph = unsafe {
                    core::ptr::read_unaligned(ph_bytes.as_ptr() as *const ProgHeader)
                };
                if ph.typ != ELF_PROG_LOAD {
                    continue;
                }
                if ph.memsz < ph.filesz {
                    return Err(KernelError::Inval);
                }
                let vaddr = ph.vaddr as usize;
                let memsz = ph.memsz as usize;
                if vaddr.checked_add(memsz).is_none() {
                    return Err(KernelError::Inval);
                }

                let mut flags = VmFlags::READ;
                if ph.flags & ELF_PROG_FLAG_WRITE != 0 {
                    flags |= VmFlags::WRITE;
                }
                if ph.flags & crate::elf::ELF_PROG_FLAG_EXEC != 0 {
                    flags |= VmFlags::EXEC;
                }
                vm.range_alloc(vaddr, memsz, flags)?;
                vm.populate(vaddr, memsz, allocator)?;
                load_segment(&mut vm, &mut g, vaddr, ph.off as u32, ph.filesz as usize)?;

                image_top = image_top.max(pg_round_up(vaddr + memsz));
            }

            // The user stack, eagerly mapped, with a guard gap below.
            let stack_base = USER_STACK_TOP - USTACK_PAGES * PGSIZE;
            vm.range_alloc(stack_base, USTACK_PAGES * PGSIZE, VmFlags::READ | VmFlags::WRITE)?;
            vm.populate(stack_base, USTACK_PAGES * PGSIZE, allocator)?;

            // The heap starts a page above the image.
            vm.set_heap(image_top + PGSIZE);

            Ok(elf.entry as usize)
        })();

        match r {
            Ok(entry) => Ok((vm, entry)),
            Err(e) => {
                vm.free(allocator);
                Err(e)
            }
        }
    })();

    itable.unlock_put(g, ip);
    let (mut vm, entry) = r?;

    // Arguments: copy from the old space onto the new stack.
    let mut sp = USER_STACK_TOP;
    let data = cur.data();
    let old_vm = data.vm.as_mut().expect("exec: no vm");
    let vectors = (|| {
        let (envp_addr, _envc) = copy_vector(old_vm, &mut vm, uenvp, &mut sp)?;
        let (argv_addr, argc) = copy_vector(old_vm, &mut vm, uargv, &mut sp)?;
        Ok((envp_addr, argv_addr, argc))
    })();
    let (envp_addr, argv_addr, argc) = match vectors {
        Ok(v) => v,
        Err(e) => {
            vm.free(allocator);
            return Err(e);
        }
    };

    // Commit point: nothing can fail from here on.
    let old = core::mem::replace(old_vm, vm);
    old.free(allocator);
    data.trap_frame = Default::default();
    data.trap_frame.pc = entry;
    data.trap_frame.sp = sp;
    data.trap_frame.x[0] = argc;
    data.trap_frame.x[1] = argv_addr;
    data.trap_frame.x[2] = envp_addr;

    // Take the last path component as the process name.
    let name = path.rsplit(|&c| c == b'/').next().unwrap_or(path);
    data.set_name(name);

    // Close-on-exec sweep.
    let closing: ArrayVec<crate::file::Fd, { crate::param::OPEN_MAX }> = {
        let mut files = cur.proc().files.lock();
        let cloexec: ArrayVec<usize, { crate::param::OPEN_MAX }> = files
            .entries()
            .filter(|(_, f)| f.cloexec)
            .map(|(fd, _)| fd)
            .collect();
        cloexec.iter().map(|&fd| files.take(fd).unwrap()).collect()
    };
    for fd in closing {
        kernel().ftable().close(fd.file);
    }

    // Handled signals fall back to the default disposition.
    {
        let procs = kernel().procs();
        let _t = procs.table().lock();
        // SAFETY: the table lock is held.
        unsafe { procs.shared_raw(cur.slot()) }.sig.reset_for_exec();
    }

    Ok(argc)
}
