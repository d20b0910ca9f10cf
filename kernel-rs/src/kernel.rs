//! The kernel context: every system-wide singleton, plus boot.
//!
//! All mutable global state lives in one statically initialized `Kernel`
//! value. Initialization order at boot is: console, page allocator,
//! kernel stacks, interrupt controller, timer, buffer cache device, first
//! process; the filesystem mounts later, from process context, because
//! mounting sleeps on buffers. Nothing is ever torn down.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::bio::Bcache;
use crate::console::Console;
use crate::file::FileTable;
use crate::fs::{FileSystem, Itable};
use crate::lock::{SleepableLock, SpinLock};
use crate::param::TICKS_PER_SECOND;
use crate::pipe::Pipes;
use crate::proc::{sched::Sched, CurrentProc, Procs};
use crate::vm::PageAllocator;

static KERNEL: Kernel = Kernel::zero();

#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

pub struct Kernel {
    panicked: AtomicBool,
    fs_mounted: AtomicBool,

    console: Console,
    printer: SpinLock<Printer>,
    allocator: PageAllocator,
    sched: SpinLock<Sched>,
    procs: Procs,
    bcache: Bcache,
    fs: FileSystem,
    ftable: FileTable,
    pipes: Pipes,
    /// Clock ticks since boot; sleepers on the tick queue are nanosleep.
    ticks: SleepableLock<u64>,

    /// uname's node name; settable at runtime.
    nodename: SpinLock<arrayvec::ArrayVec<u8, 64>>,
}

impl Kernel {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            fs_mounted: AtomicBool::new(false),
            console: Console::new(),
            printer: SpinLock::new("printer", Printer),
            allocator: PageAllocator::new(),
            sched: SpinLock::new("run queue", Sched::new()),
            procs: Procs::new(),
            bcache: Bcache::new(),
            fs: FileSystem::new(),
            ftable: FileTable::new(),
            pipes: Pipes::new(),
            ticks: SleepableLock::new("time", 0),
            nodename: SpinLock::new("utsname", arrayvec::ArrayVec::new_const()),
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    pub fn sched(&self) -> &SpinLock<Sched> {
        &self.sched
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn itable(&self) -> &Itable {
        &self.fs.itable
    }

    pub fn ftable(&self) -> &FileTable {
        &self.ftable
    }

    pub fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    pub fn ticks(&self) -> &SleepableLock<u64> {
        &self.ticks
    }

    /// uname's node name.
    pub fn nodename(&self) -> arrayvec::ArrayVec<u8, 64> {
        self.nodename.lock().clone()
    }

    pub fn set_nodename(&self, name: &[u8]) {
        let mut node = self.nodename.lock();
        node.clear();
        let n = name.len().min(node.capacity());
        let _ = node.try_extend_from_slice(&name[..n]);
    }

    /// Seconds since boot, for inode timestamps.
    pub fn wall_time(&self) -> u32 {
        let t = *self.ticks.lock();
        (t / TICKS_PER_SECOND) as u32
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Kernel initialization that must run in process context: mounting
    /// the root filesystem sleeps on buffers. The first process does the
    /// mount; every process passes through to pick up its root cwd.
    pub fn finish_boot_in_process(&self) {
        if !self.fs_mounted.swap(true, Ordering::AcqRel) {
            // SAFETY: first process, before any other fs access.
            unsafe { self.fs.mount(crate::param::ROOTDEV) }.expect("mounting root fs");
            log::info!("root filesystem mounted");
        }
        if let Some(cur) = CurrentProc::get() {
            let data = cur.data();
            if data.cwd.is_none() {
                data.cwd = Some(self.itable().root().expect("root inode"));
            }
        }
    }

    /// Prints the given formatted string on the console.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // The panicking CPU owns the console; skip the lock.
            // SAFETY: other CPUs are frozen.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut lock = self.printer.lock();
            lock.write_fmt(args)
        }
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }
}

/// Serializes console output.
pub struct Printer;

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            kernel().console().putc(b);
        }
        Ok(())
    }
}

/// print! prints to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let _ = $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*));
    }};
}

/// println! prints to the console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// The `log` facade, routed to the console printer.
struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn log_init() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Info));
}

/// Handles panic: freeze the other CPUs and report on the console.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().panic();
    println!("kernel panic: {}", info);
    loop {
        crate::arch::wait_for_event();
    }
}

/// A user program that execs /init: the packed initcode image, loaded at
/// virtual address 0 of the first process.
///
/// od -t xC initcode
#[cfg(target_arch = "aarch64")]
const INITCODE: [u8; 64] = [
    0x20, 0x00, 0x00, 0x10, // adr x0, init_path
    0x01, 0x00, 0x80, 0xd2, // mov x1, #0 (argv)
    0x02, 0x00, 0x80, 0xd2, // mov x2, #0 (envp)
    0x48, 0x00, 0x80, 0xd2, // mov x8, #SYS_EXEC
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0x00, 0x00, 0x80, 0xd2, // mov x0, #0
    0x68, 0x00, 0x80, 0xd2, // mov x8, #SYS_EXIT
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0xfc, 0xff, 0xff, 0x17, // b . - 16
    // init_path: "/init\0"
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The bootstrap processor enters here; secondary CPUs spin on STARTED.
#[cfg(target_arch = "aarch64")]
pub unsafe fn kernel_main() -> ! {
    use crate::arch::arm::intr;
    use crate::arch::cpu_id;

    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpu_id() == 0 {
        kernel().console().init();
        log_init();
        println!();
        println!("argentum kernel is booting");

        // Physical page allocator over the RAM after the kernel image.
        extern "C" {
            // Defined by kernel.ld.
            static mut __kernel_end: [u8; 0];
        }
        let start = core::ptr::addr_of!(__kernel_end) as usize;
        // SAFETY: the region above the image is unused RAM.
        unsafe { kernel().allocator().init(start, crate::arch::arm::PHYSTOP) };

        // Kernel stacks for every process slot.
        // SAFETY: boot is single threaded.
        unsafe { kernel().procs().init_kstacks() };

        // Interrupt controller and timer.
        // SAFETY: boot is single threaded.
        unsafe {
            intr::init();
            intr::init_cpu();
            intr::enable(intr::TIMER_IRQ);
            intr::enable(intr::UART_IRQ);
            crate::arch::arm::timer_init();
        }

        // The boot disk: a filesystem image the loader placed in RAM.
        // SAFETY: the image region is reserved by the boot protocol.
        let disk = unsafe {
            crate::bio::RamDisk::new(
                crate::arch::arm::RAMDISK_BASE as *mut u8,
                crate::arch::arm::RAMDISK_BLOCKS,
            )
        };
        // SAFETY: boot is single threaded; the disk lives forever.
        unsafe {
            let slot = &mut *core::ptr::addr_of_mut!(BOOT_DISK);
            kernel().bcache().init(slot.write(disk));
        };

        // First user process.
        kernel().procs().spawn_init(&INITCODE).expect("spawn init");

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            crate::arch::spin_hint();
        }
        println!("cpu {} starting", cpu_id());
        // SAFETY: per-CPU initialization.
        unsafe {
            intr::init_cpu();
            crate::arch::arm::timer_init();
        }
    }

    // SAFETY: called once per CPU.
    unsafe { crate::proc::sched::scheduler() }
}

#[cfg(target_arch = "aarch64")]
static mut BOOT_DISK: core::mem::MaybeUninit<crate::bio::RamDisk> =
    core::mem::MaybeUninit::uninit();

/// Host-test bootstrap: attach a RamDisk with a fresh ext2 image to the
/// kernel statics, serialized by a global lock because the kernel statics
/// are shared across the test harness's threads.
#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, Once};

    use super::kernel;
    use crate::bio::RamDisk;
    use crate::param::{BSIZE, ROOTDEV};

    static TEST_LOCK: Mutex<()> = Mutex::new(());
    static SETUP: Once = Once::new();

    /// Serializes tests that touch the kernel statics (the per-CPU
    /// interrupt nesting counter is shared across the harness's threads).
    pub fn lock() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `lock()` plus a mounted root filesystem.
    pub fn setup() -> MutexGuard<'static, ()> {
        let guard = lock();
        SETUP.call_once(|| {
            let nblocks = 1024u32;
            let image = Box::leak(vec![0u8; nblocks as usize * BSIZE].into_boxed_slice());
            crate::fs::ext2::tests::mkfs(image, nblocks, 128);
            // SAFETY: the leaked image is exclusively the disk's.
            let disk = Box::leak(Box::new(unsafe {
                RamDisk::new(image.as_mut_ptr(), nblocks)
            }));
            // SAFETY: nothing else has touched the bcache yet.
            unsafe { kernel().bcache().init(disk) };
            // SAFETY: single mount, before any fs access.
            unsafe { kernel().fs.mount(ROOTDEV) }.expect("test fs mount");

            // A page pool for VM-dependent paths (exec tests and such).
            let pool = Box::leak(vec![0u8; 512 * crate::arch::PGSIZE].into_boxed_slice());
            let start = pool.as_ptr() as usize;
            // SAFETY: the leaked pool is unused RAM from the kernel's view.
            unsafe { kernel().allocator().init(start, start + pool.len()) };
        });
        guard
    }
}
