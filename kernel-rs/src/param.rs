/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 4;

/// Open files per process.
pub const OPEN_MAX: usize = 32;

/// Open files per system.
pub const NFILE: usize = 100;

/// Size of the in-core inode cache.
pub const NINODE: usize = 64;

/// Number of signals; signal numbers are 1..NSIG.
pub const NSIG: usize = 32;

/// Pending signal records per system.
pub const NSIGNAL: usize = 128;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 0;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Filesystem block size in bytes.
pub const BSIZE: usize = 1024;

/// Size of the disk block cache.
pub const NBUF: usize = 30;

/// Maximum file path length.
pub const PATH_MAX: usize = 1024;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 255;

/// Maximum number of hard links to a single inode.
pub const LINK_MAX: usize = 127;

/// Maximum length of a process name.
pub const MAXPROCNAME: usize = 64;

/// Return addresses recorded by a spinlock for panic diagnostics.
pub const NCALLERPCS: usize = 10;

/// Clock ticks per second.
pub const TICKS_PER_SECOND: u64 = 100;
