//! Pipes.
//!
//! A bounded byte ring with a reader end and a writer end. Blocked
//! readers and writers sleep on the pipe's two wait queues, with the
//! pipe spinlock as the condition lock.

use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::lock::SpinLock;
use crate::proc::WaitQueue;

pub const PIPE_SIZE: usize = 512;

/// Number of pipes in the system.
pub const NPIPE: usize = 16;

struct PipeInner {
    data: [u8; PIPE_SIZE],
    /// Total bytes read and written; wrapping counters.
    nread: u32,
    nwrite: u32,
    read_open: bool,
    write_open: bool,
    in_use: bool,
}

impl PipeInner {
    const fn new() -> Self {
        Self {
            data: [0; PIPE_SIZE],
            nread: 0,
            nwrite: 0,
            read_open: false,
            write_open: false,
            in_use: false,
        }
    }
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,
    read_wait: WaitQueue,
    write_wait: WaitQueue,
}

impl Pipe {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new("pipe", PipeInner::new()),
            read_wait: WaitQueue::new(),
            write_wait: WaitQueue::new(),
        }
    }
}

/// One end of a pipe, stored in a `File`.
#[derive(Copy, Clone)]
pub struct PipeEnd {
    pub pipe: usize,
    pub writable: bool,
}

pub struct Pipes {
    pool: [Pipe; NPIPE],
}

impl Pipes {
    pub const fn new() -> Self {
        Self {
            pool: [const { Pipe::new() }; NPIPE],
        }
    }
}

/// Allocates a pipe and returns its (read, write) ends.
pub fn alloc() -> Result<(PipeEnd, PipeEnd)> {
    let pipes = kernel().pipes();
    for (i, p) in pipes.pool.iter().enumerate() {
        let mut g = p.inner.lock();
        if !g.in_use {
            *g = PipeInner::new();
            g.in_use = true;
            g.read_open = true;
            g.write_open = true;
            return Ok((
                PipeEnd {
                    pipe: i,
                    writable: false,
                },
                PipeEnd {
                    pipe: i,
                    writable: true,
                },
            ));
        }
    }
    Err(KernelError::NoMem)
}

/// Closes one end. The pipe is recycled when both ends are gone.
pub fn close(end: PipeEnd) {
    let p = &kernel().pipes().pool[end.pipe];
    let mut g = p.inner.lock();
    if end.writable {
        g.write_open = false;
        p.read_wait.wakeup_all();
    } else {
        g.read_open = false;
        p.write_wait.wakeup_all();
    }
    if !g.read_open && !g.write_open {
        g.in_use = false;
    }
}

pub fn read(end: PipeEnd, dst: &mut [u8]) -> Result<usize> {
    assert!(!end.writable, "pipe read on write end");
    let p = &kernel().pipes().pool[end.pipe];
    let mut g = p.inner.lock();

    // Wait for data or writer close.
    while g.nread == g.nwrite && g.write_open {
        p.read_wait.sleep_interruptible(&mut g)?;
    }

    let mut n = 0;
    while n < dst.len() && g.nread != g.nwrite {
        dst[n] = g.data[g.nread as usize % PIPE_SIZE];
        g.nread = g.nread.wrapping_add(1);
        n += 1;
    }
    p.write_wait.wakeup_all();
    Ok(n)
}

pub fn write(end: PipeEnd, src: &[u8]) -> Result<usize> {
    assert!(end.writable, "pipe write on read end");
    let p = &kernel().pipes().pool[end.pipe];
    let mut g = p.inner.lock();

    let mut n = 0;
    while n < src.len() {
        if !g.read_open {
            // Writing with no reader raises SIGPIPE at the caller.
            return Err(KernelError::Pipe);
        }
        if g.nwrite.wrapping_sub(g.nread) as usize == PIPE_SIZE {
            p.read_wait.wakeup_all();
            p.write_wait.sleep_interruptible(&mut g)?;
            continue;
        }
        let idx = g.nwrite as usize % PIPE_SIZE;
        g.data[idx] = src[n];
        g.nwrite = g.nwrite.wrapping_add(1);
        n += 1;
    }
    p.read_wait.wakeup_all();
    Ok(n)
}
