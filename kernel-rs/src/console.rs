//! The console: a line-disciplined character device over the UART.
//!
//! Every S_IFCHR and S_IFBLK inode currently funnels through here.
//! Input is gathered a line at a time with echo, backspace and kill
//! processing; readers sleep on the console lock until a full line (or
//! end-of-file) is buffered.

use crate::error::Result;
use crate::lock::SleepableLock;
use crate::uart::{Uart, UART_BASE};

const INPUT_BUF: usize = 128;

const CTRL_D: u8 = 4; // end of file
const CTRL_U: u8 = 21; // kill line
const BACKSPACE: u8 = 0x7f;

struct ConsoleInner {
    buf: [u8; INPUT_BUF],
    /// Read, written and edited cursors; wrapping counters.
    r: u32,
    w: u32,
    e: u32,
}

impl ConsoleInner {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

pub struct Console {
    inner: SleepableLock<ConsoleInner>,
    uart: Uart,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            inner: SleepableLock::new("console", ConsoleInner::new()),
            // SAFETY: the PL011 block belongs to the console.
            uart: unsafe { Uart::new(UART_BASE) },
        }
    }

    pub fn init(&self) {
        self.uart.init();
    }

    fn echo(&self, c: u8) {
        if c == BACKSPACE {
            self.uart.putc(8);
            self.uart.putc(b' ');
            self.uart.putc(8);
        } else {
            self.uart.putc(c);
        }
    }

    /// Raw output used by the kernel printer; bypasses the input side.
    pub fn putc(&self, c: u8) {
        if c == b'\n' {
            self.uart.putc(b'\r');
        }
        self.uart.putc(c);
    }

    /// Blocking read of at most `dst.len()` bytes; returns at end of
    /// line. EINTR if a signal arrives while waiting.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut g = self.inner.lock();
        let mut n = 0;
        while n < dst.len() {
            while g.r == g.w {
                if n > 0 {
                    return Ok(n);
                }
                g.sleep_interruptible()?;
            }
            let c = g.buf[g.r as usize % INPUT_BUF];
            g.r = g.r.wrapping_add(1);
            if c == CTRL_D {
                return Ok(n);
            }
            dst[n] = c;
            n += 1;
            if c == b'\n' {
                break;
            }
        }
        Ok(n)
    }

    /// Console write: plain byte stream to the UART.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        for &c in src {
            self.putc(c);
        }
        Ok(src.len())
    }

    /// Receive-interrupt handler: drain the UART, apply line editing,
    /// wake readers on newline, ^D, or a full buffer.
    pub fn intr(&self) {
        let mut g = self.inner.lock();
        while let Some(c) = self.uart.getc() {
            let c = if c == b'\r' { b'\n' } else { c };
            match c {
                CTRL_U => {
                    while g.e != g.w && g.buf[g.e.wrapping_sub(1) as usize % INPUT_BUF] != b'\n' {
                        g.e = g.e.wrapping_sub(1);
                        self.echo(BACKSPACE);
                    }
                }
                BACKSPACE | 8 => {
                    if g.e != g.w {
                        g.e = g.e.wrapping_sub(1);
                        self.echo(BACKSPACE);
                    }
                }
                _ => {
                    if (g.e.wrapping_sub(g.r) as usize) < INPUT_BUF {
                        self.echo(c);
                        let e = g.e;
                        g.buf[e as usize % INPUT_BUF] = c;
                        g.e = e.wrapping_add(1);
                        if c == b'\n' || c == CTRL_D || g.e.wrapping_sub(g.r) as usize == INPUT_BUF
                        {
                            g.w = g.e;
                            g.wakeup();
                        }
                    }
                }
            }
        }
    }
}
