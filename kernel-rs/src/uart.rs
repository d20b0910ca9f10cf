//! PrimeCell UART (PL011) driver.
//!
//! See the PL011 Technical Reference Manual. Transmit is polled; receive
//! is interrupt driven through the console.

use core::ptr;

// Register offsets, in bytes from the MMIO base.
const UARTDR: usize = 0x000; // Data Register
const UARTECR: usize = 0x004; // Error Clear Register
const UARTFR: usize = 0x018; // Flag Register
const UARTFR_RXFE: u32 = 1 << 4; // Receive FIFO empty
const UARTFR_TXFF: u32 = 1 << 5; // Transmit FIFO full
const UARTIBRD: usize = 0x024; // Integer Baud Rate Register
const UARTFBRD: usize = 0x028; // Fractional Baud Rate Register
const UARTLCR: usize = 0x02c; // Line Control Register
const UARTLCR_FEN: u32 = 1 << 4; // Enable FIFOs
const UARTLCR_WLEN8: u32 = 3 << 5; // Word length = 8 bits
const UARTCR: usize = 0x030; // Control Register
const UARTCR_UARTEN: u32 = 1 << 0; // UART enable
const UARTCR_TXE: u32 = 1 << 8; // Transmit enable
const UARTCR_RXE: u32 = 1 << 9; // Receive enable
const UARTIMSC: usize = 0x038; // Interrupt Mask Set/Clear Register
const UARTIMSC_RXIM: u32 = 1 << 4; // Receive interrupt mask
const UARTICR: usize = 0x044; // Interrupt Clear Register

/// The PL011 on qemu's virt board.
pub const UART_BASE: usize = 0x0900_0000;

const UART_CLOCK: u32 = 24_000_000;
const BAUD_RATE: u32 = 115_200;

pub struct Uart {
    base: usize,
}

impl Uart {
    /// # Safety
    ///
    /// `base` must be the PL011's MMIO block, owned by this driver.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn read(&self, reg: usize) -> u32 {
        // SAFETY: in the device's register block; volatile MMIO access.
        unsafe { ptr::read_volatile((self.base + reg) as *const u32) }
    }

    fn write(&self, reg: usize, v: u32) {
        // SAFETY: in the device's register block; volatile MMIO access.
        unsafe { ptr::write_volatile((self.base + reg) as *mut u32, v) }
    }

    pub fn init(&self) {
        // Disable while configuring.
        self.write(UARTCR, self.read(UARTCR) & !UARTCR_UARTEN);

        // Baud rate divisors.
        self.write(UARTIBRD, (UART_CLOCK / (16 * BAUD_RATE)) & 0xffff);
        self.write(UARTFBRD, ((UART_CLOCK * 4 / BAUD_RATE) >> 6) & 0x3f);

        // FIFOs on, 8 data bits, one stop bit, no parity.
        self.write(UARTLCR, UARTLCR_FEN | UARTLCR_WLEN8);

        // Clear pending errors and stale interrupts.
        self.write(UARTECR, 0);
        self.write(UARTICR, 0x7ff);

        // Enable UART, transmit and receive.
        self.write(UARTCR, UARTCR_UARTEN | UARTCR_TXE | UARTCR_RXE);

        // Unmask the receive interrupt.
        self.write(UARTIMSC, self.read(UARTIMSC) | UARTIMSC_RXIM);
    }

    /// Transmits one character, polling until the FIFO drains.
    pub fn putc(&self, c: u8) {
        while self.read(UARTFR) & UARTFR_TXFF != 0 {}
        self.write(UARTDR, c as u32);
    }

    /// One received character, or `None` if the FIFO is empty.
    pub fn getc(&self) -> Option<u8> {
        if self.read(UARTFR) & UARTFR_RXFE != 0 {
            return None;
        }
        Some((self.read(UARTDR) & 0xff) as u8)
    }
}
