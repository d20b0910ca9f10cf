//! ARM Generic Interrupt Controller v2.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::{
    register_structs,
    registers::{ReadOnly, ReadWrite, WriteOnly},
};

const GIC_INTERRUPT_NUM: usize = 1024;
const GIC_1_BIT_NUM: usize = GIC_INTERRUPT_NUM / 32;
const GIC_8_BIT_NUM: usize = GIC_INTERRUPT_NUM * 8 / 32;
const GIC_2_BIT_NUM: usize = GIC_INTERRUPT_NUM * 2 / 32;

const GICD_BASE: usize = 0x0800_0000;
const GICC_BASE: usize = 0x0801_0000;

/// IRQ numbers routed by the kernel.
pub const TIMER_IRQ: u32 = 27;
pub const UART_IRQ: u32 = 33;

register_structs! {
    #[allow(non_snake_case)]
    GicDistributorBlock {
        (0x0000 => CTLR: ReadWrite<u32>),
        (0x0004 => TYPER: ReadOnly<u32>),
        (0x0008 => IIDR: ReadOnly<u32>),
        (0x000c => _reserved_0),
        (0x0080 => IGROUPR: [ReadWrite<u32>; GIC_1_BIT_NUM]),
        (0x0100 => ISENABLER: [ReadWrite<u32>; GIC_1_BIT_NUM]),
        (0x0180 => ICENABLER: [ReadWrite<u32>; GIC_1_BIT_NUM]),
        (0x0200 => ISPENDR: [ReadWrite<u32>; GIC_1_BIT_NUM]),
        (0x0280 => ICPENDR: [ReadWrite<u32>; GIC_1_BIT_NUM]),
        (0x0300 => ISACTIVER: [ReadWrite<u32>; GIC_1_BIT_NUM]),
        (0x0380 => ICACTIVER: [ReadWrite<u32>; GIC_1_BIT_NUM]),
        (0x0400 => IPRIORITYR: [ReadWrite<u32>; GIC_8_BIT_NUM]),
        (0x0800 => ITARGETSR: [ReadWrite<u32>; GIC_8_BIT_NUM]),
        (0x0c00 => ICFGR: [ReadWrite<u32>; GIC_2_BIT_NUM]),
        (0x0d00 => _reserved_1),
        (0x0f00 => SGIR: WriteOnly<u32>),
        (0x0f04 => _reserved_2),
        (0x1000 => @END),
    }
}

register_structs! {
    #[allow(non_snake_case)]
    GicCpuInterfaceBlock {
        (0x0000 => CTLR: ReadWrite<u32>),
        (0x0004 => PMR: ReadWrite<u32>),
        (0x0008 => BPR: ReadWrite<u32>),
        (0x000c => IAR: ReadOnly<u32>),
        (0x0010 => EOIR: WriteOnly<u32>),
        (0x0014 => _reserved_0),
        (0x1000 => @END),
    }
}

struct GicDistributor {
    base_addr: usize,
}

struct GicCpuInterface {
    base_addr: usize,
}

impl core::ops::Deref for GicDistributor {
    type Target = GicDistributorBlock;

    fn deref(&self) -> &Self::Target {
        // SAFETY: GICD_BASE is the distributor's MMIO block.
        unsafe { &*(self.base_addr as *const _) }
    }
}

impl core::ops::Deref for GicCpuInterface {
    type Target = GicCpuInterfaceBlock;

    fn deref(&self) -> &Self::Target {
        // SAFETY: GICC_BASE is the cpu interface's MMIO block.
        unsafe { &*(self.base_addr as *const _) }
    }
}

static GICD: GicDistributor = GicDistributor { base_addr: GICD_BASE };
static GICC: GicCpuInterface = GicCpuInterface { base_addr: GICC_BASE };

/// One-time distributor setup, done by the bootstrap CPU.
pub unsafe fn init() {
    GICD.CTLR.set(0);
    for i in 0..GIC_1_BIT_NUM {
        GICD.ICENABLER[i].set(u32::MAX);
        GICD.ICPENDR[i].set(u32::MAX);
    }
    GICD.CTLR.set(1);
}

/// Per-CPU interface setup.
pub unsafe fn init_cpu() {
    GICC.PMR.set(u32::MAX);
    GICC.CTLR.set(1);
}

/// Route an IRQ to the calling CPU and enable it.
pub unsafe fn enable(irq: u32) {
    let reg = (irq / 32) as usize;
    let bit = 1 << (irq % 32);
    GICD.ISENABLER[reg].set(bit);
    let treg = (irq / 4) as usize;
    let shift = (irq % 4) * 8;
    let old = GICD.ITARGETSR[treg].get();
    GICD.ITARGETSR[treg].set(old | (1 << (super::cpu_id() as u32 + shift)));
}

/// Acknowledge the highest pending interrupt. `None` if spurious.
pub fn claim() -> Option<u32> {
    let iar = GICC.IAR.get();
    let irq = iar & 0x3ff;
    if irq >= 1020 {
        return None;
    }
    Some(irq)
}

/// Signal end-of-interrupt for a claimed IRQ.
pub fn complete(irq: u32) {
    GICC.EOIR.set(irq);
}

/// Raise a software-generated interrupt on every other CPU; the scheduler
/// uses this to kick idle CPUs when a thread becomes runnable.
pub fn kick_others() {
    // Target list filter 0b01: all CPUs except the sender; SGI 0.
    GICD.SGIR.set(1 << 24);
}
