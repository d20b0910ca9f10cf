//! The EL1 physical timer, driving the scheduler tick.

use cortex_a::registers::{CNTFRQ_EL0, CNTP_CTL_EL0, CNTP_TVAL_EL0};
use tock_registers::interfaces::{Readable, Writeable};

use crate::param::TICKS_PER_SECOND;

fn interval() -> u64 {
    CNTFRQ_EL0.get() / TICKS_PER_SECOND
}

/// Arms the timer on the calling CPU.
///
/// # Safety
///
/// Per-CPU boot path only.
pub unsafe fn timer_init() {
    CNTP_TVAL_EL0.set(interval());
    CNTP_CTL_EL0.write(CNTP_CTL_EL0::ENABLE::SET + CNTP_CTL_EL0::IMASK::CLEAR);
}

/// Rearms the timer for the next tick; called from the tick handler.
pub fn timer_rearm() {
    CNTP_TVAL_EL0.set(interval());
}
