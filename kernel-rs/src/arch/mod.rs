//! Architecture backends.
//!
//! The kernel proper is arch-independent; everything the hardware dictates
//! (interrupt masking, the context switch, trap frames, event hints) lives
//! behind this module. The `arm` backend is the real one; every other build
//! target gets the `host` stub, which is enough to compile the kernel and
//! run its unit tests.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub mod arm;
        pub use arm as target;
    } else {
        pub mod host;
        pub use host as target;
    }
}

pub use target::{
    cpu_id, enter_user, fp, intr_get, intr_off, intr_on, send_event, spin_hint, swtch,
    switch_user_table, timer_rearm, wait_for_event, Context, TrapFrame,
};

/// Bytes per page.
pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

/// One past the highest valid user virtual address.
pub const USER_MAX: usize = 0x4000_0000;

/// Top of the initial user stack.
pub const USER_STACK_TOP: usize = USER_MAX;

pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pg_round_down(0x1fff), 0x1000);
        assert_eq!(pg_round_up(0x1001), 0x2000);
        assert_eq!(pg_round_up(0x1000), 0x1000);
        assert_eq!(pg_round_down(0), 0);
    }
}
