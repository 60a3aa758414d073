//! 8254 programmable interval timer.
//!
//! Channel 0 drives IRQ0 at [`TIMER_HZ`](crate::config::TIMER_HZ); its
//! tick is the kernel's only preemption source.

use super::port::outb;
use crate::config::{PIT_BASE_HZ, TIMER_HZ};

const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, square-wave mode.
const MODE: u8 = 0x36;

/// Programs channel 0 for the configured tick rate.
#[allow(clippy::cast_possible_truncation)]
pub fn init() {
    let divisor = PIT_BASE_HZ / TIMER_HZ;
    outb(COMMAND, MODE);
    outb(CHANNEL0, (divisor & 0xFF) as u8);
    outb(CHANNEL0, (divisor >> 8) as u8);
}
