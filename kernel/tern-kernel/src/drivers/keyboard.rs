//! PS/2 keyboard driver.
//!
//! IRQ1 handler translating set-1 make codes to ASCII into a fixed ring
//! buffer. Break codes and codes outside the translation table are
//! dropped.

use planck_noalloc::ringbuf::RingBuf;

use tern_core::sync::IntLock;
use tern_sched::InterruptFrame;

use crate::arch::x86::interrupts;
use crate::arch::x86::pic;
use crate::arch::x86::port::inb;
use crate::config::IRQ_BASE_VECTOR;

const DATA_PORT: u16 = 0x60;

/// Set-1 make code to ASCII, unshifted.
#[rustfmt::skip]
static SCANCODE_MAP: [u8; 58] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0',
    b'-', b'=', 8, b'\t', b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i',
    b'o', b'p', b'[', b']', b'\n', 0, b'a', b's', b'd', b'f', b'g', b'h',
    b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

static INPUT: IntLock<RingBuf<u8, 64>> = IntLock::new(RingBuf::new());

fn irq_handler(_frame: &mut InterruptFrame) {
    let scancode = inb(DATA_PORT);
    pic::end_of_interrupt(1);

    // Break codes have the high bit set.
    if scancode & 0x80 == 0 {
        if let Some(&byte) = SCANCODE_MAP.get(scancode as usize) {
            if byte != 0 {
                // Full buffer drops the oldest unread input.
                let mut input = INPUT.lock();
                if input.try_push(byte).is_err() {
                    let _ = input.pop();
                    let _ = input.try_push(byte);
                }
            }
        }
    }
}

/// Registers the IRQ1 handler.
pub fn init() {
    interrupts::register_handler(IRQ_BASE_VECTOR as usize + 1, irq_handler);
}

/// Pops one translated byte, if any has been typed.
#[must_use]
pub fn read_byte() -> Option<u8> {
    INPUT.lock().pop()
}
