//! Panic handler: colored banner plus an EBP-chain stack trace.
//!
//! The walker stays within the current 8 KiB-aligned kernel stack so a
//! corrupted frame chain cannot take the panic path down with it.

use core::fmt::Write as _;
use core::panic::PanicInfo;

use tern_sched::stack::STACK_SIZE;

use crate::drivers::serial;
use crate::drivers::vga::{Color, ColorPair, Writer};

/// Upper bound on printed frames.
const MAX_FRAMES: usize = 32;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // SAFETY: cli is always safe in ring 0.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };

    let mut banner = Writer(ColorPair {
        fg: Color::White,
        bg: Color::Red,
    });
    let _ = write!(banner, "\nKERNEL PANIC: ");

    let mut body = Writer(ColorPair {
        fg: Color::White,
        bg: Color::Black,
    });
    let _ = write!(body, "{}", info.message());
    if let Some(location) = info.location() {
        let _ = write!(body, " in file {location}");
    }

    let mut serial = SerialWriter;
    let _ = write!(serial, "\nKERNEL PANIC: {}", info.message());
    if let Some(location) = info.location() {
        let _ = write!(serial, " in file {location}");
    }
    let _ = serial.write_str("\n");

    stack_trace();

    loop {
        // SAFETY: hlt with interrupts masked parks the CPU.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

struct SerialWriter;

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        serial::write_str(s);
        Ok(())
    }
}

/// Walks the saved-EBP chain, printing return addresses to serial.
fn stack_trace() {
    let mut ebp: usize;
    // SAFETY: Reading EBP has no side effects.
    unsafe { core::arch::asm!("mov {}, ebp", out(reg) ebp, options(nomem, nostack)) };

    let stack_min = ebp & !(STACK_SIZE - 1);
    let stack_max = stack_min + STACK_SIZE;

    let mut serial = SerialWriter;
    for _ in 0..MAX_FRAMES {
        if ebp < stack_min || ebp + 8 > stack_max {
            break;
        }
        // SAFETY: The bounds check keeps both reads inside the current
        // kernel stack.
        let (saved_ebp, eip) = unsafe {
            (
                (ebp as *const usize).read(),
                ((ebp + 4) as *const u32).read(),
            )
        };
        let _ = writeln!(serial, "TRACE {eip:#010x}");

        // The chain must move strictly upward to terminate.
        if saved_ebp <= ebp {
            break;
        }
        ebp = saved_ebp;
    }
}
