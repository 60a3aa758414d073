//! Kernel log sinks.
//!
//! Two phases. Early boot registers lock-free functions that write
//! straight to COM1, so logging works before the allocator is up. Once
//! the heap exists, [`init_logger`] installs the full logger: a list of
//! [`LogSink`]s (serial and VGA) that every message is duplicated to,
//! with per-sink level filtering.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use tern_core::log::{self, LogLevel};
use tern_core::sync::SpinLock;

use crate::drivers::{serial, vga};

/// An output sink for the kernel logger.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment to this sink.
    fn write_str(&self, s: &str);
    /// Most verbose level this sink accepts.
    fn max_level(&self) -> LogLevel;
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

/// Sink writing to COM1.
pub struct SerialSink {
    max_level: LogLevel,
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        serial::write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

/// Sink writing to the VGA text console.
pub struct VgaSink {
    max_level: LogLevel,
}

impl LogSink for VgaSink {
    fn write_str(&self, s: &str) {
        vga::write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "vga"
    }
}

struct Logger {
    sinks: Vec<Box<dyn LogSink>>,
}

static LOGGER: SpinLock<Option<Logger>> = SpinLock::new(None);

struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

fn full_print(args: fmt::Arguments<'_>) {
    // An interrupt arriving while the logger is held must not spin on it;
    // fall back to the raw serial path instead.
    let Some(logger) = LOGGER.try_lock() else {
        early_print(args);
        return;
    };
    if let Some(logger) = logger.as_ref() {
        for sink in &logger.sinks {
            let _ = SinkWriter(sink.as_ref()).write_fmt(args);
        }
    }
}

fn full_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let Some(logger) = LOGGER.try_lock() else {
        early_log(level, args);
        return;
    };
    if let Some(logger) = logger.as_ref() {
        for sink in &logger.sinks {
            if level <= sink.max_level() {
                let mut w = SinkWriter(sink.as_ref());
                let _ = write!(w, "[{}] ", level.name());
                let _ = w.write_fmt(args);
                let _ = w.write_str("\n");
            }
        }
    }
}

struct EarlySerial;

impl fmt::Write for EarlySerial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        serial::write_str(s);
        Ok(())
    }
}

fn early_print(args: fmt::Arguments<'_>) {
    let _ = EarlySerial.write_fmt(args);
}

fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut w = EarlySerial;
    let _ = write!(w, "[{}] ", level.name());
    let _ = w.write_fmt(args);
    let _ = w.write_str("\n");
}

/// Registers the lock-free early serial path. Usable before the heap.
pub fn init_early_serial() {
    serial::init();
    // SAFETY: The early functions touch only port I/O.
    unsafe {
        log::set_print_fn(early_print);
        log::set_log_fn(early_log);
    }
}

/// Installs the full logger: serial gets everything, VGA gets info and
/// up. Requires the heap.
pub fn init_logger() {
    let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();
    sinks.push(Box::new(SerialSink {
        max_level: LogLevel::Debug,
    }));
    sinks.push(Box::new(VgaSink {
        max_level: LogLevel::Info,
    }));

    *LOGGER.lock() = Some(Logger { sinks });
    // SAFETY: The full logger functions only take the LOGGER spin lock.
    unsafe {
        log::set_print_fn(full_print);
        log::set_log_fn(full_log);
    }
}
