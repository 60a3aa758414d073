//! Boot-time constants.

/// Timer interrupt rate programmed into the PIT.
pub const TIMER_HZ: u32 = 1000;

/// The PIT input clock, fixed by the hardware.
pub const PIT_BASE_HZ: u32 = 1_193_182;

/// Vector the PIC master is remapped to (IRQ0 lands here).
pub const IRQ_BASE_VECTOR: u8 = 0x20;

/// The ring-3-callable software interrupt vector.
pub const SYSCALL_VECTOR: usize = 0x80;

/// Where the initrd archive is mounted.
pub const INITRD_MOUNT: &str = "/initrd";

/// Path of the splash text printed at boot.
pub const SPLASH_PATH: &str = "/initrd/splash.txt";

/// Path of the user binary the main task executes.
pub const SHELL_PATH: &str = "/initrd/shell.elf";
