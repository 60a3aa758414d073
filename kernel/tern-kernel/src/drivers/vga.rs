//! 80×25 VGA text-mode console.
//!
//! The hardware text buffer sits at physical `0xB8000`, reached through
//! the kernel window. One `u16` per cell: character low, attribute high.

use core::fmt;

use tern_core::sync::SpinLock;

const BUFFER: usize = 0xC00B_8000;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;

/// The 16 VGA colors.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// A foreground/background attribute pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorPair {
    /// Foreground color.
    pub fg: Color,
    /// Background color.
    pub bg: Color,
}

impl ColorPair {
    /// The default console colors.
    pub const NORMAL: Self = Self {
        fg: Color::LightGray,
        bg: Color::Black,
    };

    const fn attribute(self) -> u8 {
        self.fg as u8 | (self.bg as u8) << 4
    }
}

struct Console {
    row: usize,
    col: usize,
}

static CONSOLE: SpinLock<Console> = SpinLock::new(Console { row: 0, col: 0 });

fn cell_write(row: usize, col: usize, byte: u8, attr: u8) {
    let cell = u16::from(byte) | u16::from(attr) << 8;
    let ptr = (BUFFER + (row * WIDTH + col) * 2) as *mut u16;
    // SAFETY: row/col are bounded by the callers; the buffer is mapped
    // for the kernel's lifetime.
    unsafe { ptr.write_volatile(cell) };
}

fn cell_read(row: usize, col: usize) -> u16 {
    let ptr = (BUFFER + (row * WIDTH + col) * 2) as *const u16;
    // SAFETY: See `cell_write`.
    unsafe { ptr.read_volatile() }
}

impl Console {
    fn put(&mut self, byte: u8, colors: ColorPair) {
        match byte {
            b'\n' => self.newline(),
            byte => {
                cell_write(self.row, self.col, byte, colors.attribute());
                self.col += 1;
                if self.col == WIDTH {
                    self.newline();
                }
            }
        }
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < HEIGHT {
            self.row += 1;
        } else {
            self.scroll();
        }
    }

    fn scroll(&mut self) {
        for row in 1..HEIGHT {
            for col in 0..WIDTH {
                let cell = cell_read(row, col);
                let ptr = (BUFFER + ((row - 1) * WIDTH + col) * 2) as *mut u16;
                // SAFETY: In-bounds cell of the mapped buffer.
                unsafe { ptr.write_volatile(cell) };
            }
        }
        for col in 0..WIDTH {
            cell_write(HEIGHT - 1, col, b' ', ColorPair::NORMAL.attribute());
        }
    }

    fn clear(&mut self) {
        for row in 0..HEIGHT {
            for col in 0..WIDTH {
                cell_write(row, col, b' ', ColorPair::NORMAL.attribute());
            }
        }
        self.row = 0;
        self.col = 0;
    }
}

/// Clears the screen and homes the cursor.
pub fn init() {
    CONSOLE.lock().clear();
}

/// Writes a string in the default colors.
pub fn write_str(s: &str) {
    write_str_colored(s, ColorPair::NORMAL);
}

/// Writes a string in the given colors.
pub fn write_str_colored(s: &str, colors: ColorPair) {
    let mut console = CONSOLE.lock();
    for byte in s.bytes() {
        console.put(byte, colors);
    }
}

/// `fmt::Write` adapter over the console, used by the panic path.
pub struct Writer(pub ColorPair);

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_str_colored(s, self.0);
        Ok(())
    }
}
