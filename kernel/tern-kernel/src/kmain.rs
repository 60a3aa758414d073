//! Kernel entry and initial tasks.
//!
//! Boot order: console → multiboot → GDT → page allocator → IDT →
//! PIC/PIT → keyboard → root filesystem → scheduler → initial tasks →
//! scheduler start. The timer interrupt is the sole preemption source.

use alloc::vec;

use tern_core::errno::Errno;
use tern_core::sync::preempt::PreemptGuard;
use tern_core::{kinfo, kprint};
use tern_fs::{FileMode, vfs};

use crate::arch::x86::{context, gdt, interrupts, pic, pit};
use crate::config::{SHELL_PATH, SPLASH_PATH};
use crate::drivers::{keyboard, serial, vga};
use crate::proc::elf;
use crate::{initrd, log, mm, multiboot, sched};

/// Multiboot entry, called by the boot stub.
///
/// # Safety
///
/// Must only be entered once, by the boot stub, with the loader's
/// registers intact.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kmain(multiboot_info: u32, magic: u32) -> ! {
    vga::init();
    serial::init();
    log::init_early_serial();
    kinfo!("early boot, initialized VGA and serial");

    // SAFETY: Forwarded loader contract.
    let ram_amount = unsafe { multiboot::read_boot_info(multiboot_info, magic) };
    kinfo!("{} MiB of RAM above 1 MiB", ram_amount >> 20);

    gdt::init();
    mm::init(ram_amount);
    log::init_logger();

    interrupts::init();
    pic::init();
    pit::init();
    keyboard::init();
    interrupts::enable();

    vfs::init();
    initrd::mount().expect("initrd mount failed");

    sched::init();
    let main = sched::create_task(main_task);
    let second = sched::create_task(second_task);
    sched::link_task(main);
    sched::link_task(second);
    // The tasks keep their creation references for their own lifetime.
    sched::start()
}

/// Prints the splash file and executes the shell in ring 3.
fn main_task() {
    if let Err(e) = show_splash() {
        kinfo!("no splash: {}", e);
    }

    match run_shell() {
        Ok(()) => {}
        Err(e) => panic!("loading {} failed: {}", SHELL_PATH, e),
    }
}

fn show_splash() -> Result<(), Errno> {
    let inode = vfs::traverse(SPLASH_PATH)?;
    let file = inode.open(FileMode::READ)?;
    let mut buf = vec![0u8; 4096];
    let n = file.read(&mut buf)?;
    if let Ok(text) = core::str::from_utf8(&buf[..n]) {
        kprint!("{}", text);
    }
    Ok(())
}

fn run_shell() -> Result<(), Errno> {
    let inode = vfs::traverse(SHELL_PATH)?;
    let file = inode.open(FileMode::READ)?;
    let entry = elf::load_elf(&file)?;

    let user_stack = mm::hmem_alloc_page();
    // Map the stack just below the kernel window.
    let stack_top = 0xC000_0000usize;
    mm::map_user_page(stack_top - 4096, user_stack, true);

    kinfo!("entering ring 3 at {:#x}", entry);
    // SAFETY: Entry and stack are mapped user-accessible in this address
    // space.
    unsafe { context::asm_enter_usermode(entry, stack_top as u32) }
}

/// Keeps the console alive: echoes keyboard input forever.
fn second_task() {
    loop {
        {
            let _no_preempt = PreemptGuard::new();
            while let Some(byte) = keyboard::read_byte() {
                kprint!("{}", byte as char);
            }
        }
        sched::yield_now();
    }
}
