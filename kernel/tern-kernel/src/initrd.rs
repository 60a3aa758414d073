//! The initrd: a ustar archive linked into the kernel image.

use tern_fs::tar::TarFs;
use tern_fs::vfs;

use tern_core::errno::Errno;
use tern_core::kinfo;

use crate::config::INITRD_MOUNT;

unsafe extern "C" {
    static __initrd_start: u8;
    static __initrd_end: u8;
}

/// The embedded archive bytes.
#[must_use]
pub fn archive() -> &'static [u8] {
    // SAFETY: The linker script delimits the embedded archive; the
    // symbols live for the kernel's lifetime.
    unsafe {
        let start = &raw const __initrd_start;
        let end = &raw const __initrd_end;
        core::slice::from_raw_parts(start, end.offset_from(start) as usize)
    }
}

/// Mounts the embedded archive at [`INITRD_MOUNT`].
pub fn mount() -> Result<(), Errno> {
    let archive = archive();
    kinfo!("initrd: {} bytes embedded", archive.len());
    vfs::mount(INITRD_MOUNT, TarFs::new(archive))
}
