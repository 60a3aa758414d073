//! ELF32 executable loading.
//!
//! Header and program-header parsing is pure and host-tested. The loader
//! maps each `PT_LOAD` segment into the current address space with hmem
//! pages; the pages are owned by a release-on-drop guard until the whole
//! load has succeeded, so a malformed binary leaks nothing.

use tern_core::errno::Errno;

/// Loadable-segment program header type.
pub const PT_LOAD: u32 = 1;
/// Writable-segment flag.
pub const PF_W: u32 = 2;

/// Size of the ELF32 file header.
pub const EHDR_SIZE: usize = 52;
/// Size of one ELF32 program header.
pub const PHDR_SIZE: usize = 32;

/// The fields of the file header the loader consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    /// Entry-point virtual address.
    pub entry: u32,
    /// File offset of the program header table.
    pub phoff: u32,
    /// Size of one program header table entry.
    pub phentsize: u16,
    /// Number of program header table entries.
    pub phnum: u16,
}

/// One program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Segment type (`PT_LOAD` is the only one acted on).
    pub p_type: u32,
    /// File offset of the segment image.
    pub offset: u32,
    /// Target virtual address.
    pub vaddr: u32,
    /// Bytes present in the file.
    pub filesz: u32,
    /// Bytes occupied in memory (the tail beyond `filesz` is zeroed).
    pub memsz: u32,
    /// Segment flags.
    pub flags: u32,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().expect("2 bytes"))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4 bytes"))
}

/// Validates the file header: 32-bit little-endian x86 executable.
pub fn parse_header(bytes: &[u8]) -> Result<ElfHeader, Errno> {
    if bytes.len() < EHDR_SIZE {
        return Err(Errno::Invalid);
    }
    let supported = bytes[0..4] == [0x7F, b'E', b'L', b'F']
        && bytes[4] == 1   // 32-bit
        && bytes[5] == 1   // little endian
        && bytes[6] == 1   // ELF version
        && read_u16(bytes, 16) == 2   // executable, not relocatable
        && read_u16(bytes, 18) == 3; // x86
    if !supported {
        return Err(Errno::Invalid);
    }

    Ok(ElfHeader {
        entry: read_u32(bytes, 24),
        phoff: read_u32(bytes, 28),
        phentsize: read_u16(bytes, 42),
        phnum: read_u16(bytes, 44),
    })
}

/// Parses one program header.
pub fn parse_program_header(bytes: &[u8]) -> Result<ProgramHeader, Errno> {
    if bytes.len() < PHDR_SIZE {
        return Err(Errno::Invalid);
    }
    Ok(ProgramHeader {
        p_type: read_u32(bytes, 0),
        offset: read_u32(bytes, 4),
        vaddr: read_u32(bytes, 8),
        filesz: read_u32(bytes, 16),
        memsz: read_u32(bytes, 20),
        flags: read_u32(bytes, 24),
    })
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod loader {
    use alloc::vec::Vec;

    use tern_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
    use tern_core::errno::Errno;
    use tern_core::kdebug;
    use tern_fs::File;
    use tern_mm::vm::VmArea;

    use super::{EHDR_SIZE, PF_W, PHDR_SIZE, PT_LOAD, parse_header, parse_program_header};
    use crate::{mm, sched};

    /// Owns freshly mapped segment pages until the load commits; on an
    /// early error every page goes back to the hmem pool.
    struct UserPages {
        pages: Vec<PhysAddr>,
        committed: bool,
    }

    impl UserPages {
        fn new() -> Self {
            Self {
                pages: Vec::new(),
                committed: false,
            }
        }

        fn push(&mut self, page: PhysAddr) {
            self.pages.push(page);
        }

        fn commit(mut self) {
            self.committed = true;
        }
    }

    impl Drop for UserPages {
        fn drop(&mut self) {
            if !self.committed {
                for &page in &self.pages {
                    mm::hmem_free_page(page);
                }
            }
        }
    }

    /// Reads exactly `buf.len()` bytes at `pos`, treating EOF as a
    /// malformed binary.
    fn pread_exact(file: &File, buf: &mut [u8], pos: u64) -> Result<(), Errno> {
        let mut done = 0;
        while done < buf.len() {
            let n = file.pread(&mut buf[done..], pos + done as u64)?;
            if n == 0 {
                return Err(Errno::Invalid);
            }
            done += n;
        }
        Ok(())
    }

    /// Loads an executable into the current address space and returns
    /// its entry point.
    pub fn load_elf(file: &File) -> Result<u32, Errno> {
        let mut ehdr_bytes = [0u8; EHDR_SIZE];
        pread_exact(file, &mut ehdr_bytes, 0)?;
        let hdr = parse_header(&ehdr_bytes)?;

        if usize::from(hdr.phentsize) != PHDR_SIZE || hdr.phnum >= 1000 {
            return Err(Errno::Invalid);
        }

        let mut pages = UserPages::new();
        let mut areas: Vec<VmArea> = Vec::new();

        for i in 0..u32::from(hdr.phnum) {
            let mut phdr_bytes = [0u8; PHDR_SIZE];
            pread_exact(
                file,
                &mut phdr_bytes,
                u64::from(hdr.phoff) + u64::from(i) * PHDR_SIZE as u64,
            )?;
            let phdr = parse_program_header(&phdr_bytes)?;
            if phdr.p_type != PT_LOAD {
                continue;
            }
            kdebug!(
                "elf: load {:#x}+{:#x} (file {:#x}) flags {:#x}",
                phdr.vaddr,
                phdr.memsz,
                phdr.offset,
                phdr.flags
            );

            let start = phdr.vaddr & !0xFFF;
            let end = start + phdr.memsz;
            let writable = phdr.flags & PF_W != 0;

            let mut virt = start;
            while virt < end {
                let page = mm::hmem_alloc_page();
                mm::map_user_page(virt as usize, page, writable);
                pages.push(page);

                let idx = virt - start;
                let mut zero_from = 0usize;
                if idx < phdr.filesz {
                    let count = (phdr.filesz - idx).min(PAGE_SIZE) as usize;
                    // SAFETY: The page was just mapped writable for the
                    // kernel at `virt`.
                    let buf =
                        unsafe { core::slice::from_raw_parts_mut(virt as usize as *mut u8, count) };
                    pread_exact(file, buf, u64::from(phdr.offset + idx))?;
                    zero_from = count;
                }
                // SAFETY: Remainder of the same mapped page.
                unsafe {
                    core::ptr::write_bytes(
                        (virt as usize + zero_from) as *mut u8,
                        0,
                        PAGE_SIZE as usize - zero_from,
                    );
                }

                virt += PAGE_SIZE;
            }

            areas.push(VmArea {
                start,
                end: VirtAddr::new(end).align_page_up().as_u32(),
                file_offset: phdr.offset,
            });
        }

        // Everything mapped and copied: the pages now belong to the task.
        pages.commit();
        sched::with_sched(|sched| {
            let current = sched.current().expect("load without a current task");
            for area in areas {
                let _ = sched.task_mut(current).vm.insert(area);
            }
        });

        Ok(hdr.entry)
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
pub use loader::load_elf;

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> [u8; EHDR_SIZE] {
        let mut bytes = [0u8; EHDR_SIZE];
        bytes[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        bytes[4] = 1; // 32-bit
        bytes[5] = 1; // little endian
        bytes[6] = 1; // version
        bytes[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        bytes[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        bytes[24..28].copy_from_slice(&0x0804_8000u32.to_le_bytes()); // entry
        bytes[28..32].copy_from_slice(&52u32.to_le_bytes()); // phoff
        bytes[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        bytes[44..46].copy_from_slice(&2u16.to_le_bytes());
        bytes
    }

    #[test]
    fn accepts_a_valid_header() {
        let hdr = parse_header(&valid_header()).unwrap();
        assert_eq!(hdr.entry, 0x0804_8000);
        assert_eq!(hdr.phoff, 52);
        assert_eq!(hdr.phentsize, 32);
        assert_eq!(hdr.phnum, 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = valid_header();
        bytes[1] = b'F';
        assert_eq!(parse_header(&bytes).unwrap_err(), Errno::Invalid);
    }

    #[test]
    fn rejects_wrong_class_or_machine() {
        let mut b64 = valid_header();
        b64[4] = 2; // 64-bit
        assert_eq!(parse_header(&b64).unwrap_err(), Errno::Invalid);

        let mut arm = valid_header();
        arm[18..20].copy_from_slice(&40u16.to_le_bytes());
        assert_eq!(parse_header(&arm).unwrap_err(), Errno::Invalid);

        let mut rel = valid_header();
        rel[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        assert_eq!(parse_header(&rel).unwrap_err(), Errno::Invalid);
    }

    #[test]
    fn rejects_truncation() {
        assert_eq!(parse_header(&[0x7F]).unwrap_err(), Errno::Invalid);
        assert_eq!(parse_program_header(&[0; 10]).unwrap_err(), Errno::Invalid);
    }

    #[test]
    fn program_header_fields() {
        let mut bytes = [0u8; PHDR_SIZE];
        bytes[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        bytes[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&0x0804_8000u32.to_le_bytes());
        bytes[16..20].copy_from_slice(&0x420u32.to_le_bytes());
        bytes[20..24].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[24..28].copy_from_slice(&(PF_W | 4).to_le_bytes());

        let phdr = parse_program_header(&bytes).unwrap();
        assert_eq!(phdr.p_type, PT_LOAD);
        assert_eq!(phdr.offset, 0x1000);
        assert_eq!(phdr.vaddr, 0x0804_8000);
        assert_eq!(phdr.filesz, 0x420);
        assert_eq!(phdr.memsz, 0x1000);
        assert!(phdr.flags & PF_W != 0);
    }
}
