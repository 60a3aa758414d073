//! Open file descriptions.
//!
//! A [`File`] holds a counted reference to its inode, a mode bitmask, a
//! position cursor, and the read/write methods its filesystem installed
//! at open. `read`/`write` advance the cursor by the transferred byte
//! count; `pread`/`pwrite` leave it untouched.

use alloc::sync::Arc;

use bitflags::bitflags;

use tern_core::errno::Errno;
use tern_core::sync::SpinLock;

use crate::inode::Inode;

bitflags! {
    /// Access mode of an open file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u16 {
        /// Open for reading.
        const READ  = 0b01;
        /// Open for writing.
        const WRITE = 0b10;
    }
}

/// File methods installed by the filesystem at open.
pub trait FileOps: Send + Sync {
    /// Reads at `pos` without touching the cursor.
    fn read(&self, file: &File, buf: &mut [u8], pos: u64) -> Result<usize, Errno>;

    /// Writes at `pos` without touching the cursor.
    fn write(&self, file: &File, buf: &[u8], pos: u64) -> Result<usize, Errno>;
}

/// The standard file methods: delegate to the owning filesystem.
pub struct RegularOps;

/// Shared instance of [`RegularOps`].
pub static REGULAR_OPS: RegularOps = RegularOps;

impl FileOps for RegularOps {
    fn read(&self, file: &File, buf: &mut [u8], pos: u64) -> Result<usize, Errno> {
        let inode = file.inode();
        inode.fs().read_at(inode, buf, pos)
    }

    fn write(&self, file: &File, buf: &[u8], pos: u64) -> Result<usize, Errno> {
        let inode = file.inode();
        inode.fs().write_at(inode, buf, pos)
    }
}

/// An open file description.
pub struct File {
    inode: Arc<Inode>,
    mode: FileMode,
    pos: SpinLock<u64>,
    ops: &'static dyn FileOps,
}

impl Inode {
    /// Opens this inode, producing a counted file description with the
    /// filesystem's file methods installed.
    pub fn open(self: &Arc<Self>, mode: FileMode) -> Result<Arc<File>, Errno> {
        let ops = self.fs().file_ops(self);
        Ok(Arc::new(File {
            inode: self.clone(),
            mode,
            pos: SpinLock::new(0),
            ops,
        }))
    }
}

impl File {
    /// The inode this description refers to.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The access mode.
    #[must_use]
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// The current cursor position.
    #[must_use]
    pub fn pos(&self) -> u64 {
        *self.pos.lock()
    }

    /// Reads at the cursor, advancing it by the transferred count.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut pos = self.pos.lock();
        let n = self.ops.read(self, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Writes at the cursor, advancing it by the transferred count.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        let mut pos = self.pos.lock();
        let n = self.ops.write(self, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Reads at an explicit position; the cursor is not moved.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize, Errno> {
        self.ops.read(self, buf, pos)
    }

    /// Writes at an explicit position; the cursor is not moved.
    pub fn pwrite(&self, buf: &[u8], pos: u64) -> Result<usize, Errno> {
        self.ops.write(self, buf, pos)
    }
}
