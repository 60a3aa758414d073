//! In-memory inodes and the filesystem vtable.
//!
//! An [`Inode`] is the refcounted in-memory representation of a
//! filesystem object. Every outgoing edge in the inode graph is a counted
//! reference (`Arc`): the parent back-reference pins ancestors while a
//! descendant is live, and file descriptors pin their inode. The owning
//! filesystem's inode cache holds only weak references, so dropping the
//! last counted reference evicts the inode.

use alloc::sync::{Arc, Weak};

use tern_core::errno::Errno;
use tern_core::sync::IntLock;

use crate::cache::InodeCache;
use crate::file::FileOps;

/// An inode number within one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InodeNum(pub u32);

impl InodeNum {
    /// The root inode number.
    pub const ROOT: Self = Self(2);
}

/// On-disk metadata read synchronously when an inode is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMeta {
    /// Type and permission bits (see [`mode`](crate::mode)).
    pub mode: u16,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Hard-link count.
    pub nlink: u32,
    /// Object size in bytes.
    pub size: u64,
    /// Device identifier.
    pub dev: u32,
}

/// Operations a filesystem provides on its inodes.
///
/// The defaults describe a read-only filesystem; writable backends
/// override `create`, `unlink` and `write_at`.
pub trait Filesystem: Send + Sync {
    /// Resolves `name` within the directory `dir` to an inode number.
    fn lookup(&self, dir: &Inode, name: &str) -> Result<InodeNum, Errno>;

    /// Creates `name` in `dir` with the given mode.
    fn create(&self, _dir: &Inode, _name: &str, _mode: u16) -> Result<InodeNum, Errno> {
        Err(Errno::NotPermitted)
    }

    /// Removes `name` from `dir`.
    fn unlink(&self, _dir: &Inode, _name: &str) -> Result<(), Errno> {
        Err(Errno::NotPermitted)
    }

    /// Reads the on-disk representation of an inode.
    fn read_inode(&self, num: InodeNum) -> Result<InodeMeta, Errno>;

    /// Reads file content at `pos`; returns the number of bytes copied.
    fn read_at(&self, inode: &Inode, buf: &mut [u8], pos: u64) -> Result<usize, Errno>;

    /// Writes file content at `pos`.
    fn write_at(&self, _inode: &Inode, _buf: &[u8], _pos: u64) -> Result<usize, Errno> {
        Err(Errno::NotPermitted)
    }

    /// Selects the file methods installed on a descriptor at open.
    fn file_ops(&self, _inode: &Inode) -> &'static dyn FileOps {
        &crate::file::REGULAR_OPS
    }

    /// The filesystem's inode cache.
    fn cache(&self) -> &IntLock<InodeCache>;

    /// The root inode number.
    fn root_inode(&self) -> InodeNum {
        InodeNum::ROOT
    }
}

/// The in-memory representation of a filesystem object.
pub struct Inode {
    fs: Arc<dyn Filesystem>,
    /// Counted back-reference keeping the ancestor chain alive.
    parent: Option<Arc<Inode>>,
    num: InodeNum,
    /// Metadata snapshot; immutable while the backend is read-only.
    pub meta: InodeMeta,
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("parent", &self.parent)
            .field("num", &self.num)
            .field("meta", &self.meta)
            .finish()
    }
}

impl Inode {
    /// The owning filesystem.
    #[must_use]
    pub fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    /// The inode number.
    #[must_use]
    pub fn num(&self) -> InodeNum {
        self.num
    }

    /// The parent inode, when this is not a filesystem root.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Inode>> {
        self.parent.as_ref()
    }

    /// Resolves `name` within this directory.
    pub fn lookup(&self, name: &str) -> Result<InodeNum, Errno> {
        self.fs.lookup(self, name)
    }

    /// Creates `name` in this directory.
    pub fn create(&self, name: &str, mode: u16) -> Result<InodeNum, Errno> {
        self.fs.create(self, name, mode)
    }

    /// Removes `name` from this directory.
    pub fn unlink(&self, name: &str) -> Result<(), Errno> {
        self.fs.unlink(self, name)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        // Evict our cache entry, but only if it still refers to this
        // object: a new inode may already have been instantiated for the
        // same number between our refcount hitting zero and this drop.
        let mut cache = self.fs.cache().lock();
        let ours = cache
            .get(self.num)
            .is_some_and(|weak| core::ptr::eq(weak.as_ptr(), self));
        if ours {
            cache.remove(self.num);
        }
    }
}

/// Returns the unique in-memory inode for `(fs, num)`, instantiating it
/// (with a synchronous metadata read) on a cache miss.
///
/// The returned reference is counted; `parent` is consumed as the new
/// inode's back-reference on a miss and dropped on a hit.
pub fn get_inode(
    fs: &Arc<dyn Filesystem>,
    num: InodeNum,
    parent: Option<Arc<Inode>>,
) -> Result<Arc<Inode>, Errno> {
    {
        let mut cache = fs.cache().lock();
        match cache.get(num).map(Weak::upgrade) {
            Some(Some(inode)) => return Ok(inode),
            Some(None) => {
                // Dead entry whose Drop has not run yet.
                cache.remove(num);
            }
            None => {}
        }
    }

    // Read outside the cache lock; the dropped `parent` on the error path
    // must be free to take it.
    let meta = fs.read_inode(num)?;
    let inode = Arc::new(Inode {
        fs: fs.clone(),
        parent,
        num,
        meta,
    });

    let mut cache = fs.cache().lock();
    match cache.get(num).map(Weak::upgrade) {
        Some(Some(existing)) => {
            // Lost an instantiation race; release the lock before our
            // duplicate drops (its Drop takes the cache lock).
            drop(cache);
            return Ok(existing);
        }
        Some(None) => {
            cache.remove(num);
        }
        None => {}
    }
    cache.insert(num, Arc::downgrade(&inode));
    drop(cache);
    Ok(inode)
}
