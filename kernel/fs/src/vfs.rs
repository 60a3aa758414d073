//! Mount table and path traversal.
//!
//! Mount points carry a canonical path (no trailing slash except for the
//! root mount `/`) and pin their filesystem's root inode. Traversal finds
//! the longest mount whose path is a whole-segment prefix of the input,
//! then walks the remaining components with preemption disabled, taking a
//! counted reference at every step.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use tern_core::errno::Errno;
use tern_core::kinfo;
use tern_core::sync::SpinLock;
use tern_core::sync::preempt::PreemptGuard;

use crate::PATH_NAME_MAX;
use crate::inode::{Filesystem, Inode, get_inode};

/// One mounted filesystem.
struct MountPoint {
    /// Canonical path: `/`, or absolute with no trailing slash.
    path: String,
    fs: Arc<dyn Filesystem>,
    /// The pinned root inode; never evicted while mounted.
    root: Arc<Inode>,
}

/// The mount table.
pub struct Vfs {
    mounts: Vec<MountPoint>,
}

impl Vfs {
    /// Creates an empty mount table.
    #[must_use]
    pub const fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Mounts `fs` at the canonical `path`, instantiating and pinning its
    /// root inode.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not canonical.
    pub fn mount(&mut self, path: &str, fs: Arc<dyn Filesystem>) -> Result<(), Errno> {
        assert!(path.starts_with('/'), "mount path must be absolute");
        assert!(
            path.len() == 1 || !path.ends_with('/'),
            "mount path must not end in a slash"
        );
        if path.len() + 1 > PATH_NAME_MAX {
            return Err(Errno::PathTooLong);
        }

        let root = get_inode(&fs, fs.root_inode(), None)?;
        self.mounts.push(MountPoint {
            path: path.to_string(),
            fs,
            root,
        });
        Ok(())
    }

    /// Finds the longest mount whose path is a whole-segment prefix of
    /// `path`: the root mount matches everything, otherwise the mount
    /// path must be the whole input or be followed by a `/` in it.
    fn find_mount(&self, path: &str) -> Option<&MountPoint> {
        let mut best: Option<&MountPoint> = None;
        for mnt in &self.mounts {
            let matches = mnt.path.len() == 1
                || mnt.path == path
                || path.starts_with(mnt.path.as_str())
                    && path.as_bytes().get(mnt.path.len()) == Some(&b'/');
            if matches && best.is_none_or(|b| mnt.path.len() > b.path.len()) {
                best = Some(mnt);
            }
        }
        best
    }

    /// Resolves `path` to an inode; the caller owns one counted
    /// reference to the result.
    ///
    /// Runs with preemption disabled throughout: every step is a fast
    /// in-memory operation.
    pub fn traverse(&self, path: &str) -> Result<Arc<Inode>, Errno> {
        let _no_preempt = PreemptGuard::new();

        if path.is_empty() {
            return Err(Errno::NoEntry);
        }
        if path.len() + 1 > PATH_NAME_MAX {
            return Err(Errno::PathTooLong);
        }

        let mnt = self.find_mount(path).ok_or(Errno::NoEntry)?;
        let mut curr = mnt.root.clone();

        let remainder = &path[mnt.path.len().min(path.len())..];
        for segment in remainder.split('/').filter(|s| !s.is_empty()) {
            // On error the references acquired so far unwind with `curr`;
            // the mount keeps the root pinned.
            let num = curr.lookup(segment)?;
            let fs = curr.fs().clone();
            curr = get_inode(&fs, num, Some(curr))?;
        }

        Ok(curr)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global VFS
// ---------------------------------------------------------------------------

/// Global VFS instance.
static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Initializes the global VFS.
///
/// # Panics
///
/// Panics if already initialized.
pub fn init() {
    let mut vfs = VFS.lock();
    assert!(vfs.is_none(), "VFS already initialized");
    *vfs = Some(Vfs::new());
}

/// Executes a closure with a shared reference to the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs<R>(f: impl FnOnce(&Vfs) -> R) -> R {
    let vfs = VFS.lock();
    f(vfs.as_ref().expect("VFS not initialized"))
}

/// Executes a closure with a mutable reference to the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs_mut<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut vfs = VFS.lock();
    f(vfs.as_mut().expect("VFS not initialized"))
}

/// Mounts `fs` on the global VFS.
pub fn mount(path: &str, fs: Arc<dyn Filesystem>) -> Result<(), Errno> {
    with_vfs_mut(|vfs| vfs.mount(path, fs))?;
    kinfo!("vfs: mounted {}", path);
    Ok(())
}

/// Resolves a path on the global VFS.
pub fn traverse(path: &str) -> Result<Arc<Inode>, Errno> {
    with_vfs(|vfs| vfs.traverse(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InodeCache;
    use crate::inode::{InodeMeta, InodeNum};
    use crate::mode::{S_IFDIR, S_IFREG};
    use tern_core::sync::IntLock;

    /// A tiny synthetic filesystem: root (2) contains `a` (3), which
    /// contains `b` (4).
    struct TestFs {
        cache: IntLock<InodeCache>,
    }

    impl TestFs {
        fn new() -> Arc<dyn Filesystem> {
            Arc::new(Self {
                cache: IntLock::new(InodeCache::new()),
            })
        }
    }

    impl Filesystem for TestFs {
        fn lookup(&self, dir: &Inode, name: &str) -> Result<InodeNum, Errno> {
            match (dir.num().0, name) {
                (2, "a") => Ok(InodeNum(3)),
                (2 | 3, "b") => Ok(InodeNum(4)),
                _ => Err(Errno::NoEntry),
            }
        }

        fn read_inode(&self, num: InodeNum) -> Result<InodeMeta, Errno> {
            let mode = if num.0 == 4 { S_IFREG } else { S_IFDIR };
            Ok(InodeMeta {
                mode,
                uid: 0,
                gid: 0,
                nlink: 1,
                size: 0,
                dev: 0,
            })
        }

        fn read_at(&self, _inode: &Inode, _buf: &mut [u8], _pos: u64) -> Result<usize, Errno> {
            Ok(0)
        }

        fn cache(&self) -> &IntLock<InodeCache> {
            &self.cache
        }
    }

    #[test]
    fn longest_whole_segment_mount_wins() {
        let mut vfs = Vfs::new();
        vfs.mount("/", TestFs::new()).unwrap();
        vfs.mount("/a", TestFs::new()).unwrap();

        // "/a/b" must use the "/a" mount (segment boundary), and the
        // lookup of "b" happens relative to that filesystem's root.
        let inode = vfs.traverse("/a/b").unwrap();
        assert_eq!(inode.num(), InodeNum(4));
        // Exact match on the mount path returns the pinned root.
        assert_eq!(vfs.traverse("/a").unwrap().num(), InodeNum(2));
        // "/ab" must NOT match the "/a" mount: not a whole segment.
        assert!(vfs.traverse("/ab").is_err());
    }

    #[test]
    fn traverse_walks_segments() {
        let mut vfs = Vfs::new();
        vfs.mount("/", TestFs::new()).unwrap();

        assert_eq!(vfs.traverse("/a").unwrap().num(), InodeNum(3));
        assert_eq!(vfs.traverse("/a/b").unwrap().num(), InodeNum(4));
        // Repeated slashes collapse.
        assert_eq!(vfs.traverse("//a///b").unwrap().num(), InodeNum(4));
        assert_eq!(vfs.traverse("/").unwrap().num(), InodeNum(2));
        assert_eq!(vfs.traverse("/missing").unwrap_err(), Errno::NoEntry);
        assert_eq!(vfs.traverse("").unwrap_err(), Errno::NoEntry);
    }

    #[test]
    fn no_mounts_is_no_entry() {
        let vfs = Vfs::new();
        assert_eq!(vfs.traverse("/x").unwrap_err(), Errno::NoEntry);
    }

    #[test]
    fn overlong_paths_are_rejected() {
        let mut vfs = Vfs::new();
        vfs.mount("/", TestFs::new()).unwrap();
        let long = alloc::format!("/{}", "x".repeat(PATH_NAME_MAX));
        assert_eq!(vfs.traverse(&long).unwrap_err(), Errno::PathTooLong);
    }

    #[test]
    fn parent_chain_is_pinned() {
        let mut vfs = Vfs::new();
        vfs.mount("/", TestFs::new()).unwrap();

        let a = vfs.traverse("/a").unwrap();
        assert_eq!(Arc::strong_count(&a), 1);

        // Traversing deeper revives the same `a` inode as the parent
        // back-reference of `b`.
        let b = vfs.traverse("/a/b").unwrap();
        assert_eq!(Arc::strong_count(&a), 2);
        assert!(core::ptr::eq(
            Arc::as_ptr(b.parent().unwrap()),
            Arc::as_ptr(&a)
        ));

        drop(b);
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn cache_keeps_inodes_unique() {
        let mut vfs = Vfs::new();
        vfs.mount("/", TestFs::new()).unwrap();

        let first = vfs.traverse("/a").unwrap();
        let second = vfs.traverse("/a").unwrap();
        assert!(core::ptr::eq(Arc::as_ptr(&first), Arc::as_ptr(&second)));

        // Dropping every reference evicts; the next traverse rebuilds.
        drop(first);
        drop(second);
        let again = vfs.traverse("/a").unwrap();
        assert_eq!(again.num(), InodeNum(3));
    }
}
