//! Per-filesystem inode cache.
//!
//! A fixed 256-bucket hash table keyed by inode number, holding weak
//! references: the cache never keeps an inode alive, it only guarantees
//! uniqueness of the live ones. Guarded by an interrupt lock per the
//! kernel's shared-resource policy.

use alloc::sync::Weak;

use tern_core::collections::HashTable;

use crate::inode::{Inode, InodeNum};

/// Bucket count of every inode cache.
pub const INODE_CACHE_BUCKETS: usize = 256;

/// Map from inode number to the unique in-memory inode, if instantiated.
pub struct InodeCache {
    table: HashTable<Weak<Inode>, INODE_CACHE_BUCKETS>,
}

// The whole table must fit in the single page the mount path allocates
// for it.
#[cfg(target_pointer_width = "32")]
tern_core::static_assert!(core::mem::size_of::<InodeCache>() <= 4096);

impl InodeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: HashTable::new(),
        }
    }

    /// Looks up an entry; the caller decides whether it still upgrades.
    #[must_use]
    pub fn get(&self, num: InodeNum) -> Option<&Weak<Inode>> {
        self.table.lookup(num.0)
    }

    /// Inserts a fresh entry.
    ///
    /// # Panics
    ///
    /// Panics if the number is already present (uniqueness invariant).
    pub fn insert(&mut self, num: InodeNum, inode: Weak<Inode>) {
        self.table.insert(num.0, inode);
    }

    /// Removes an entry, returning whether it was present.
    pub fn remove(&mut self, num: InodeNum) -> bool {
        self.table.remove(num.0).is_some()
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}
