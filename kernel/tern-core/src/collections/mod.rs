//! Collection types used by the allocators, the scheduler, and the VFS.

pub mod bitset;
pub mod hashtable;
pub mod rbtree;

pub use bitset::Bitset;
pub use hashtable::HashTable;
pub use rbtree::RbTree;
