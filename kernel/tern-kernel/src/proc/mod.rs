//! User program loading.

pub mod elf;
