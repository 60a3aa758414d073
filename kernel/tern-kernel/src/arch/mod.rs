//! Architecture support. i386 is the only implemented target.

pub mod x86;
