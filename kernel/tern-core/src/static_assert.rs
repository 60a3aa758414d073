//! Compile-time assertions.

/// Asserts a condition at compile time.
///
/// Evaluates the expression in a `const` context so a violation fails the
/// build rather than the boot.
#[macro_export]
macro_rules! static_assert {
    ($cond:expr) => {
        const _: () = assert!($cond);
    };
    ($cond:expr, $msg:literal) => {
        const _: () = assert!($cond, $msg);
    };
}
