//! # Fatal Diagnostics
//!
//! Allocator contract violations are not recoverable: a corrupted free list
//! or an overrun signature means the heap can no longer be trusted. Every
//! such check goes through [`mem_assert!`], which logs the failure, hands it
//! to an optional process hook and then panics.
//!
//! Release builds abort on panic (see the workspace profile), which makes
//! these failures terminate the process.

use std::fmt;

use parking_lot::RwLock;

/// A contract violation detected by the memory system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Source file of the failed check.
    pub file: &'static str,
    /// Source line of the failed check.
    pub line: u32,
    /// Rendered failure message.
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.message)
    }
}

/// Observer invoked for every failure before the panic.
pub type FailureHook = fn(&Failure);

static FAILURE_HOOK: RwLock<Option<FailureHook>> = parking_lot::const_rwlock(None);

/// Installs (or clears) the process-wide failure observer.
///
/// The hook cannot suppress the failure; it only gets to see it first
/// (crash reporters, test harnesses).
pub fn set_failure_hook(hook: Option<FailureHook>) {
    *FAILURE_HOOK.write() = hook;
}

/// Reports a fatal contract violation.
///
/// Prefer [`mem_assert!`] over calling this directly.
#[cold]
#[inline(never)]
#[track_caller]
pub fn raise_failure(file: &'static str, line: u32, args: fmt::Arguments<'_>) -> ! {
    let failure = Failure {
        file,
        line,
        message: args.to_string(),
    };
    tracing::error!(file, line, "memory failure: {}", failure.message);

    if let Some(hook) = *FAILURE_HOOK.read() {
        hook(&failure);
    }

    panic!("{failure}");
}

/// Asserts an allocator invariant, failing fatally through
/// [`raise_failure`](crate::diag::raise_failure).
///
/// ```rust,ignore
/// mem_assert!(size <= BLOCK_SIZE, "invalid size {size} for {BLOCK_SIZE}-byte blocks");
/// ```
#[macro_export]
macro_rules! mem_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::diag::raise_failure(
                file!(),
                line!(),
                format_args!("assertion failed: {}", stringify!($cond)),
            );
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::diag::raise_failure(file!(), line!(), format_args!($($arg)+));
        }
    };
}

/// Like [`mem_assert!`] but only checked in builds with debug assertions.
#[macro_export]
macro_rules! mem_debug_assert {
    ($($arg:tt)+) => {
        if cfg!(debug_assertions) {
            $crate::mem_assert!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let failure = Failure {
            file: "section.rs",
            line: 12,
            message: "out of memory".to_string(),
        };
        assert_eq!(failure.to_string(), "section.rs:12: out of memory");
    }

    #[test]
    #[should_panic(expected = "invalid size 9")]
    fn test_mem_assert_panics_with_message() {
        let size = 9;
        crate::mem_assert!(size <= 8, "invalid size {size}");
    }

    #[test]
    fn test_mem_assert_passes() {
        crate::mem_assert!(1 + 1 == 2);
    }
}
