// Kernel error handling and error-code definitions

use core::fmt;

/// Kernel-wide error kinds. Every recoverable failure in the I/O stack is
/// one of these; each maps to a small negative integer for interfaces that
/// report errors numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    InvalidArgument,
    NotSupported,
    NoSuchEntry,
    Busy,
    OutOfMemory,
    OutOfThreads,
    TooManyOpen,
    AlreadyExists,
    Io,
    BadFormat,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    /// Numeric error code (always negative).
    pub fn code(self) -> i32 {
        match self {
            KernelError::InvalidArgument => -1,
            KernelError::NotSupported => -2,
            KernelError::NoSuchEntry => -3,
            KernelError::Busy => -4,
            KernelError::OutOfMemory => -5,
            KernelError::OutOfThreads => -6,
            KernelError::TooManyOpen => -7,
            KernelError::AlreadyExists => -8,
            KernelError::Io => -9,
            KernelError::BadFormat => -10,
        }
    }

    /// Static name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotSupported => "not supported",
            KernelError::NoSuchEntry => "no such entry",
            KernelError::Busy => "busy",
            KernelError::OutOfMemory => "out of memory",
            KernelError::OutOfThreads => "out of threads",
            KernelError::TooManyOpen => "too many open",
            KernelError::AlreadyExists => "already exists",
            KernelError::Io => "i/o error",
            KernelError::BadFormat => "bad format",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            KernelError::InvalidArgument,
            KernelError::NotSupported,
            KernelError::NoSuchEntry,
            KernelError::Busy,
            KernelError::OutOfMemory,
            KernelError::OutOfThreads,
            KernelError::TooManyOpen,
            KernelError::AlreadyExists,
            KernelError::Io,
            KernelError::BadFormat,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
