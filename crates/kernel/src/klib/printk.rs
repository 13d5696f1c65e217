// Kernel logging (printk) with a bounded in-memory ring of recent entries.
//
// Entries are formatted into fixed buffers so logging works before the heap
// is up and from interrupt handlers.

use super::ringbuf::RingBuffer;
use crate::sync::IrqMutex;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

pub const MAX_MESSAGE_LEN: usize = 128;
const LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Global log level (default: INFO).
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

#[derive(Copy, Clone)]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: [u8; MAX_MESSAGE_LEN],
    pub len: usize,
}

// Interrupt handlers log too; the ring must be interrupt-masked so a
// handler cannot spin against the thread it interrupted.
static KERNEL_LOG: IrqMutex<RingBuffer<LogEntry, LOG_CAPACITY>> =
    IrqMutex::new(RingBuffer::new());

/// Formats into a fixed buffer, silently truncating past capacity.
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let space = self.buf.len() - self.len;
        let n = core::cmp::min(space, s.len());
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Raw console sink. On the rv64 target this is the polled UART0 transmit
/// path; elsewhere (host unit tests) it discards output.
pub fn console_write(bytes: &[u8]) {
    #[cfg(target_arch = "riscv64")]
    crate::drivers::uart::early_write(bytes);
    #[cfg(not(target_arch = "riscv64"))]
    let _ = bytes;
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let mut message = [0u8; MAX_MESSAGE_LEN];
    let len = {
        let mut w = FixedWriter {
            buf: &mut message,
            len: 0,
        };
        let _ = write!(w, "{}", args);
        w.len
    };

    console_write(b"[");
    console_write(level.as_str().as_bytes());
    console_write(b"] ");
    console_write(&message[..len]);
    console_write(b"\n");

    let entry = LogEntry {
        timestamp: crate::timer::ticks(),
        level,
        message,
        len,
    };
    KERNEL_LOG.lock().push(entry);
}

/// Drain the retained entries (post-mortem dumps, diagnostics).
pub fn drain() -> alloc::vec::Vec<LogEntry> {
    KERNEL_LOG.lock().drain_all()
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::klib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Debug, $($arg)*)
    };
}
