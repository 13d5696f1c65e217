//! Uniform I/O: every byte-oriented object the kernel hands around (files,
//! the console) sits behind the `Io` trait and a reference-counted handle.

use alloc::sync::Arc;

use crate::device::Serial;
use crate::klib::error::{KernelError, Result};

/// Control operations recognized across the I/O surface. Individual
/// backends support a subset and answer `NotSupported` for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cntl {
    GetEnd,
    SetEnd(u64),
    GetPosition,
    SetPosition(u64),
    Mmap,
}

/// Backing operations behind a handle. Defaults reject everything, so a
/// backend only implements what it supports.
pub trait Io: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn cntl(&self, _op: Cntl) -> Result<u64> {
        Err(KernelError::NotSupported)
    }

    fn close(&self) {}
}

/// Reference-counted handle over a backing `Io`. Cloning adds a reference;
/// `close` runs the backing close only when the last reference goes.
pub struct IoHandle {
    backing: Arc<dyn Io>,
}

impl Clone for IoHandle {
    fn clone(&self) -> Self {
        Self {
            backing: self.backing.clone(),
        }
    }
}

impl IoHandle {
    pub fn new(backing: Arc<dyn Io>) -> Self {
        Self { backing }
    }

    /// A handle whose read and write always answer `NotSupported`.
    pub fn null() -> Self {
        struct NullIo;
        impl Io for NullIo {}
        Self::new(Arc::new(NullIo))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.backing.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.backing.write(buf)
    }

    pub fn cntl(&self, op: Cntl) -> Result<u64> {
        self.backing.cntl(op)
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.backing)
    }

    /// Drop this reference; the backing close runs when it was the last.
    pub fn close(self) {
        if Arc::strong_count(&self.backing) == 1 {
            self.backing.close();
        }
    }
}

/// Serial device presented through the uniform interface; this is the
/// console handle the boot path passes to the loaded program.
pub struct SerialIo {
    dev: Arc<dyn Serial>,
}

impl SerialIo {
    pub fn new(dev: Arc<dyn Serial>) -> Self {
        Self { dev }
    }
}

impl Io for SerialIo {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.dev.recv(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.dev.send(buf)
    }

    fn close(&self) {
        self.dev.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn null_handle_rejects_io() {
        let h = IoHandle::null();
        let mut buf = [0u8; 4];
        assert_eq!(h.read(&mut buf), Err(KernelError::NotSupported));
        assert_eq!(h.write(&buf), Err(KernelError::NotSupported));
        assert_eq!(h.cntl(Cntl::GetEnd), Err(KernelError::NotSupported));
    }

    struct CloseCounter(Arc<AtomicUsize>);

    impl Io for CloseCounter {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn close_runs_backing_close_on_last_reference_only() {
        let closes = Arc::new(AtomicUsize::new(0));
        let h = IoHandle::new(Arc::new(CloseCounter(closes.clone())));
        let dup = h.clone();
        assert_eq!(h.refcount(), 2);

        h.close();
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        dup.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
