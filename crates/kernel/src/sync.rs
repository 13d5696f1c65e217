//! Interrupt-safe locking. Any state an interrupt handler touches must be
//! guarded with interrupts masked, not just a spinlock: on a single hart a
//! handler preempting the lock holder would spin forever.

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::arch;

/// Spin mutex that masks S-mode interrupts for the duration of the guard.
/// Nesting is fine: the saved interrupt state is restored on drop.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let was_enabled = arch::irq_save();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            was_enabled,
        }
    }
}

pub struct IrqMutexGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    was_enabled: bool,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        arch::irq_restore(self.was_enabled);
    }
}

/// Bare interrupts-off region, for check-then-sleep sequences that must not
/// race an interrupt handler's broadcast.
pub struct IntrGuard {
    was_enabled: bool,
}

impl IntrGuard {
    pub fn new() -> Self {
        Self {
            was_enabled: arch::irq_save(),
        }
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        arch::irq_restore(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_gives_exclusive_access() {
        let m = IrqMutex::new(41);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn reentrant_after_drop() {
        let m = IrqMutex::new(0u32);
        for _ in 0..3 {
            *m.lock() += 1;
        }
        assert_eq!(*m.lock(), 3);
    }
}
