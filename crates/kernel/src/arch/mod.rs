//! Architecture layer. The rv64 implementation talks to real CSRs; every
//! other target gets inert shims so the portable kernel layers build and
//! unit-test on the host.

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
mod imp {
    pub use super::riscv64::context::Context;
    use riscv::register;

    /// Disable S-mode interrupts, returning whether they were enabled.
    #[inline]
    pub fn irq_save() -> bool {
        let was = register::sstatus::read().sie();
        unsafe { register::sstatus::clear_sie() };
        was
    }

    #[inline]
    pub fn irq_restore(was_enabled: bool) {
        if was_enabled {
            unsafe { register::sstatus::set_sie() };
        } else {
            unsafe { register::sstatus::clear_sie() };
        }
    }

    #[inline]
    pub fn irq_enable() {
        unsafe { register::sstatus::set_sie() };
    }

    #[inline]
    pub fn irq_disable() {
        unsafe { register::sstatus::clear_sie() };
    }

    pub fn external_irq_enable(on: bool) {
        unsafe {
            if on {
                register::sie::set_sext();
            } else {
                register::sie::clear_sext();
            }
        }
    }

    pub fn timer_irq_enable(on: bool) {
        unsafe {
            if on {
                register::sie::set_stimer();
            } else {
                register::sie::clear_stimer();
            }
        }
    }

    /// Program the Sstc S-mode timer compare (CSR 0x14d).
    pub fn set_timer_compare(ticks: u64) {
        unsafe {
            core::arch::asm!("csrw 0x14d, {0}", in(reg) ticks);
        }
    }

    /// Real-time counter (rdtime).
    #[inline]
    pub fn read_time() -> u64 {
        register::time::read() as u64
    }

    #[inline]
    pub fn wait_for_interrupt() {
        unsafe { core::arch::asm!("wfi") };
    }

    pub fn halt() -> ! {
        loop {
            unsafe {
                register::sstatus::clear_sie();
                core::arch::asm!("wfi");
            }
        }
    }

    /// Callee-saved register swap to another thread's context.
    ///
    /// # Safety
    /// Both pointers must reference live `Context` records; `new` must hold
    /// a resumable context (a prior save or a trampoline frame).
    pub unsafe fn switch_context(old: *mut Context, new: *const Context) {
        super::riscv64::context::switch(old, new)
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    //! Host shims: no interrupt masking, a software tick counter, and a
    //! recorded timer compare so the sleep-queue logic is observable in
    //! unit tests.

    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Clone, Copy, Debug)]
    pub struct Context;

    impl Context {
        pub const fn zero() -> Self {
            Context
        }

        pub fn with_entry(_entry: usize, _stack_top: usize) -> Self {
            Context
        }
    }

    static TICKS: AtomicU64 = AtomicU64::new(0);
    static TIMER_COMPARE: AtomicU64 = AtomicU64::new(u64::MAX);
    static TIMER_IRQ: AtomicBool = AtomicBool::new(false);

    pub fn irq_save() -> bool {
        false
    }

    pub fn irq_restore(_was_enabled: bool) {}

    pub fn irq_enable() {}

    pub fn irq_disable() {}

    pub fn external_irq_enable(_on: bool) {}

    pub fn timer_irq_enable(on: bool) {
        TIMER_IRQ.store(on, Ordering::Relaxed);
    }

    pub fn timer_irq_enabled() -> bool {
        TIMER_IRQ.load(Ordering::Relaxed)
    }

    pub fn set_timer_compare(ticks: u64) {
        TIMER_COMPARE.store(ticks, Ordering::Relaxed);
    }

    pub fn timer_compare() -> u64 {
        TIMER_COMPARE.load(Ordering::Relaxed)
    }

    pub fn read_time() -> u64 {
        TICKS.load(Ordering::Relaxed)
    }

    pub fn advance_time(delta: u64) {
        TICKS.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn wait_for_interrupt() {}

    pub fn halt() -> ! {
        unreachable!("halt invoked off-target");
    }
}

pub use imp::*;
