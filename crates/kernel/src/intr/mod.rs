//! Interrupt manager: per-source handler table over the PLIC. Single hart,
//! S-mode context only. Timer interrupts are routed directly to the timer
//! and counted separately from external claims.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::klib::error::{KernelError, Result};
use crate::platform;
use crate::sync::IrqMutex;

#[cfg(target_arch = "riscv64")]
pub mod plic;

/// Implemented by drivers whose device raises a PLIC source.
pub trait IsrHandler: Send + Sync {
    fn isr(&self, src: u32);
}

struct HandlerTable {
    slots: Vec<Option<Arc<dyn IsrHandler>>>,
}

static HANDLERS: IrqMutex<HandlerTable> = IrqMutex::new(HandlerTable { slots: Vec::new() });
static EXTERNAL_IRQS: AtomicU64 = AtomicU64::new(0);
static SPURIOUS_IRQS: AtomicU64 = AtomicU64::new(0);

/// Mask every source, open this hart's S context, shut the others, and
/// install the trap vector.
pub fn init() {
    let desc = platform::active().plic();
    {
        let mut table = HANDLERS.lock();
        table.slots.clear();
        table.slots.resize_with(desc.num_sources as usize, || None);
    }

    #[cfg(target_arch = "riscv64")]
    {
        plic::init(&desc);
        crate::arch::riscv64::trap::init();
    }

    crate::info!("intr: {} sources, context {}", desc.num_sources, desc.context);
}

/// Route `src` to `handler` at the given priority (clamped to the platform
/// maximum; zero would mask the source and is rejected).
pub fn enable_source(src: u32, priority: u32, handler: Arc<dyn IsrHandler>) -> Result<()> {
    let desc = platform::active().plic();
    if src == 0 || src >= desc.num_sources || priority == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let priority = priority.min(desc.max_priority);

    {
        let mut table = HANDLERS.lock();
        table.slots[src as usize] = Some(handler);
    }
    #[cfg(target_arch = "riscv64")]
    plic::set_priority(&desc, src, priority);
    #[cfg(not(target_arch = "riscv64"))]
    let _ = priority;

    Ok(())
}

/// Mask `src` and forget its handler.
pub fn disable_source(src: u32) -> Result<()> {
    let desc = platform::active().plic();
    if src == 0 || src >= desc.num_sources {
        return Err(KernelError::InvalidArgument);
    }
    #[cfg(target_arch = "riscv64")]
    plic::set_priority(&desc, src, 0);
    {
        let mut table = HANDLERS.lock();
        table.slots[src as usize] = None;
    }
    Ok(())
}

/// External-interrupt entry: claim, dispatch, complete until the claim
/// register runs dry.
#[cfg(target_arch = "riscv64")]
pub fn handle_external() {
    let desc = platform::active().plic();
    loop {
        let src = plic::claim(&desc);
        if src == 0 {
            break;
        }
        let handler = {
            let table = HANDLERS.lock();
            table.slots.get(src as usize).cloned().flatten()
        };
        match handler {
            Some(h) => h.isr(src),
            None => {
                SPURIOUS_IRQS.fetch_add(1, Ordering::Relaxed);
                crate::warn!("intr: claim for unhandled source {}", src);
            }
        }
        plic::complete(&desc, src);
    }
    EXTERNAL_IRQS.fetch_add(1, Ordering::Relaxed);
}

#[cfg(not(target_arch = "riscv64"))]
pub fn handle_external() {}

pub fn external_count() -> u64 {
    EXTERNAL_IRQS.load(Ordering::Relaxed)
}

pub fn spurious_count() -> u64 {
    SPURIOUS_IRQS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    struct CountingHandler(AtomicU32);

    impl IsrHandler for CountingHandler {
        fn isr(&self, _src: u32) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn enable_validates_source_and_priority() {
        init();
        let h: Arc<dyn IsrHandler> = Arc::new(CountingHandler(AtomicU32::new(0)));
        assert_eq!(
            enable_source(0, 1, h.clone()),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            enable_source(10_000, 1, h.clone()),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            enable_source(5, 0, h.clone()),
            Err(KernelError::InvalidArgument)
        );
        assert!(enable_source(5, 99, h).is_ok());
        assert!(disable_source(5).is_ok());
        assert_eq!(disable_source(0), Err(KernelError::InvalidArgument));
    }
}
