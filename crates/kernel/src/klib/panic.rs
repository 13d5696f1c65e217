// Panic handling: recursion guard, location report, halt.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

/// Guards against a panic raised while reporting a panic.
static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn report(info: &PanicInfo) -> ! {
    crate::arch::irq_disable();

    if PANICKING.swap(true, Ordering::SeqCst) {
        crate::klib::printk::console_write(b"\n!!! recursive panic !!!\n");
        crate::arch::halt();
    }

    crate::klib::printk::console_write(b"\n*** KERNEL PANIC ***\n");
    if let Some(location) = info.location() {
        crate::error!(
            "panic at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    crate::error!("panic: {}", info.message());

    crate::arch::halt();
}

#[cfg(all(target_arch = "riscv64", not(test)))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    report(info)
}
