//! Kernel heap: linked-list allocator over a static backing array.
//!
//! The allocator is wrapped so every allocation runs with interrupts
//! masked; interrupt handlers clone and drop `Arc`s and grow ready queues,
//! and must not deadlock against a thread holding the heap lock.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;

use crate::arch;

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[repr(align(64))]
struct HeapArea([u8; HEAP_SIZE]);

static mut HEAP_AREA: HeapArea = HeapArea([0; HEAP_SIZE]);

struct IrqSafeHeap {
    inner: LockedHeap,
}

unsafe impl GlobalAlloc for IrqSafeHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let was = arch::irq_save();
        let ptr = self.inner.alloc(layout);
        arch::irq_restore(was);
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let was = arch::irq_save();
        self.inner.dealloc(ptr, layout);
        arch::irq_restore(was);
    }
}

#[cfg_attr(all(target_arch = "riscv64", not(test)), global_allocator)]
static ALLOCATOR: IrqSafeHeap = IrqSafeHeap {
    inner: LockedHeap::empty(),
};

static HEAP_INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Hand the backing array to the allocator. Idempotent.
pub fn init() {
    if HEAP_INIT_DONE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    unsafe {
        let bottom = core::ptr::addr_of_mut!(HEAP_AREA) as *mut u8;
        ALLOCATOR.inner.lock().init(bottom, HEAP_SIZE);
    }
    crate::info!("heap: {} KiB at {:p}", HEAP_SIZE / 1024, unsafe {
        core::ptr::addr_of!(HEAP_AREA)
    });
}

pub const fn total_size() -> usize {
    HEAP_SIZE
}
