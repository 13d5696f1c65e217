//! Raw PLIC register access (SiFive layout, as on QEMU virt).

use crate::platform::PlicDesc;
use core::ptr;

const PRIORITY_BASE: usize = 0x0000;
const ENABLE_BASE: usize = 0x2000;
const ENABLE_STRIDE: usize = 0x80;
const CONTEXT_BASE: usize = 0x20_0000;
const CONTEXT_STRIDE: usize = 0x1000;
const THRESHOLD_OFFSET: usize = 0x0;
const CLAIM_OFFSET: usize = 0x4;

fn priority_reg(desc: &PlicDesc, src: u32) -> *mut u32 {
    (desc.base + PRIORITY_BASE + 4 * src as usize) as *mut u32
}

fn enable_reg(desc: &PlicDesc, context: usize, word: usize) -> *mut u32 {
    (desc.base + ENABLE_BASE + context * ENABLE_STRIDE + 4 * word) as *mut u32
}

fn threshold_reg(desc: &PlicDesc, context: usize) -> *mut u32 {
    (desc.base + CONTEXT_BASE + context * CONTEXT_STRIDE + THRESHOLD_OFFSET) as *mut u32
}

fn claim_reg(desc: &PlicDesc, context: usize) -> *mut u32 {
    (desc.base + CONTEXT_BASE + context * CONTEXT_STRIDE + CLAIM_OFFSET) as *mut u32
}

/// Mask every source, enable them all for our S context (gated by
/// priority 0), and close every other context.
pub fn init(desc: &PlicDesc) {
    unsafe {
        for src in 1..desc.num_sources {
            ptr::write_volatile(priority_reg(desc, src), 0);
        }
        let words = (desc.num_sources as usize + 31) / 32;
        for context in 0..desc.num_contexts {
            let ours = context == desc.context;
            for word in 0..words {
                let bits = if ours { u32::MAX } else { 0 };
                ptr::write_volatile(enable_reg(desc, context, word), bits);
            }
            let threshold = if ours { 0 } else { desc.max_priority };
            ptr::write_volatile(threshold_reg(desc, context), threshold);
        }
    }
}

pub fn set_priority(desc: &PlicDesc, src: u32, priority: u32) {
    unsafe {
        ptr::write_volatile(priority_reg(desc, src), priority);
    }
}

/// Claim the highest-priority pending source; 0 when none pend.
pub fn claim(desc: &PlicDesc) -> u32 {
    unsafe { ptr::read_volatile(claim_reg(desc, desc.context)) }
}

/// Signal completion so the source can interrupt again.
pub fn complete(desc: &PlicDesc, src: u32) {
    unsafe {
        ptr::write_volatile(claim_reg(desc, desc.context), src);
    }
}
