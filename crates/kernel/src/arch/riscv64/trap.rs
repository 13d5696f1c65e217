//! S-mode trap vector and dispatch. Interrupt handlers never switch
//! contexts; they flip thread state and return to the interrupted code.

use core::arch::global_asm;
use riscv::register::{scause, sepc, stval, stvec};

const CAUSE_SUPERVISOR_TIMER: usize = 5;
const CAUSE_SUPERVISOR_EXTERNAL: usize = 9;

pub fn init() {
    extern "C" {
        fn __trap_vector();
    }
    unsafe {
        stvec::write(__trap_vector as usize, stvec::TrapMode::Direct);
    }
}

// Caller-saved registers only; the trap returns to the interrupted
// instruction on the same stack, and callee-saved registers are preserved
// by the Rust dispatch below.
global_asm!(
    r#"
    .globl __trap_vector
    .align 4
__trap_vector:
    addi sp, sp, -128
    sd   ra, 0(sp)
    sd   t0, 8(sp)
    sd   t1, 16(sp)
    sd   t2, 24(sp)
    sd   a0, 32(sp)
    sd   a1, 40(sp)
    sd   a2, 48(sp)
    sd   a3, 56(sp)
    sd   a4, 64(sp)
    sd   a5, 72(sp)
    sd   a6, 80(sp)
    sd   a7, 88(sp)
    sd   t3, 96(sp)
    sd   t4, 104(sp)
    sd   t5, 112(sp)
    sd   t6, 120(sp)

    call __trap_dispatch

    ld   ra, 0(sp)
    ld   t0, 8(sp)
    ld   t1, 16(sp)
    ld   t2, 24(sp)
    ld   a0, 32(sp)
    ld   a1, 40(sp)
    ld   a2, 48(sp)
    ld   a3, 56(sp)
    ld   a4, 64(sp)
    ld   a5, 72(sp)
    ld   a6, 80(sp)
    ld   a7, 88(sp)
    ld   t3, 96(sp)
    ld   t4, 104(sp)
    ld   t5, 112(sp)
    ld   t6, 120(sp)
    addi sp, sp, 128
    sret
"#
);

#[no_mangle]
extern "C" fn __trap_dispatch() {
    let cause = scause::read();
    if cause.is_interrupt() {
        match cause.code() {
            CAUSE_SUPERVISOR_TIMER => crate::timer::handle_interrupt(),
            CAUSE_SUPERVISOR_EXTERNAL => crate::intr::handle_external(),
            code => {
                crate::warn!("spurious S-mode interrupt, code {}", code);
            }
        }
    } else {
        fatal_exception(cause.code());
    }
}

fn fatal_exception(code: usize) -> ! {
    let pc = sepc::read();
    let addr = stval::read();
    let name = exception_name(code);
    if reports_fault_address(code) {
        panic!(
            "unhandled S-mode exception: {} (cause {}) at pc {:#x}, fault address {:#x}",
            name, code, pc, addr
        );
    }
    panic!(
        "unhandled S-mode exception: {} (cause {}) at pc {:#x}",
        name, code, pc
    );
}

fn reports_fault_address(code: usize) -> bool {
    matches!(code, 1 | 5 | 7 | 12 | 13 | 15)
}

fn exception_name(code: usize) -> &'static str {
    match code {
        0 => "instruction address misaligned",
        1 => "instruction access fault",
        2 => "illegal instruction",
        3 => "breakpoint",
        4 => "load address misaligned",
        5 => "load access fault",
        6 => "store address misaligned",
        7 => "store access fault",
        8 => "environment call from U mode",
        9 => "environment call from S mode",
        12 => "instruction page fault",
        13 => "load page fault",
        15 => "store page fault",
        _ => "unknown",
    }
}
