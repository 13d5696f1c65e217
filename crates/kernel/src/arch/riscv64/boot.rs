//! Boot stub. The boot ROM drops us here in S mode with paging off; we
//! park the stack pointer on the boot stack and enter the kernel proper.
//! Linker script and firmware are external collaborators.

use core::arch::global_asm;

global_asm!(
    r#"
    .section .text.boot
    .globl _start
_start:
    la   sp, __boot_stack_top
    call kernel_main
1:
    wfi
    j    1b

    .section .bss
    .align 16
__boot_stack:
    .space 64 * 1024
__boot_stack_top:
"#
);
