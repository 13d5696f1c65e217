//! KTOS: a teaching kernel for a single-hart rv64 target.
//!
//! The crate is a `no_std` library so the portable layers (block cache,
//! file system, ELF loader, thread bookkeeping) build and unit-test on the
//! host; everything that touches a CSR, MMIO window, or context switch is
//! gated on `target_arch = "riscv64"`. The boot binary in `main.rs` wires
//! the pieces together in dependency order.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

extern crate alloc;

// Support library (error handling, logging, ring buffers).
pub mod klib;
// Platform descriptors (QEMU virt).
pub mod platform;
// CSRs, context switch, trap vector; host shims off-target.
pub mod arch;
// Interrupt-safe locking.
pub mod sync;
// Kernel heap.
pub mod heap;
// Interrupt manager and PLIC.
pub mod intr;
// Cooperative threads, conditions, locks.
pub mod thread;
// Tick source, sleep queue, alarms.
pub mod timer;
// Named device registry and capability traits.
pub mod device;
// Uniform I/O handles.
pub mod io;
// VirtIO MMIO transport and virtqueues.
pub mod virtio;
// Device drivers (UART, RTC, virtio block and entropy).
pub mod drivers;
// Write-back block cache.
pub mod cache;
// KTFS reader.
pub mod fs;
// ELF64 loader.
pub mod elf;
// Seeded pseudo-random source.
pub mod prng;

// Test fixtures (mock storage, disk-image builder).
#[cfg(test)]
pub mod test_utils;
