//! NS16550-compatible UART driver with ring-buffered, condition-signaled
//! I/O. The interrupt handler moves bytes between the hardware and the
//! rings; readers and writers sleep on the ring conditions.

use alloc::sync::Arc;

use crate::device::{self, Serial};
use crate::intr::{self, IsrHandler};
use crate::klib::error::{KernelError, Result};
use crate::klib::ringbuf::RingBuffer;
use crate::platform;
use crate::sync::{IntrGuard, IrqMutex};
use crate::thread::Condition;

const RING_CAPACITY: usize = 512;
const IRQ_PRIORITY: u32 = 2;

// Register offsets (byte-wide, reg-shift 0 on QEMU virt).
const REG_RBR: usize = 0; // receive buffer (read)
const REG_THR: usize = 0; // transmit holding (write)
const REG_IER: usize = 1; // interrupt enable
const REG_LSR: usize = 5; // line status

const IER_DATA_READY: u8 = 0x01;
const IER_THR_EMPTY: u8 = 0x02;
const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;

struct UartInner {
    rx: RingBuffer<u8, RING_CAPACITY>,
    tx: RingBuffer<u8, RING_CAPACITY>,
    open: bool,
    overruns: u64,
}

pub struct Uart16550 {
    base: usize,
    irq: u32,
    inner: IrqMutex<UartInner>,
    rx_ready: Condition,
    tx_space: Condition,
}

impl Uart16550 {
    fn read_reg(&self, offset: usize) -> u8 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u8) }
    }

    fn write_reg(&self, offset: usize, value: u8) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u8, value) }
    }

    fn ier_set(&self, bits: u8) {
        let ier = self.read_reg(REG_IER);
        self.write_reg(REG_IER, ier | bits);
    }

    fn ier_clear(&self, bits: u8) {
        let ier = self.read_reg(REG_IER);
        self.write_reg(REG_IER, ier & !bits);
    }

    /// Create instance `instance`, register its interrupt source, and add
    /// it to the device registry.
    pub fn attach(instance: usize) -> Result<Arc<Uart16550>> {
        let desc = platform::active().uart();
        if instance >= desc.count {
            return Err(KernelError::NoSuchEntry);
        }
        let uart = Arc::new(Uart16550 {
            base: desc.instance_base(instance),
            irq: desc.instance_irq(instance),
            inner: IrqMutex::new(UartInner {
                rx: RingBuffer::new(),
                tx: RingBuffer::new(),
                open: false,
                overruns: 0,
            }),
            rx_ready: Condition::new("uart-rx-ready"),
            tx_space: Condition::new("uart-tx-space"),
        });
        intr::enable_source(uart.irq, IRQ_PRIORITY, uart.clone())?;
        device::register_serial("uart", instance as u32, uart.clone())?;
        Ok(uart)
    }

    pub fn overruns(&self) -> u64 {
        self.inner.lock().overruns
    }
}

impl Serial for Uart16550 {
    fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.open {
            return Err(KernelError::Busy);
        }
        inner.rx.clear();
        inner.tx.clear();
        inner.open = true;
        drop(inner);

        // Flush anything sitting in the receive register, then take
        // receive interrupts.
        let _ = self.read_reg(REG_RBR);
        self.write_reg(REG_IER, IER_DATA_READY);
        Ok(())
    }

    fn close(&self) {
        self.write_reg(REG_IER, 0);
        self.inner.lock().open = false;
        // Waiters wake and observe the closed device.
        self.rx_ready.broadcast();
        self.tx_space.broadcast();
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let _guard = IntrGuard::new();
        loop {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(KernelError::InvalidArgument);
            }
            if inner.rx.is_empty() {
                // Re-assert data-ready: the handler masks it when the ring
                // overruns.
                drop(inner);
                self.ier_set(IER_DATA_READY);
                self.rx_ready.wait();
                continue;
            }
            let mut n = 0;
            while n < buf.len() {
                match inner.rx.pop() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            return Ok(n);
        }
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        let _guard = IntrGuard::new();
        let mut sent = 0;
        while sent < buf.len() {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(KernelError::InvalidArgument);
            }
            if inner.tx.is_full() {
                drop(inner);
                self.ier_set(IER_THR_EMPTY);
                self.tx_space.wait();
                continue;
            }
            while sent < buf.len() && inner.tx.push(buf[sent]) {
                sent += 1;
            }
            drop(inner);
            // The handler masks this when the ring drains; re-arm after
            // every burst.
            self.ier_set(IER_THR_EMPTY);
        }
        Ok(sent)
    }
}

impl IsrHandler for Uart16550 {
    fn isr(&self, _src: u32) {
        let lsr = self.read_reg(REG_LSR);

        if lsr & LSR_DATA_READY != 0 {
            let byte = self.read_reg(REG_RBR);
            let mut inner = self.inner.lock();
            if inner.rx.push(byte) {
                drop(inner);
                self.rx_ready.broadcast();
            } else {
                inner.overruns += 1;
                drop(inner);
                // Throttle until a reader drains the ring.
                self.ier_clear(IER_DATA_READY);
            }
        }

        if lsr & LSR_THR_EMPTY != 0 {
            let mut inner = self.inner.lock();
            match inner.tx.pop() {
                Some(byte) => {
                    drop(inner);
                    self.write_reg(REG_THR, byte);
                    self.tx_space.broadcast();
                }
                None => {
                    drop(inner);
                    self.ier_clear(IER_THR_EMPTY);
                }
            }
        }
    }
}

/// Polled transmit on UART0 for the boot console and panic paths; works
/// before the driver (or anything else) is up.
#[cfg(target_arch = "riscv64")]
pub fn early_write(bytes: &[u8]) {
    let base = platform::active().uart().base;
    for &byte in bytes {
        unsafe {
            while core::ptr::read_volatile((base + REG_LSR) as *const u8) & LSR_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile((base + REG_THR) as *mut u8, byte);
        }
    }
}
