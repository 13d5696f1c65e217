//! Platform abstraction layer for hardware-neutral bring-up.
//! Provides device descriptors and memory ranges. Default implementation
//! targets the QEMU rv64 virt machine.

/// NS16550 UART bank descriptor.
#[derive(Copy, Clone)]
pub struct UartDesc {
    pub base: usize,
    pub stride: usize,
    pub count: usize,
    pub irq_base: u32,
}

impl UartDesc {
    pub fn instance_base(&self, instance: usize) -> usize {
        self.base + instance * self.stride
    }

    pub fn instance_irq(&self, instance: usize) -> u32 {
        self.irq_base + instance as u32
    }
}

/// Platform-level interrupt controller descriptor.
#[derive(Copy, Clone)]
pub struct PlicDesc {
    pub base: usize,
    pub num_sources: u32,
    /// Claim/enable context for this hart's S mode.
    pub context: usize,
    /// Total contexts exposed by the controller.
    pub num_contexts: usize,
    pub max_priority: u32,
}

/// Goldfish RTC descriptor.
#[derive(Copy, Clone)]
pub struct RtcDesc {
    pub base: usize,
    pub irq: u32,
}

/// VirtIO MMIO slot bank descriptor.
#[derive(Copy, Clone)]
pub struct VirtioDesc {
    pub base: usize,
    pub stride: usize,
    pub count: usize,
    pub irq_base: u32,
}

impl VirtioDesc {
    pub fn slot_base(&self, slot: usize) -> usize {
        self.base + slot * self.stride
    }

    pub fn slot_irq(&self, slot: usize) -> u32 {
        self.irq_base + slot as u32
    }
}

/// Timebase descriptor.
#[derive(Copy, Clone)]
pub struct TimerDesc {
    pub freq_hz: u64,
}

/// RAM range descriptor.
#[derive(Copy, Clone)]
pub struct RamDesc {
    pub start: usize,
    pub end: usize,
}

/// Platform trait provides device descriptors and ranges.
pub trait Platform: Sync {
    fn uart(&self) -> UartDesc;
    fn plic(&self) -> PlicDesc;
    fn rtc(&self) -> RtcDesc;
    fn virtio(&self) -> VirtioDesc;
    fn timer(&self) -> TimerDesc;
    fn ram(&self) -> RamDesc;
}

pub mod qemu_virt;

/// Return the active platform implementation. For now, default to QEMU virt.
pub fn active() -> &'static dyn Platform {
    &qemu_virt::INSTANCE
}
