//! QEMU rv64 `virt` machine descriptors.

use super::{Platform, PlicDesc, RamDesc, RtcDesc, TimerDesc, UartDesc, VirtioDesc};

pub struct QemuVirt;

pub static INSTANCE: QemuVirt = QemuVirt;

impl Platform for QemuVirt {
    fn uart(&self) -> UartDesc {
        UartDesc {
            base: 0x1000_0000,
            stride: 0x100,
            count: 1,
            irq_base: 10,
        }
    }

    fn plic(&self) -> PlicDesc {
        PlicDesc {
            base: 0x0c00_0000,
            num_sources: 96,
            // Context 1 is hart 0 S mode on virt; context 0 is its M mode.
            context: 1,
            num_contexts: 2,
            max_priority: 7,
        }
    }

    fn rtc(&self) -> RtcDesc {
        RtcDesc {
            base: 0x0010_1000,
            irq: 11,
        }
    }

    fn virtio(&self) -> VirtioDesc {
        VirtioDesc {
            base: 0x1000_1000,
            stride: 0x1000,
            count: 8,
            irq_base: 1,
        }
    }

    fn timer(&self) -> TimerDesc {
        TimerDesc {
            freq_hz: 10_000_000,
        }
    }

    fn ram(&self) -> RamDesc {
        RamDesc {
            start: 0x8000_0000,
            end: 0x8800_0000,
        }
    }
}
