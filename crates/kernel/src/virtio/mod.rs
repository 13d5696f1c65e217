//! VirtIO MMIO transport (VirtIO 1.2 split virtqueues, non-legacy).
//!
//! Owns the register map, device status dance, two-bank feature
//! negotiation, and virtqueue attach/reset. Device behavior lives in the
//! per-class drivers.

pub mod virtqueue;

use crate::klib::error::{KernelError, Result};
use core::ptr;

/// VirtIO MMIO register offsets.
#[repr(usize)]
#[derive(Debug, Clone, Copy)]
pub enum Reg {
    MagicValue = 0x000,
    Version = 0x004,
    DeviceId = 0x008,
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DeviceFeaturesSel = 0x014,
    DriverFeatures = 0x020,
    DriverFeaturesSel = 0x024,
    QueueSel = 0x030,
    QueueNumMax = 0x034,
    QueueNum = 0x038,
    QueueReady = 0x044,
    QueueNotify = 0x050,
    InterruptStatus = 0x060,
    InterruptAck = 0x064,
    Status = 0x070,
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    QueueDriverLow = 0x090,
    QueueDriverHigh = 0x094,
    QueueDeviceLow = 0x0a0,
    QueueDeviceHigh = 0x0a4,
    ConfigGeneration = 0x0fc,
    Config = 0x100,
}

const MAGIC: u32 = 0x7472_6976; // "virt"

/// Device types this kernel knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Reserved,
    Network,
    Block,
    Console,
    Entropy,
    Unknown(u32),
}

impl From<u32> for DeviceType {
    fn from(val: u32) -> Self {
        match val {
            0 => DeviceType::Reserved,
            1 => DeviceType::Network,
            2 => DeviceType::Block,
            3 => DeviceType::Console,
            4 => DeviceType::Entropy,
            other => DeviceType::Unknown(other),
        }
    }
}

bitflags::bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

// Transport-level feature bits (64-bit feature space).
pub const F_INDIRECT_DESC: u64 = 1 << 28;
pub const F_VERSION_1: u64 = 1 << 32;
pub const F_RING_RESET: u64 = 1 << 40;

/// One MMIO slot on the virtio bus.
pub struct Transport {
    base: usize,
    irq: u32,
    device_type: DeviceType,
    version: u32,
}

impl Transport {
    /// Probe an MMIO slot. `Ok(None)` means an empty slot (placeholder
    /// device id 0); errors mean the slot is not a usable virtio device.
    pub fn probe(base: usize, irq: u32) -> Result<Option<Transport>> {
        let magic = unsafe { ptr::read_volatile((base + Reg::MagicValue as usize) as *const u32) };
        if magic != MAGIC {
            return Err(KernelError::BadFormat);
        }
        let version = unsafe { ptr::read_volatile((base + Reg::Version as usize) as *const u32) };
        if version < 2 {
            return Err(KernelError::NotSupported);
        }
        let raw_id = unsafe { ptr::read_volatile((base + Reg::DeviceId as usize) as *const u32) };
        if raw_id == 0 {
            return Ok(None);
        }
        Ok(Some(Transport {
            base,
            irq,
            device_type: DeviceType::from(raw_id),
            version,
        }))
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn read_reg(&self, reg: Reg) -> u32 {
        unsafe { ptr::read_volatile((self.base + reg as usize) as *const u32) }
    }

    pub fn write_reg(&self, reg: Reg, value: u32) {
        unsafe {
            ptr::write_volatile((self.base + reg as usize) as *mut u32, value);
        }
    }

    pub fn read_config_u32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + Reg::Config as usize + offset) as *const u32) }
    }

    /// Reset the device and wait for it to acknowledge.
    pub fn reset(&self) -> Result<()> {
        self.write_reg(Reg::Status, 0);
        for _ in 0..1000 {
            if self.read_reg(Reg::Status) == 0 {
                return Ok(());
            }
        }
        Err(KernelError::Io)
    }

    fn set_status(&self, bits: DeviceStatus) {
        let status = self.read_reg(Reg::Status);
        self.write_reg(Reg::Status, status | bits.bits());
    }

    fn read_device_features(&self) -> u64 {
        self.write_reg(Reg::DeviceFeaturesSel, 0);
        let low = self.read_reg(Reg::DeviceFeatures) as u64;
        self.write_reg(Reg::DeviceFeaturesSel, 1);
        let high = self.read_reg(Reg::DeviceFeatures) as u64;
        (high << 32) | low
    }

    fn write_driver_features(&self, features: u64) {
        self.write_reg(Reg::DriverFeaturesSel, 0);
        self.write_reg(Reg::DriverFeatures, features as u32);
        self.write_reg(Reg::DriverFeaturesSel, 1);
        self.write_reg(Reg::DriverFeatures, (features >> 32) as u32);
    }

    /// Run the status/feature dance. `required` bits must all be offered
    /// (VERSION_1 is always required); `optional` bits are taken when
    /// offered. Returns the accepted feature set.
    pub fn negotiate(&self, required: u64, optional: u64) -> Result<u64> {
        self.reset()?;
        self.set_status(DeviceStatus::ACKNOWLEDGE);
        self.set_status(DeviceStatus::DRIVER);

        let required = required | F_VERSION_1;
        let offered = self.read_device_features();
        if offered & required != required {
            crate::error!(
                "virtio: device lacks required features ({:#x} of {:#x})",
                offered & required,
                required
            );
            self.set_status(DeviceStatus::FAILED);
            return Err(KernelError::NotSupported);
        }

        let accepted = required | (offered & optional);
        self.write_driver_features(accepted);
        self.set_status(DeviceStatus::FEATURES_OK);
        if !DeviceStatus::from_bits_truncate(self.read_reg(Reg::Status))
            .contains(DeviceStatus::FEATURES_OK)
        {
            self.set_status(DeviceStatus::FAILED);
            return Err(KernelError::NotSupported);
        }
        Ok(accepted)
    }

    pub fn queue_max(&self, queue: u32) -> u32 {
        self.write_reg(Reg::QueueSel, queue);
        self.read_reg(Reg::QueueNumMax)
    }

    /// Hand the virtqueue's three regions to the device and mark the queue
    /// ready.
    pub fn attach_queue(&self, queue: u32, len: u32, desc: u64, driver: u64, device: u64) {
        self.write_reg(Reg::QueueSel, queue);
        self.write_reg(Reg::QueueNum, len);
        self.write_reg(Reg::QueueDescLow, desc as u32);
        self.write_reg(Reg::QueueDescHigh, (desc >> 32) as u32);
        self.write_reg(Reg::QueueDriverLow, driver as u32);
        self.write_reg(Reg::QueueDriverHigh, (driver >> 32) as u32);
        self.write_reg(Reg::QueueDeviceLow, device as u32);
        self.write_reg(Reg::QueueDeviceHigh, (device >> 32) as u32);
        self.write_reg(Reg::QueueReady, 1);
    }

    /// Take the queue back from the device (RING_RESET was negotiated).
    pub fn reset_queue(&self, queue: u32) {
        self.write_reg(Reg::QueueSel, queue);
        self.write_reg(Reg::QueueReady, 0);
    }

    pub fn driver_ok(&self) {
        self.set_status(DeviceStatus::DRIVER_OK);
    }

    pub fn notify(&self, queue: u32) {
        self.write_reg(Reg::QueueNotify, queue);
    }

    pub fn irq_status(&self) -> u32 {
        self.read_reg(Reg::InterruptStatus)
    }

    pub fn irq_ack(&self, status: u32) {
        self.write_reg(Reg::InterruptAck, status);
    }
}

// The MMIO window is only touched through volatile accesses.
unsafe impl Send for Transport {}
unsafe impl Sync for Transport {}

/// Probe every platform virtio slot, reporting usable devices.
pub fn discover() -> heapless::Vec<(usize, u32, DeviceType), 32> {
    let desc = crate::platform::active().virtio();
    let mut found = heapless::Vec::new();
    for slot in 0..desc.count {
        let base = desc.slot_base(slot);
        let irq = desc.slot_irq(slot);
        match Transport::probe(base, irq) {
            Ok(Some(t)) => {
                crate::info!(
                    "virtio: slot {} at {:#x} is {:?} (irq {})",
                    slot,
                    base,
                    t.device_type(),
                    irq
                );
                if found.push((base, irq, t.device_type())).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(_) => {}
        }
    }
    found
}
