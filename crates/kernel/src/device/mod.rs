//! Named device registry. Devices register under a (class-name, instance)
//! pair and expose one of the capability traits below; lookups hand back
//! shared trait objects.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::io::Cntl;
use crate::klib::error::{KernelError, Result};

/// Block-addressed storage capability.
pub trait Storage: Send + Sync {
    /// Transfer granularity in bytes; fetch/store positions and lengths
    /// must be multiples of this.
    fn block_size(&self) -> u64;
    fn open(&self) -> Result<()>;
    fn close(&self);
    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;
    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize>;
    fn cntl(&self, _op: Cntl) -> Result<u64> {
        Err(KernelError::NotSupported)
    }
}

/// Byte-stream capability (UARTs, entropy sources).
pub trait Serial: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self);
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    fn send(&self, buf: &[u8]) -> Result<usize>;
}

/// Monotonic wall-clock capability.
pub trait Clock: Send + Sync {
    fn read_ns(&self) -> u64;
}

enum Device {
    Storage(Arc<dyn Storage>),
    Serial(Arc<dyn Serial>),
    Clock(Arc<dyn Clock>),
}

impl Device {
    fn class(&self) -> &'static str {
        match self {
            Device::Storage(_) => "storage",
            Device::Serial(_) => "serial",
            Device::Clock(_) => "clock",
        }
    }
}

static DEVICES: Mutex<BTreeMap<(String, u32), Device>> = Mutex::new(BTreeMap::new());

fn register(name: &str, instance: u32, dev: Device) -> Result<()> {
    let mut table = DEVICES.lock();
    let key = (name.to_string(), instance);
    if table.contains_key(&key) {
        return Err(KernelError::AlreadyExists);
    }
    crate::info!("device: registered {}{} ({})", name, instance, dev.class());
    table.insert(key, dev);
    Ok(())
}

pub fn register_storage(name: &str, instance: u32, dev: Arc<dyn Storage>) -> Result<()> {
    register(name, instance, Device::Storage(dev))
}

pub fn register_serial(name: &str, instance: u32, dev: Arc<dyn Serial>) -> Result<()> {
    register(name, instance, Device::Serial(dev))
}

pub fn register_clock(name: &str, instance: u32, dev: Arc<dyn Clock>) -> Result<()> {
    register(name, instance, Device::Clock(dev))
}

pub fn find_storage(name: &str, instance: u32) -> Result<Arc<dyn Storage>> {
    match DEVICES.lock().get(&(name.to_string(), instance)) {
        Some(Device::Storage(d)) => Ok(d.clone()),
        _ => Err(KernelError::NoSuchEntry),
    }
}

pub fn find_serial(name: &str, instance: u32) -> Result<Arc<dyn Serial>> {
    match DEVICES.lock().get(&(name.to_string(), instance)) {
        Some(Device::Serial(d)) => Ok(d.clone()),
        _ => Err(KernelError::NoSuchEntry),
    }
}

pub fn find_clock(name: &str, instance: u32) -> Result<Arc<dyn Clock>> {
    match DEVICES.lock().get(&(name.to_string(), instance)) {
        Some(Device::Clock(d)) => Ok(d.clone()),
        _ => Err(KernelError::NoSuchEntry),
    }
}

/// Enumerate registered devices for boot diagnostics.
pub fn list() -> Vec<(String, u32, &'static str)> {
    DEVICES
        .lock()
        .iter()
        .map(|((name, instance), dev)| (name.clone(), *instance, dev.class()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeClock;

    impl Clock for FakeClock {
        fn read_ns(&self) -> u64 {
            123
        }
    }

    #[test]
    fn register_and_lookup() {
        register_clock("testclk", 0, Arc::new(FakeClock)).unwrap();
        assert_eq!(find_clock("testclk", 0).unwrap().read_ns(), 123);
        assert_eq!(
            register_clock("testclk", 0, Arc::new(FakeClock)),
            Err(KernelError::AlreadyExists)
        );
        assert!(matches!(
            find_clock("testclk", 1),
            Err(KernelError::NoSuchEntry)
        ));
        assert!(matches!(
            find_storage("testclk", 0),
            Err(KernelError::NoSuchEntry)
        ));
        assert!(list().iter().any(|(n, i, c)| n == "testclk" && *i == 0 && *c == "clock"));
    }
}
