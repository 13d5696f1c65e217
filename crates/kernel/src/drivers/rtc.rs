//! Goldfish RTC: a read-only 64-bit nanosecond clock. Reading the low
//! word latches the high word.

use alloc::sync::Arc;

use crate::device::{self, Clock};
use crate::klib::error::Result;
use crate::platform;

const REG_TIME_LOW: usize = 0x00;
const REG_TIME_HIGH: usize = 0x04;

pub struct GoldfishRtc {
    base: usize,
}

impl GoldfishRtc {
    pub fn attach() -> Result<Arc<GoldfishRtc>> {
        let desc = platform::active().rtc();
        let rtc = Arc::new(GoldfishRtc { base: desc.base });
        device::register_clock("rtc", 0, rtc.clone())?;
        Ok(rtc)
    }
}

impl Clock for GoldfishRtc {
    fn read_ns(&self) -> u64 {
        unsafe {
            let low = core::ptr::read_volatile((self.base + REG_TIME_LOW) as *const u32) as u64;
            let high = core::ptr::read_volatile((self.base + REG_TIME_HIGH) as *const u32) as u64;
            (high << 32) | low
        }
    }
}
