// Device drivers.

pub mod rtc;
pub mod uart;
pub mod virtio_blk;
pub mod virtio_rng;
