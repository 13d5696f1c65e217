//! Boot binary: bring the machine up, mount the volume, launch init.

#![cfg_attr(target_arch = "riscv64", no_std)]
#![cfg_attr(target_arch = "riscv64", no_main)]

#[cfg(target_arch = "riscv64")]
extern crate alloc;

#[cfg(target_arch = "riscv64")]
mod boot {
    use alloc::sync::Arc;

    use ktos_kernel::cache::BlockCache;
    use ktos_kernel::device;
    use ktos_kernel::drivers::rtc::GoldfishRtc;
    use ktos_kernel::drivers::uart::Uart16550;
    use ktos_kernel::drivers::virtio_blk::VirtioBlk;
    use ktos_kernel::drivers::virtio_rng::VirtioRng;
    use ktos_kernel::elf::{self, LoadWindow, LOAD_WINDOW_BASE, LOAD_WINDOW_END};
    use ktos_kernel::fs::KtFs;
    use ktos_kernel::io::{IoHandle, SerialIo};
    use ktos_kernel::klib::error::Result;
    use ktos_kernel::virtio::{self, DeviceType, Transport};
    use ktos_kernel::{arch, heap, intr, platform, prng, thread, info, error};

    const INIT_NAME: &str = "init";

    #[no_mangle]
    pub extern "C" fn kernel_main() -> ! {
        info!("ktos booting");
        heap::init();
        intr::init();
        thread::init();

        attach_devices();
        arch::external_irq_enable(true);
        arch::irq_enable();

        match run_init() {
            Ok(_) => {}
            Err(e) => {
                error!("boot failed: {}", e);
            }
        }
        arch::halt();
    }

    fn attach_devices() {
        if let Err(e) = GoldfishRtc::attach() {
            error!("rtc attach failed: {}", e);
        }
        let uarts = platform::active().uart().count;
        for instance in 0..uarts {
            if let Err(e) = Uart16550::attach(instance) {
                error!("uart{} attach failed: {}", instance, e);
            }
        }

        let mut blk_instance = 0;
        let mut rng_instance = 0;
        for (base, irq, kind) in virtio::discover() {
            let transport = match Transport::probe(base, irq) {
                Ok(Some(t)) => t,
                _ => continue,
            };
            let attached = match kind {
                DeviceType::Block => {
                    let r = VirtioBlk::attach(transport, blk_instance);
                    blk_instance += 1;
                    r.map(|_| ())
                }
                DeviceType::Entropy => {
                    let r = VirtioRng::attach(transport, rng_instance);
                    rng_instance += 1;
                    r.map(|_| ())
                }
                other => {
                    info!("virtio: leaving {:?} unattached", other);
                    Ok(())
                }
            };
            if let Err(e) = attached {
                error!("virtio attach failed at {:#x}: {}", base, e);
            }
        }

        for (name, instance, class) in device::list() {
            info!("  {}{}: {}", name, instance, class);
        }
    }

    /// Open storage, build the cache, mount the volume, load init, jump.
    fn run_init() -> Result<()> {
        if let Ok(entropy) = device::find_serial("viorng", 0) {
            entropy.open()?;
            if let Err(e) = prng::seed_from_entropy(&entropy) {
                error!("prng seeding failed: {}", e);
            }
        }

        let disk = device::find_storage("vioblk", 0)?;
        disk.open()?;
        let cache = BlockCache::new(disk)?;
        let fs = KtFs::mount(cache)?;

        let console_dev = device::find_serial("uart", 0)?;
        console_dev.open()?;
        let console = IoHandle::new(Arc::new(SerialIo::new(console_dev)));

        let file = fs.open(INIT_NAME)?;
        let window_len = (LOAD_WINDOW_END - LOAD_WINDOW_BASE) as usize;
        // Identity mapped, no paging: the window is physical memory.
        let mem = unsafe {
            core::slice::from_raw_parts_mut(LOAD_WINDOW_BASE as *mut u8, window_len)
        };
        let mut window = LoadWindow {
            base: LOAD_WINDOW_BASE,
            mem,
        };
        let entry = elf::load(&file, &mut window)?;
        file.close();

        info!("launching {} at {:#x}", INIT_NAME, entry);
        let entry_fn: extern "C" fn(&IoHandle) -> ! =
            unsafe { core::mem::transmute(entry as usize) };
        entry_fn(&console)
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn main() {
    // The kernel only boots on rv64; host builds exist for unit tests.
}
