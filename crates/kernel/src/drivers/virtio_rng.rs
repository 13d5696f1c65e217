//! VirtIO entropy driver (device id 4). A read posts one device-writable
//! descriptor and blocks until the used ring advances; the device reports
//! how many bytes it produced.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::{self, Serial};
use crate::intr::{self, IsrHandler};
use crate::klib::error::{KernelError, Result};
use crate::sync::{IntrGuard, IrqMutex};
use crate::thread::Condition;
use crate::virtio::virtqueue::{Virtqueue, DESC_F_WRITE};
use crate::virtio::Transport;

const MAX_QUEUE_LEN: u16 = 64;
const IRQ_PRIORITY: u32 = 1;

struct Ticket {
    done: bool,
    len: u32,
    cond: Arc<Condition>,
}

struct RngInner {
    vq: Virtqueue,
    free_head: u16,
    tickets: Vec<Ticket>,
    open: bool,
}

pub struct VirtioRng {
    transport: Transport,
    inner: IrqMutex<RngInner>,
}

impl VirtioRng {
    pub fn attach(transport: Transport, instance: u32) -> Result<Arc<VirtioRng>> {
        transport.negotiate(0, 0)?;

        let max = transport.queue_max(0);
        if max == 0 {
            return Err(KernelError::NotSupported);
        }
        let mut len = core::cmp::min(MAX_QUEUE_LEN as u32, max) as u16;
        while !len.is_power_of_two() {
            len -= 1;
        }

        let vq = Virtqueue::new(len)?;
        let (desc, avail, used) = vq.addresses();
        transport.attach_queue(0, len as u32, desc, avail, used);
        transport.driver_ok();

        let tickets = (0..len)
            .map(|_| Ticket {
                done: false,
                len: 0,
                cond: Arc::new(Condition::new("viorng-ticket")),
            })
            .collect();

        let irq = transport.irq();
        let dev = Arc::new(VirtioRng {
            transport,
            inner: IrqMutex::new(RngInner {
                vq,
                free_head: 0,
                tickets,
                open: false,
            }),
        });
        intr::enable_source(irq, IRQ_PRIORITY, dev.clone())?;
        device::register_serial("viorng", instance, dev.clone())?;
        crate::info!("viorng{}: queue length {}", instance, len);
        Ok(dev)
    }
}

impl Serial for VirtioRng {
    fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.open {
            return Err(KernelError::Busy);
        }
        inner.open = true;
        Ok(())
    }

    fn close(&self) {
        let conds: Vec<Arc<Condition>> = {
            let mut inner = self.inner.lock();
            inner.open = false;
            inner.tickets.iter().map(|t| t.cond.clone()).collect()
        };
        self.transport.reset_queue(0);
        for cond in conds {
            cond.broadcast();
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (head, cond) = {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(KernelError::InvalidArgument);
            }
            let qlen = inner.vq.len();
            let head = inner.free_head;
            inner.free_head = (head + 1) % qlen;
            inner.tickets[head as usize].done = false;
            inner.tickets[head as usize].len = 0;
            inner
                .vq
                .set_desc(head, buf.as_mut_ptr() as u64, buf.len() as u32, DESC_F_WRITE, 0);
            inner.vq.push_avail(head);
            self.transport.notify(0);
            (head as usize, inner.tickets[head as usize].cond.clone())
        };

        let _guard = IntrGuard::new();
        loop {
            let outcome = {
                let inner = self.inner.lock();
                let ticket = &inner.tickets[head];
                if ticket.done {
                    Some(Ok(ticket.len as usize))
                } else if !inner.open {
                    Some(Err(KernelError::InvalidArgument))
                } else {
                    None
                }
            };
            match outcome {
                Some(Ok(n)) => return Ok(core::cmp::min(n, buf.len())),
                Some(Err(e)) => return Err(e),
                None => cond.wait(),
            }
        }
    }

    fn send(&self, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }
}

impl IsrHandler for VirtioRng {
    fn isr(&self, _src: u32) {
        let mut inner = self.inner.lock();
        while let Some((id, len)) = inner.vq.pop_used() {
            let head = id as usize;
            if head >= inner.tickets.len() {
                continue;
            }
            inner.tickets[head].len = len;
            inner.tickets[head].done = true;
            let cond = inner.tickets[head].cond.clone();
            cond.broadcast();
        }
        let status = self.transport.irq_status();
        self.transport.irq_ack(status);
    }
}
