//! VirtIO block driver (device id 2), split-transaction.
//!
//! Each request is a three-descriptor chain at (head, head+1, head+2) mod
//! queue length; chain heads advance round robin off a free cursor and are
//! never reclaimed, so the queue length bounds the in-flight window. The
//! submitting thread parks on the per-head ticket condition until the
//! interrupt handler retires the used-ring entry.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::{self, Storage};
use crate::intr::{self, IsrHandler};
use crate::io::Cntl;
use crate::klib::error::{KernelError, Result};
use crate::sync::{IntrGuard, IrqMutex};
use crate::thread::Condition;
use crate::virtio::virtqueue::{Virtqueue, DESC_F_NEXT, DESC_F_WRITE};
use crate::virtio::{self, Transport};

pub const SECTOR_SIZE: u64 = 512;

// Block-device feature bits (optional for us).
const F_BLK_SIZE: u64 = 1 << 6;
const F_TOPOLOGY: u64 = 1 << 10;

// Request types and status values.
const T_IN: u32 = 0;
const T_OUT: u32 = 1;
const S_OK: u8 = 0;

/// Upper bound on the negotiated queue length; also the ticket count the
/// heap comfortably carries.
const MAX_QUEUE_LEN: u16 = 128;
const IRQ_PRIORITY: u32 = 1;

/// Device-readable request header (descriptor 0 of every chain).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ReqHeader {
    typ: u32,
    reserved: u32,
    sector: u64,
}

/// Rendezvous between a submitting thread and the interrupt handler,
/// indexed by chain head.
struct Ticket {
    done: bool,
    status: u8,
    cond: Arc<Condition>,
}

struct BlkInner {
    vq: Virtqueue,
    /// Next chain head; advances by three per request, round robin.
    free_head: u16,
    tickets: Vec<Ticket>,
    /// Request headers, one per descriptor slot (address-stable).
    headers: Vec<ReqHeader>,
    /// Device-written status bytes, one per descriptor slot.
    statuses: Vec<u8>,
    open: bool,
}

pub struct VirtioBlk {
    transport: Transport,
    /// Capacity in bytes.
    capacity: u64,
    inner: IrqMutex<BlkInner>,
}

fn floor_pow2(n: u16) -> u16 {
    debug_assert!(n > 0);
    1 << (15 - n.leading_zeros() as u16)
}

impl VirtioBlk {
    /// Negotiate, size and attach queue 0, register the interrupt source,
    /// and enter the device registry as `vioblk<instance>`.
    pub fn attach(transport: Transport, instance: u32) -> Result<Arc<VirtioBlk>> {
        transport.negotiate(
            virtio::F_RING_RESET | virtio::F_INDIRECT_DESC,
            F_BLK_SIZE | F_TOPOLOGY,
        )?;

        let cap_low = transport.read_config_u32(0) as u64;
        let cap_high = transport.read_config_u32(4) as u64;
        let capacity = ((cap_high << 32) | cap_low) * SECTOR_SIZE;

        let max = transport.queue_max(0);
        if max == 0 {
            return Err(KernelError::NotSupported);
        }
        let len = floor_pow2((max.min(MAX_QUEUE_LEN as u32)) as u16);

        let vq = Virtqueue::new(len)?;
        let (desc, avail, used) = vq.addresses();
        transport.attach_queue(0, len as u32, desc, avail, used);
        transport.driver_ok();

        let tickets = (0..len)
            .map(|_| Ticket {
                done: false,
                status: 0xff,
                cond: Arc::new(Condition::new("vioblk-ticket")),
            })
            .collect();
        let headers = alloc::vec![
            ReqHeader {
                typ: 0,
                reserved: 0,
                sector: 0
            };
            len as usize
        ];
        let statuses = alloc::vec![0xffu8; len as usize];

        let irq = transport.irq();
        let dev = Arc::new(VirtioBlk {
            transport,
            capacity,
            inner: IrqMutex::new(BlkInner {
                vq,
                free_head: 0,
                tickets,
                headers,
                statuses,
                open: false,
            }),
        });
        intr::enable_source(irq, IRQ_PRIORITY, dev.clone())?;
        device::register_storage("vioblk", instance, dev.clone())?;
        crate::info!(
            "vioblk{}: {} MiB, queue length {}",
            instance,
            capacity / (1024 * 1024),
            len
        );
        Ok(dev)
    }

    /// Submit one request and block until the handler completes it.
    fn submit(&self, typ: u32, sector: u64, addr: u64, len: u32) -> Result<()> {
        let (head, cond) = {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(KernelError::InvalidArgument);
            }
            let qlen = inner.vq.len();
            let head = inner.free_head;
            inner.free_head = (head + 3) % qlen;
            let mid = (head + 1) % qlen;
            let tail = (head + 2) % qlen;

            inner.headers[head as usize] = ReqHeader {
                typ,
                reserved: 0,
                sector,
            };
            inner.statuses[head as usize] = 0xff;
            inner.tickets[head as usize].done = false;

            let header_addr = &inner.headers[head as usize] as *const ReqHeader as u64;
            let status_addr = &inner.statuses[head as usize] as *const u8 as u64;
            let data_flags = if typ == T_IN {
                DESC_F_WRITE | DESC_F_NEXT
            } else {
                DESC_F_NEXT
            };

            inner
                .vq
                .set_desc(head, header_addr, core::mem::size_of::<ReqHeader>() as u32, DESC_F_NEXT, mid);
            inner.vq.set_desc(mid, addr, len, data_flags, tail);
            inner.vq.set_desc(tail, status_addr, 1, DESC_F_WRITE, 0);
            inner.vq.push_avail(head);
            self.transport.notify(0);
            (head as usize, inner.tickets[head as usize].cond.clone())
        };

        // Interrupts stay masked between the predicate check and the wait
        // so the completion broadcast cannot slip between them.
        let _guard = IntrGuard::new();
        loop {
            let outcome = {
                let inner = self.inner.lock();
                let ticket = &inner.tickets[head];
                if ticket.done {
                    Some(Ok(ticket.status))
                } else if !inner.open {
                    Some(Err(KernelError::InvalidArgument))
                } else {
                    None
                }
            };
            match outcome {
                Some(Ok(S_OK)) => return Ok(()),
                Some(Ok(status)) => {
                    crate::warn!("vioblk: request failed, status {}", status);
                    return Err(KernelError::Io);
                }
                Some(Err(e)) => return Err(e),
                None => cond.wait(),
            }
        }
    }

    /// Validate alignment and clamp to the end of the device (transfers
    /// past the end truncate rather than error).
    fn transfer_len(&self, pos: u64, len: usize) -> Result<usize> {
        if pos % SECTOR_SIZE != 0 || len as u64 % SECTOR_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if pos >= self.capacity {
            return Ok(0);
        }
        Ok(core::cmp::min(len as u64, self.capacity - pos) as usize)
    }
}

impl Storage for VirtioBlk {
    fn block_size(&self) -> u64 {
        SECTOR_SIZE
    }

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
        // Waiters wake, find the device closed, and bail out.
        for cond in conds {
            cond.broadcast();
        }
    }

    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.transfer_len(pos, buf.len())?;
        if n == 0 {
            return Ok(0);
        }
        self.submit(T_IN, pos / SECTOR_SIZE, buf.as_mut_ptr() as u64, n as u32)?;
        Ok(n)
    }

    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let n = self.transfer_len(pos, buf.len())?;
        if n == 0 {
            return Ok(0);
        }
        self.submit(T_OUT, pos / SECTOR_SIZE, buf.as_ptr() as u64, n as u32)?;
        Ok(n)
    }

    fn cntl(&self, op: Cntl) -> Result<u64> {
        match op {
            Cntl::GetEnd => Ok(self.capacity),
            _ => Err(KernelError::NotSupported),
        }
    }
}

impl IsrHandler for VirtioBlk {
    fn isr(&self, _src: u32) {
        let mut inner = self.inner.lock();
        while let Some((id, _len)) = inner.vq.pop_used() {
            let head = id as usize;
            if head >= inner.tickets.len() {
                crate::warn!("vioblk: used entry for bad head {}", head);
                continue;
            }
            inner.tickets[head].status = inner.statuses[head];
            inner.tickets[head].done = true;
            let cond = inner.tickets[head].cond.clone();
            cond.broadcast();
        }
        let status = self.transport.irq_status();
        self.transport.irq_ack(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_pow2_rounds_down() {
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(2), 2);
        assert_eq!(floor_pow2(3), 2);
        assert_eq!(floor_pow2(128), 128);
        assert_eq!(floor_pow2(200), 128);
    }

    #[test]
    fn request_header_matches_wire_layout() {
        assert_eq!(core::mem::size_of::<ReqHeader>(), 16);
    }
}
