//! Write-back block cache: 64 fixed slots over one storage device, LRU
//! eviction with pinning.
//!
//! `get` pins a slot and stamps its use counter; `release` unpins and may
//! mark it dirty but deliberately leaves the stamp alone, so LRU order is
//! by most-recent acquire. A fully pinned cache answers `Busy` instead of
//! sleeping. The sleeping cache lock serializes whole operations (backing
//! I/O may suspend); the inner spin mutex only guards the slot array.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::device::Storage;
use crate::klib::error::{KernelError, Result};
use crate::thread::Lock;

pub const CACHE_SLOTS: usize = 64;

struct Slot {
    pos: u64,
    lru: u64,
    pins: u32,
    valid: bool,
    dirty: bool,
    data: Box<[u8]>,
}

struct CacheInner {
    slots: Vec<Slot>,
    use_counter: u64,
}

pub struct BlockCache {
    device: Arc<dyn Storage>,
    block_size: usize,
    lock: Lock,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    /// Build a cache over `device`, sized to its block granularity.
    pub fn new(device: Arc<dyn Storage>) -> Result<Arc<BlockCache>> {
        let block_size = device.block_size() as usize;
        if block_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let slots = (0..CACHE_SLOTS)
            .map(|_| Slot {
                pos: 0,
                lru: 0,
                pins: 0,
                valid: false,
                dirty: false,
                data: vec![0u8; block_size].into_boxed_slice(),
            })
            .collect();
        Ok(Arc::new(Self {
            device,
            block_size,
            lock: Lock::new("cache"),
            inner: Mutex::new(CacheInner {
                slots,
                use_counter: 0,
            }),
        }))
    }

    pub fn block_size(&self) -> u64 {
        self.block_size as u64
    }

    pub fn device(&self) -> &Arc<dyn Storage> {
        &self.device
    }

    /// Pin the block at `pos` (block-aligned), loading and possibly
    /// evicting on a miss. `Busy` when every slot is pinned.
    pub fn get(&self, pos: u64) -> Result<Block<'_>> {
        if pos % self.block_size as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let slot = self.lock.with(|| self.get_slot(pos))?;
        let (data, len) = {
            let mut inner = self.inner.lock();
            let s = &mut inner.slots[slot];
            (s.data.as_mut_ptr(), s.data.len())
        };
        Ok(Block {
            cache: self,
            slot,
            pos,
            data,
            len,
            released: false,
        })
    }

    fn get_slot(&self, pos: u64) -> Result<usize> {
        // Hit: pin and restamp.
        {
            let mut inner = self.inner.lock();
            if let Some(i) = inner.slots.iter().position(|s| s.valid && s.pos == pos) {
                inner.use_counter += 1;
                let stamp = inner.use_counter;
                let s = &mut inner.slots[i];
                s.pins += 1;
                s.lru = stamp;
                return Ok(i);
            }
        }

        // Miss: prefer an invalid slot, else the oldest unpinned one.
        let victim = {
            let inner = self.inner.lock();
            match inner.slots.iter().position(|s| !s.valid) {
                Some(i) => i,
                None => inner
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.pins == 0)
                    .min_by_key(|(_, s)| s.lru)
                    .map(|(i, _)| i)
                    .ok_or(KernelError::Busy)?,
            }
        };

        // Write back a dirty victim before repurposing it. On failure the
        // slot keeps its contents and the caller sees the error.
        let write_back = {
            let inner = self.inner.lock();
            let s = &inner.slots[victim];
            if s.valid && s.dirty {
                Some((s.pos, s.data.to_vec()))
            } else {
                None
            }
        };
        if let Some((old_pos, data)) = write_back {
            let n = self.device.store(old_pos, &data)?;
            if n != self.block_size {
                return Err(KernelError::Io);
            }
            self.inner.lock().slots[victim].dirty = false;
        }

        // Load the new contents. A failed load invalidates the victim.
        let mut buf = vec![0u8; self.block_size];
        let fetched = self.device.fetch(pos, &mut buf);
        let mut inner = self.inner.lock();
        match fetched {
            Ok(n) if n == self.block_size => {
                inner.use_counter += 1;
                let stamp = inner.use_counter;
                let s = &mut inner.slots[victim];
                s.data.copy_from_slice(&buf);
                s.pos = pos;
                s.valid = true;
                s.dirty = false;
                s.pins = 1;
                s.lru = stamp;
                Ok(victim)
            }
            other => {
                let s = &mut inner.slots[victim];
                s.valid = false;
                s.dirty = false;
                match other {
                    Ok(_) => Err(KernelError::Io),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn release_slot(&self, slot: usize, dirty: bool) {
        self.lock.with(|| {
            let mut inner = self.inner.lock();
            let s = &mut inner.slots[slot];
            if s.pins > 0 {
                s.pins -= 1;
            }
            s.dirty |= dirty;
            // The LRU stamp is intentionally untouched: acquire time, not
            // release time, orders eviction.
        })
    }

    /// Write every unpinned dirty slot back. Pinned dirty slots make the
    /// call report `Busy`, but the walk continues; a backing-store error
    /// aborts it.
    pub fn flush(&self) -> Result<()> {
        self.lock.with(|| {
            let mut busy = false;
            for i in 0..CACHE_SLOTS {
                let pending = {
                    let inner = self.inner.lock();
                    let s = &inner.slots[i];
                    if s.valid && s.dirty {
                        if s.pins > 0 {
                            busy = true;
                            None
                        } else {
                            Some((s.pos, s.data.to_vec()))
                        }
                    } else {
                        None
                    }
                };
                if let Some((pos, data)) = pending {
                    let n = self.device.store(pos, &data)?;
                    if n != self.block_size {
                        return Err(KernelError::Io);
                    }
                    self.inner.lock().slots[i].dirty = false;
                }
            }
            if busy {
                Err(KernelError::Busy)
            } else {
                Ok(())
            }
        })
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        let inner = self.inner.lock();
        for (i, s) in inner.slots.iter().enumerate() {
            if s.dirty && !s.valid {
                return false;
            }
            for other in &inner.slots[i + 1..] {
                if s.valid && other.valid && s.pos == other.pos {
                    return false;
                }
            }
        }
        true
    }
}

/// A pinned cache block. The data pointer stays valid while the pin is
/// held; on a cooperative single hart at most one holder mutates it
/// between suspension points. Dropping the guard releases clean; use
/// `release(true)` to mark the block dirty.
pub struct Block<'a> {
    cache: &'a BlockCache,
    slot: usize,
    pos: u64,
    data: *mut u8,
    len: usize,
    released: bool,
}

impl Block<'_> {
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn data(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data, self.len) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data, self.len) }
    }

    /// Unpin, recording whether the holder wrote the block.
    pub fn release(mut self, dirty: bool) {
        self.released = true;
        self.cache.release_slot(self.slot, dirty);
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release_slot(self.slot, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDisk;

    fn cache_over(blocks: usize) -> (Arc<BlockCache>, Arc<MockDisk>) {
        let disk = MockDisk::with_blocks(blocks);
        let cache = BlockCache::new(disk.clone() as Arc<dyn Storage>).unwrap();
        (cache, disk)
    }

    #[test]
    fn misaligned_position_is_invalid() {
        let (cache, _disk) = cache_over(8);
        assert!(matches!(cache.get(1), Err(KernelError::InvalidArgument)));
        assert!(matches!(cache.get(511), Err(KernelError::InvalidArgument)));
    }

    #[test]
    fn repeat_get_hits_same_buffer_with_one_fetch() {
        let (cache, disk) = cache_over(8);
        let b = cache.get(0).unwrap();
        let first_ptr = b.data().as_ptr();
        b.release(false);
        let b = cache.get(0).unwrap();
        assert_eq!(b.data().as_ptr(), first_ptr);
        b.release(false);
        assert_eq!(disk.fetch_count(), 1);
        assert!(cache.invariants_hold());
    }

    #[test]
    fn dirty_release_then_flush_writes_back_once() {
        let (cache, disk) = cache_over(8);
        let mut b = cache.get(0).unwrap();
        b.data_mut()[0] = 0xaa;
        b.data_mut()[1] = 0x55;
        b.release(true);
        cache.flush().unwrap();
        assert_eq!(disk.store_count(), 1);
        assert_eq!(disk.read_byte(0), 0xaa);
        assert_eq!(disk.read_byte(1), 0x55);
        assert!(cache.invariants_hold());
    }

    #[test]
    fn flush_reports_busy_while_dirty_block_is_pinned() {
        let (cache, disk) = cache_over(8);
        let hold = cache.get(0).unwrap();
        let mut b = cache.get(0).unwrap();
        b.data_mut()[0] = 0x42;
        b.release(true);

        assert_eq!(cache.flush(), Err(KernelError::Busy));
        assert_eq!(disk.store_count(), 0);

        hold.release(false);
        cache.flush().unwrap();
        assert_eq!(disk.store_count(), 1);
        assert_eq!(disk.read_byte(0), 0x42);
    }

    #[test]
    fn full_occupancy_evicts_least_recently_acquired() {
        let (cache, disk) = cache_over(CACHE_SLOTS + 2);
        for i in 0..CACHE_SLOTS as u64 {
            cache.get(i * 512).unwrap().release(false);
        }
        assert_eq!(disk.fetch_count(), CACHE_SLOTS);

        // One more block evicts position 0 (the oldest acquire)...
        cache.get(CACHE_SLOTS as u64 * 512).unwrap().release(false);
        // ...so re-reading position 0 must hit the backing device again.
        cache.get(0).unwrap().release(false);
        assert_eq!(disk.fetch_count(), CACHE_SLOTS + 2);
        assert!(cache.invariants_hold());
    }

    #[test]
    fn fully_pinned_cache_is_busy() {
        let (cache, _disk) = cache_over(CACHE_SLOTS + 1);
        let mut pinned = Vec::new();
        for i in 0..CACHE_SLOTS as u64 {
            pinned.push(cache.get(i * 512).unwrap());
        }
        assert!(matches!(
            cache.get(CACHE_SLOTS as u64 * 512),
            Err(KernelError::Busy)
        ));
        for b in pinned {
            b.release(false);
        }
    }

    #[test]
    fn failed_load_invalidates_victim() {
        let (cache, disk) = cache_over(4);
        disk.fail_next_fetch();
        assert!(matches!(cache.get(0), Err(KernelError::Io)));
        // The slot is reusable afterwards.
        let b = cache.get(0).unwrap();
        b.release(false);
        assert!(cache.invariants_hold());
    }

    #[test]
    fn write_back_error_surfaces_and_preserves_slot() {
        let (cache, disk) = cache_over(CACHE_SLOTS + 1);
        let mut b = cache.get(0).unwrap();
        b.data_mut()[0] = 0x7e;
        b.release(true);
        for i in 1..CACHE_SLOTS as u64 {
            cache.get(i * 512).unwrap().release(false);
        }

        // Evicting position 0 requires a write-back; make it fail.
        disk.fail_next_store();
        assert!(matches!(
            cache.get(CACHE_SLOTS as u64 * 512),
            Err(KernelError::Io)
        ));
        assert_eq!(disk.read_byte(0), 0);

        // Retry succeeds: write-back lands, then the new block loads.
        let b = cache.get(CACHE_SLOTS as u64 * 512).unwrap();
        b.release(false);
        assert_eq!(disk.read_byte(0), 0x7e);
    }

    #[test]
    fn drop_without_release_unpins_clean() {
        let (cache, disk) = cache_over(4);
        {
            let _b = cache.get(0).unwrap();
        }
        cache.flush().unwrap();
        assert_eq!(disk.store_count(), 0);
        // The pin is gone: the slot can be evicted normally.
        let b = cache.get(0).unwrap();
        b.release(false);
    }
}
