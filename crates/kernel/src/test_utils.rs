//! Test fixtures: an in-memory storage device with operation counters and
//! fault injection, plus a KTFS disk-image builder.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::device::Storage;
use crate::io::Cntl;
use crate::klib::error::{KernelError, Result};

pub const BLOCK: usize = 512;

/// RAM-backed storage with the same contract as the virtio block driver:
/// block-aligned transfers, truncation past end of device.
pub struct MockDisk {
    data: Mutex<Vec<u8>>,
    fetches: AtomicUsize,
    stores: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_store: AtomicBool,
}

impl MockDisk {
    pub fn with_blocks(blocks: usize) -> Arc<Self> {
        Self::from_image(vec![0u8; blocks * BLOCK])
    }

    pub fn from_image(image: Vec<u8>) -> Arc<Self> {
        assert_eq!(image.len() % BLOCK, 0, "image must be block-aligned");
        Arc::new(Self {
            data: Mutex::new(image),
            fetches: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
            fail_fetch: AtomicBool::new(false),
            fail_store: AtomicBool::new(false),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// The next fetch/store fails with `Io` (one-shot).
    pub fn fail_next_fetch(&self) {
        self.fail_fetch.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_store(&self) {
        self.fail_store.store(true, Ordering::SeqCst);
    }

    pub fn read_byte(&self, pos: usize) -> u8 {
        self.data.lock()[pos]
    }

    fn check_aligned(pos: u64, len: usize) -> Result<()> {
        if pos % BLOCK as u64 != 0 || len % BLOCK != 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

impl Storage for MockDisk {
    fn block_size(&self) -> u64 {
        BLOCK as u64
    }

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        Self::check_aligned(pos, buf.len())?;
        if self.fail_fetch.swap(false, Ordering::SeqCst) {
            return Err(KernelError::Io);
        }
        let data = self.data.lock();
        if pos >= data.len() as u64 {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - pos as usize);
        buf[..n].copy_from_slice(&data[pos as usize..pos as usize + n]);
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(n)
    }

    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        Self::check_aligned(pos, buf.len())?;
        if self.fail_store.swap(false, Ordering::SeqCst) {
            return Err(KernelError::Io);
        }
        let mut data = self.data.lock();
        if pos >= data.len() as u64 {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - pos as usize);
        data[pos as usize..pos as usize + n].copy_from_slice(&buf[..n]);
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(n)
    }

    fn cntl(&self, op: Cntl) -> Result<u64> {
        match op {
            Cntl::GetEnd => Ok(self.data.lock().len() as u64),
            _ => Err(KernelError::NotSupported),
        }
    }
}

/// Builds KTFS images with the standard small geometry: one inode-bitmap
/// block, one block-bitmap block, one inode-table block (8 inodes), data
/// from block 4. The root directory is inode 0.
pub struct KtfsImage {
    bytes: Vec<u8>,
}

const INODE_TABLE_BLOCK: usize = 3;
const INODE_SIZE: usize = 64;
const DIRENT_SIZE: usize = 32;

impl KtfsImage {
    pub fn new(block_count: u32) -> Self {
        let mut bytes = vec![0u8; block_count as usize * BLOCK];
        bytes[0..4].copy_from_slice(&block_count.to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes()); // inode bitmap blocks
        bytes[8..12].copy_from_slice(&1u32.to_le_bytes()); // block bitmap blocks
        bytes[12..16].copy_from_slice(&1u32.to_le_bytes()); // inode table blocks
        bytes[16..20].copy_from_slice(&0u32.to_le_bytes()); // root inode
        Self { bytes }
    }

    pub fn fill_block(&mut self, block: u32, byte: u8) -> &mut Self {
        let start = block as usize * BLOCK;
        self.bytes[start..start + BLOCK].fill(byte);
        self
    }

    pub fn write_block(&mut self, block: u32, offset: usize, data: &[u8]) -> &mut Self {
        let start = block as usize * BLOCK + offset;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        self
    }

    /// Fill a block with an array of little-endian u32 block pointers
    /// (indirect and double-indirect tables).
    pub fn write_pointer_block(&mut self, block: u32, pointers: &[u32]) -> &mut Self {
        for (i, p) in pointers.iter().enumerate() {
            let start = block as usize * BLOCK + 4 * i;
            self.bytes[start..start + 4].copy_from_slice(&p.to_le_bytes());
        }
        self
    }

    pub fn set_inode(
        &mut self,
        ino: u32,
        size: u32,
        direct: &[u32],
        indirect: u32,
        dindirect: &[u32],
    ) -> &mut Self {
        assert!(ino < 8);
        assert!(direct.len() <= 4);
        assert!(dindirect.len() <= 10);
        let base = INODE_TABLE_BLOCK * BLOCK + ino as usize * INODE_SIZE;
        self.bytes[base..base + 4].copy_from_slice(&size.to_le_bytes());
        for (i, d) in direct.iter().enumerate() {
            let at = base + 4 + 4 * i;
            self.bytes[at..at + 4].copy_from_slice(&d.to_le_bytes());
        }
        let at = base + 4 + 16;
        self.bytes[at..at + 4].copy_from_slice(&indirect.to_le_bytes());
        for (i, d) in dindirect.iter().enumerate() {
            let at = base + 4 + 20 + 4 * i;
            self.bytes[at..at + 4].copy_from_slice(&d.to_le_bytes());
        }
        self
    }

    pub fn add_dirent(&mut self, dir_block: u32, slot: usize, ino: u32, name: &str) -> &mut Self {
        assert!(name.len() <= 27);
        let base = dir_block as usize * BLOCK + slot * DIRENT_SIZE;
        self.bytes[base..base + 4].copy_from_slice(&ino.to_le_bytes());
        let name_at = base + 4;
        self.bytes[name_at..name_at + name.len()].copy_from_slice(name.as_bytes());
        self.bytes[name_at + name.len()] = 0;
        self
    }

    pub fn into_disk(self) -> Arc<MockDisk> {
        MockDisk::from_image(self.bytes)
    }
}

/// The canonical small image: root directory in block 4 with one file
/// "hello" (inode 1) whose 4 bytes in block 5 read "TEST".
pub fn seed_image() -> KtfsImage {
    let mut img = KtfsImage::new(64);
    img.set_inode(0, DIRENT_SIZE as u32, &[4], 0, &[]);
    img.set_inode(1, 4, &[5], 0, &[]);
    img.add_dirent(4, 0, 1, "hello");
    img.write_block(5, 0, b"TEST");
    img
}

