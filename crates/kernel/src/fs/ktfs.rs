//! KTFS read-only file-system reader.
//!
//! On-disk geometry (512-byte blocks, little-endian):
//! block 0 superblock; inode allocation bitmap; data-block allocation
//! bitmap; inode table; data blocks. Inodes are 64 bytes: u32 byte size,
//! 4 direct pointers, 1 single-indirect pointer, 10 double-indirect
//! pointers. Directory blocks hold 32-byte entries {u32 inode,
//! NUL-terminated name}; an entry is live iff its inode number and first
//! name byte are nonzero. The directory tree is root-flat.

use alloc::sync::Arc;
use spin::Mutex;

use crate::cache::{Block, BlockCache};
use crate::io::{Cntl, Io, IoHandle};
use crate::klib::error::{KernelError, Result};
use crate::thread::Lock;

pub const BLOCK_SIZE: u64 = 512;
pub const MAX_FILENAME_LEN: usize = 27;

const DIRECT_COUNT: usize = 4;
const DINDIRECT_COUNT: usize = 10;
const INODE_SIZE: usize = 64;
const INODES_PER_BLOCK: u64 = BLOCK_SIZE / INODE_SIZE as u64;
const DIRENT_SIZE: usize = 32;
const DIRENTS_PER_BLOCK: u64 = BLOCK_SIZE / DIRENT_SIZE as u64;
const PTRS_PER_BLOCK: u64 = BLOCK_SIZE / 4;

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[derive(Debug, Clone, Copy)]
struct SuperBlock {
    block_count: u32,
    inode_bitmap_blocks: u32,
    block_bitmap_blocks: u32,
    inode_blocks: u32,
    root_inode: u32,
}

impl SuperBlock {
    fn parse(buf: &[u8]) -> Self {
        Self {
            block_count: read_u32(buf, 0),
            inode_bitmap_blocks: read_u32(buf, 4),
            block_bitmap_blocks: read_u32(buf, 8),
            inode_blocks: read_u32(buf, 12),
            root_inode: read_u32(buf, 16),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Inode {
    size: u32,
    direct: [u32; DIRECT_COUNT],
    indirect: u32,
    dindirect: [u32; DINDIRECT_COUNT],
}

impl Inode {
    fn parse(buf: &[u8]) -> Self {
        let mut direct = [0u32; DIRECT_COUNT];
        for (i, d) in direct.iter_mut().enumerate() {
            *d = read_u32(buf, 4 + 4 * i);
        }
        let mut dindirect = [0u32; DINDIRECT_COUNT];
        for (i, d) in dindirect.iter_mut().enumerate() {
            *d = read_u32(buf, 24 + 4 * i);
        }
        Self {
            size: read_u32(buf, 0),
            direct,
            indirect: read_u32(buf, 20),
            dindirect,
        }
    }
}

#[derive(Clone, Copy)]
struct Dirent {
    inode: u32,
    name: [u8; MAX_FILENAME_LEN + 1],
}

impl Dirent {
    fn parse(buf: &[u8]) -> Self {
        let mut name = [0u8; MAX_FILENAME_LEN + 1];
        name.copy_from_slice(&buf[4..4 + MAX_FILENAME_LEN + 1]);
        Self {
            inode: read_u32(buf, 0),
            name,
        }
    }

    fn is_live(&self) -> bool {
        self.inode != 0 && self.name[0] != 0
    }

    /// Bounded comparison against the stored NUL-terminated name.
    fn name_matches(&self, target: &str) -> bool {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end] == target.as_bytes()
    }
}

fn read_block(cache: &BlockCache, block: u32) -> Result<Block<'_>> {
    cache.get(block as u64 * BLOCK_SIZE)
}

/// Read one pointer out of a pointer block.
fn load_pointer(cache: &BlockCache, block: u32, index: u64) -> Result<u32> {
    let b = read_block(cache, block)?;
    let ptr = read_u32(b.data(), index as usize * 4);
    b.release(false);
    Ok(ptr)
}

/// Map a logical block index to a physical block number. A null pointer
/// anywhere along the path means the block does not exist.
fn map_block(cache: &BlockCache, inode: &Inode, logical: u64) -> Result<u32> {
    fn nonzero(ptr: u32) -> Result<u32> {
        if ptr == 0 {
            Err(KernelError::NoSuchEntry)
        } else {
            Ok(ptr)
        }
    }

    if logical < DIRECT_COUNT as u64 {
        return nonzero(inode.direct[logical as usize]);
    }

    let logical = logical - DIRECT_COUNT as u64;
    if logical < PTRS_PER_BLOCK {
        let table = nonzero(inode.indirect)?;
        return nonzero(load_pointer(cache, table, logical)?);
    }

    let logical = logical - PTRS_PER_BLOCK;
    let root = logical / (PTRS_PER_BLOCK * PTRS_PER_BLOCK);
    if root >= DINDIRECT_COUNT as u64 {
        return Err(KernelError::NoSuchEntry);
    }
    let level1 = (logical % (PTRS_PER_BLOCK * PTRS_PER_BLOCK)) / PTRS_PER_BLOCK;
    let level2 = logical % PTRS_PER_BLOCK;

    let table = nonzero(inode.dindirect[root as usize])?;
    let table = nonzero(load_pointer(cache, table, level1)?)?;
    nonzero(load_pointer(cache, table, level2)?)
}

/// A mounted KTFS volume.
pub struct KtFs {
    cache: Arc<BlockCache>,
    sb: SuperBlock,
    inode_table_start: u32,
    data_start: u32,
    lock: Lock,
}

impl KtFs {
    /// Read and validate the superblock, derive region starts.
    pub fn mount(cache: Arc<BlockCache>) -> Result<Arc<KtFs>> {
        if cache.block_size() != BLOCK_SIZE {
            return Err(KernelError::NotSupported);
        }

        let sb = {
            let block = cache.get(0)?;
            let sb = SuperBlock::parse(block.data());
            block.release(false);
            sb
        };

        let inode_table_start = 1 + sb.inode_bitmap_blocks + sb.block_bitmap_blocks;
        let data_start = inode_table_start + sb.inode_blocks;
        if sb.block_count == 0 || data_start >= sb.block_count {
            return Err(KernelError::BadFormat);
        }
        if sb.root_inode as u64 >= sb.inode_blocks as u64 * INODES_PER_BLOCK {
            return Err(KernelError::BadFormat);
        }

        crate::info!(
            "ktfs: mounted, {} blocks, {} inode blocks, root inode {}",
            sb.block_count,
            sb.inode_blocks,
            sb.root_inode
        );
        Ok(Arc::new(KtFs {
            cache,
            sb,
            inode_table_start,
            data_start,
            lock: Lock::new("ktfs-mount"),
        }))
    }

    fn load_inode(&self, ino: u32) -> Result<Inode> {
        if ino as u64 >= self.sb.inode_blocks as u64 * INODES_PER_BLOCK {
            return Err(KernelError::NoSuchEntry);
        }
        let block_no = self.inode_table_start + ino / INODES_PER_BLOCK as u32;
        let offset = (ino as u64 % INODES_PER_BLOCK) as usize * INODE_SIZE;
        let block = read_block(&self.cache, block_no)?;
        let inode = Inode::parse(&block.data()[offset..offset + INODE_SIZE]);
        block.release(false);
        Ok(inode)
    }

    /// Open a root-directory entry by name. The reader is root-flat:
    /// leading slashes are tolerated, everything else path-like is not.
    pub fn open(&self, path: &str) -> Result<IoHandle> {
        if path.is_empty() {
            return Err(KernelError::NotSupported);
        }
        let name = path.trim_start_matches('/');
        if name.is_empty() || name == "\\" || name.contains('/') {
            return Err(KernelError::NotSupported);
        }

        self.lock.acquire();
        let result = self.lookup(name);
        self.lock.release();

        let (inode, dirent) = result?;
        Ok(IoHandle::new(Arc::new(KtfsFile {
            cache: self.cache.clone(),
            inode,
            dirent,
            size: inode.size as u64,
            pos: Mutex::new(0),
        })))
    }

    fn lookup(&self, name: &str) -> Result<(Inode, Dirent)> {
        let root = self.load_inode(self.sb.root_inode)?;
        let entries = root.size as u64 / DIRENT_SIZE as u64;
        for i in 0..entries {
            let physical = map_block(&self.cache, &root, i / DIRENTS_PER_BLOCK)?;
            let block = read_block(&self.cache, physical)?;
            let offset = (i % DIRENTS_PER_BLOCK) as usize * DIRENT_SIZE;
            let entry = Dirent::parse(&block.data()[offset..offset + DIRENT_SIZE]);
            block.release(false);
            if entry.is_live() && entry.name_matches(name) {
                let inode = self.load_inode(entry.inode)?;
                return Ok((inode, entry));
            }
        }
        Err(KernelError::NoSuchEntry)
    }

    pub fn data_start_block(&self) -> u32 {
        self.data_start
    }
}

/// An open KTFS file. The inode and directory entry are copied out of the
/// cache at open time, and the handle keeps the cache reference it needs
/// for block mapping; reads re-acquire data blocks per operation so no
/// handle pins cache entries between calls.
struct KtfsFile {
    cache: Arc<BlockCache>,
    inode: Inode,
    #[allow(dead_code)]
    dirent: Dirent,
    size: u64,
    pos: Mutex<u64>,
}

impl Io for KtfsFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        let want = core::cmp::min(buf.len() as u64, self.size - *pos) as usize;
        let mut done = 0usize;

        while done < want {
            let logical = *pos / BLOCK_SIZE;
            let offset = (*pos % BLOCK_SIZE) as usize;
            let chunk = core::cmp::min(BLOCK_SIZE as usize - offset, want - done);

            // Mid-stream errors surface only when nothing was delivered;
            // otherwise the short count stands.
            let physical = match map_block(&self.cache, &self.inode, logical) {
                Ok(p) => p,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            let block = match read_block(&self.cache, physical) {
                Ok(b) => b,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            buf[done..done + chunk].copy_from_slice(&block.data()[offset..offset + chunk]);
            block.release(false);

            *pos += chunk as u64;
            done += chunk;
        }
        Ok(done)
    }

    fn cntl(&self, op: Cntl) -> Result<u64> {
        match op {
            Cntl::GetEnd => Ok(self.size),
            Cntl::GetPosition => Ok(*self.pos.lock()),
            Cntl::SetPosition(new_pos) => {
                if new_pos > self.size {
                    return Err(KernelError::InvalidArgument);
                }
                *self.pos.lock() = new_pos;
                Ok(new_pos)
            }
            // Read-only volume: no growing, no mapping.
            Cntl::SetEnd(_) | Cntl::Mmap => Err(KernelError::NotSupported),
        }
    }
}
