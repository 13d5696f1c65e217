//! ELF64 loader for rv64 ET_EXEC images, consuming a uniform I/O handle.
//!
//! Loadable segments are placed into a fixed physical window; the caller
//! provides the backing slice for that window, so the validation and copy
//! logic is independent of where the window actually lives.

use crate::io::{Cntl, IoHandle};
use crate::klib::error::{KernelError, Result};

/// The fixed virtual window user images are linked against.
pub const LOAD_WINDOW_BASE: u64 = 0x8010_0000;
pub const LOAD_WINDOW_END: u64 = 0x8100_0000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LSB: u8 = 1;
const VERSION_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

/// Destination window: `base` is the virtual address of `mem[0]`.
pub struct LoadWindow<'a> {
    pub base: u64,
    pub mem: &'a mut [u8],
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_exact(file: &IoHandle, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.read(&mut buf[done..])?;
        if n == 0 {
            return Err(KernelError::Io);
        }
        done += n;
    }
    Ok(())
}

fn seek(file: &IoHandle, pos: u64) -> Result<()> {
    file.cntl(Cntl::SetPosition(pos))?;
    Ok(())
}

/// Validate the image and place every PT_LOAD segment, zero-filling each
/// bss tail. Returns the entry address.
pub fn load(file: &IoHandle, window: &mut LoadWindow<'_>) -> Result<u64> {
    let file_size = file.cntl(Cntl::GetEnd)?;

    let mut ehdr = [0u8; EHDR_SIZE];
    seek(file, 0)?;
    read_exact(file, &mut ehdr)?;

    if ehdr[0..4] != ELF_MAGIC
        || ehdr[4] != CLASS_64
        || ehdr[5] != DATA_LSB
        || ehdr[6] != VERSION_CURRENT
    {
        return Err(KernelError::BadFormat);
    }
    if read_u16(&ehdr, 16) != ET_EXEC || read_u16(&ehdr, 18) != EM_RISCV {
        return Err(KernelError::BadFormat);
    }
    if read_u32(&ehdr, 20) != VERSION_CURRENT as u32 {
        return Err(KernelError::BadFormat);
    }
    if read_u16(&ehdr, 52) as usize != EHDR_SIZE || read_u16(&ehdr, 54) as usize != PHDR_SIZE {
        return Err(KernelError::BadFormat);
    }

    let entry = read_u64(&ehdr, 24);
    if entry < LOAD_WINDOW_BASE || entry >= LOAD_WINDOW_END {
        return Err(KernelError::BadFormat);
    }

    let phoff = read_u64(&ehdr, 32);
    let phnum = read_u16(&ehdr, 56) as u64;
    if phnum == 0 {
        return Err(KernelError::BadFormat);
    }
    let table_end = phoff
        .checked_add(phnum * PHDR_SIZE as u64)
        .ok_or(KernelError::BadFormat)?;
    if table_end > file_size {
        return Err(KernelError::BadFormat);
    }

    let window_end = window
        .base
        .checked_add(window.mem.len() as u64)
        .ok_or(KernelError::BadFormat)?;

    for i in 0..phnum {
        let mut phdr = [0u8; PHDR_SIZE];
        seek(file, phoff + i * PHDR_SIZE as u64)?;
        read_exact(file, &mut phdr)?;

        if read_u32(&phdr, 0) != PT_LOAD {
            continue;
        }
        let offset = read_u64(&phdr, 8);
        let vaddr = read_u64(&phdr, 16);
        let file_sz = read_u64(&phdr, 32);
        let mem_sz = read_u64(&phdr, 40);

        if mem_sz < file_sz {
            return Err(KernelError::BadFormat);
        }
        let seg_end = vaddr.checked_add(mem_sz).ok_or(KernelError::BadFormat)?;
        if vaddr < window.base || seg_end > window_end || seg_end > LOAD_WINDOW_END {
            return Err(KernelError::BadFormat);
        }
        let file_end = offset.checked_add(file_sz).ok_or(KernelError::BadFormat)?;
        if file_end > file_size {
            return Err(KernelError::BadFormat);
        }

        let dest_at = (vaddr - window.base) as usize;
        let dest = &mut window.mem[dest_at..dest_at + mem_sz as usize];
        seek(file, offset)?;
        read_exact(file, &mut dest[..file_sz as usize])?;
        dest[file_sz as usize..].fill(0);
    }

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Io, IoHandle};
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// In-memory file with the cntl surface the loader relies on.
    struct MemFile {
        bytes: Vec<u8>,
        pos: Mutex<u64>,
    }

    impl MemFile {
        fn handle(bytes: Vec<u8>) -> IoHandle {
            IoHandle::new(Arc::new(MemFile {
                bytes,
                pos: Mutex::new(0),
            }))
        }
    }

    impl Io for MemFile {
        fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let mut pos = self.pos.lock();
            let remaining = self.bytes.len() as u64 - *pos;
            let n = core::cmp::min(buf.len() as u64, remaining) as usize;
            buf[..n].copy_from_slice(&self.bytes[*pos as usize..*pos as usize + n]);
            *pos += n as u64;
            Ok(n)
        }

        fn cntl(&self, op: Cntl) -> Result<u64> {
            match op {
                Cntl::GetEnd => Ok(self.bytes.len() as u64),
                Cntl::GetPosition => Ok(*self.pos.lock()),
                Cntl::SetPosition(p) => {
                    if p > self.bytes.len() as u64 {
                        return Err(KernelError::InvalidArgument);
                    }
                    *self.pos.lock() = p;
                    Ok(p)
                }
                _ => Err(KernelError::NotSupported),
            }
        }
    }

    fn put_u16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], at: usize, v: u64) {
        buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Minimal valid image: one LOAD segment holding `payload` at `vaddr`,
    /// with `bss` extra zeroed bytes.
    fn build_image(entry: u64, vaddr: u64, payload: &[u8], bss: u64) -> Vec<u8> {
        let seg_off = (EHDR_SIZE + PHDR_SIZE) as u64;
        let mut img = vec![0u8; seg_off as usize + payload.len()];

        img[0..4].copy_from_slice(&ELF_MAGIC);
        img[4] = CLASS_64;
        img[5] = DATA_LSB;
        img[6] = VERSION_CURRENT;
        put_u16(&mut img, 16, ET_EXEC);
        put_u16(&mut img, 18, EM_RISCV);
        put_u32(&mut img, 20, 1);
        put_u64(&mut img, 24, entry);
        put_u64(&mut img, 32, EHDR_SIZE as u64); // phoff
        put_u16(&mut img, 52, EHDR_SIZE as u16);
        put_u16(&mut img, 54, PHDR_SIZE as u16);
        put_u16(&mut img, 56, 1); // phnum

        let ph = EHDR_SIZE;
        put_u32(&mut img, ph, PT_LOAD);
        put_u64(&mut img, ph + 8, seg_off);
        put_u64(&mut img, ph + 16, vaddr);
        put_u64(&mut img, ph + 32, payload.len() as u64);
        put_u64(&mut img, ph + 40, payload.len() as u64 + bss);

        img[seg_off as usize..].copy_from_slice(payload);
        img
    }

    fn window(mem: &mut [u8]) -> LoadWindow<'_> {
        LoadWindow {
            base: LOAD_WINDOW_BASE,
            mem,
        }
    }

    #[test]
    fn loads_segment_and_returns_entry() {
        let entry = LOAD_WINDOW_BASE + 8;
        let payload = b"\x13\x00\x00\x00entrybytes".to_vec();
        let img = build_image(entry, LOAD_WINDOW_BASE, &payload, 0);
        let file = MemFile::handle(img);

        let mut mem = vec![0xffu8; 4096];
        let got = load(&file, &mut window(&mut mem)).unwrap();
        assert_eq!(got, entry);
        assert_eq!(&mem[..payload.len()], &payload[..]);
        // Entry dereference matches the file bytes at the right offset.
        let entry_off = (entry - LOAD_WINDOW_BASE) as usize;
        assert_eq!(mem[entry_off], payload[8]);
    }

    #[test]
    fn zero_fills_bss_tail() {
        let img = build_image(LOAD_WINDOW_BASE, LOAD_WINDOW_BASE, b"data", 12);
        let file = MemFile::handle(img);
        let mut mem = vec![0xffu8; 64];
        load(&file, &mut window(&mut mem)).unwrap();
        assert_eq!(&mem[..4], b"data");
        assert_eq!(&mem[4..16], &[0u8; 12]);
        // Bytes past the segment are untouched.
        assert_eq!(mem[16], 0xff);
    }

    #[test]
    fn rejects_bad_magic_and_wrong_machine() {
        let mut img = build_image(LOAD_WINDOW_BASE, LOAD_WINDOW_BASE, b"x", 0);
        img[0] = 0x7e;
        let file = MemFile::handle(img);
        let mut mem = vec![0u8; 64];
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::BadFormat)
        ));

        let mut img = build_image(LOAD_WINDOW_BASE, LOAD_WINDOW_BASE, b"x", 0);
        put_u16(&mut img, 18, 62); // x86-64
        let file = MemFile::handle(img);
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::BadFormat)
        ));
    }

    #[test]
    fn rejects_entry_outside_window() {
        let img = build_image(LOAD_WINDOW_BASE - 8, LOAD_WINDOW_BASE, b"x", 0);
        let file = MemFile::handle(img);
        let mut mem = vec![0u8; 64];
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::BadFormat)
        ));

        let img = build_image(LOAD_WINDOW_END, LOAD_WINDOW_BASE, b"x", 0);
        let file = MemFile::handle(img);
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::BadFormat)
        ));
    }

    #[test]
    fn rejects_memsz_smaller_than_filesz() {
        let mut img = build_image(LOAD_WINDOW_BASE, LOAD_WINDOW_BASE, b"abcd", 0);
        put_u64(&mut img, EHDR_SIZE + 40, 2); // mem_size < file_size
        let file = MemFile::handle(img);
        let mut mem = vec![0u8; 64];
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::BadFormat)
        ));
    }

    #[test]
    fn rejects_segment_outside_window() {
        let img = build_image(LOAD_WINDOW_BASE, LOAD_WINDOW_BASE + 4096, b"abcd", 0);
        let file = MemFile::handle(img);
        let mut mem = vec![0u8; 64]; // window too small for that vaddr
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::BadFormat)
        ));
    }

    #[test]
    fn rejects_file_slice_past_eof() {
        let mut img = build_image(LOAD_WINDOW_BASE, LOAD_WINDOW_BASE, b"abcd", 0);
        put_u64(&mut img, EHDR_SIZE + 32, 4096); // file_size way past EOF
        put_u64(&mut img, EHDR_SIZE + 40, 4096);
        let file = MemFile::handle(img);
        let mut mem = vec![0u8; 8192];
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::BadFormat)
        ));
    }

    #[test]
    fn truncated_header_is_io_error() {
        let img = build_image(LOAD_WINDOW_BASE, LOAD_WINDOW_BASE, b"abcd", 0);
        let file = MemFile::handle(img[..32].to_vec());
        let mut mem = vec![0u8; 64];
        assert!(matches!(
            load(&file, &mut window(&mut mem)),
            Err(KernelError::Io)
        ));
    }
}
