//! Flash block store abstraction.
//!
//! The engine addresses the device by absolute byte offset inside the usable
//! flash region (`block * BLOCK_SIZE + intra`). All I/O goes through
//! `BlockStore`, so the filesystem is unit-testable with an in-memory mock.

use flashfs_types::{FsError, BLOCK_SIZE};

use crate::fat::BlockId;

// ─── Driver contract ───────────────────────────────────────────────────────────

/// The driver reported a failed read, program or erase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoError;

impl From<IoError> for FsError {
    fn from(_: IoError) -> Self { FsError::Io }
}

pub trait BlockStore {
    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), IoError>;
    /// Program `data` at `offset`. The driver erases the containing sector first.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), IoError>;
    /// Erase the sector containing `offset`.
    fn erase(&mut self, offset: u32) -> Result<(), IoError>;
    /// Size of the usable region in bytes.
    fn capacity(&self) -> u32;
}

pub const fn block_offset(block: BlockId) -> u32 {
    block * BLOCK_SIZE as u32
}

// ─── Device wrapper ────────────────────────────────────────────────────────────

/// A store plus one block of scratch space, guarded together by a single lock.
///
/// Because `write` erases a whole sector, partial block updates are done as
/// read-modify-write through the scratch buffer.
pub(crate) struct Device<D> {
    store:   D,
    scratch: [u8; BLOCK_SIZE],
}

impl<D: BlockStore> Device<D> {
    pub fn new(store: D) -> Self {
        Self { store, scratch: [0; BLOCK_SIZE] }
    }

    pub fn into_store(self) -> D { self.store }

    #[cfg(test)]
    pub fn store(&self) -> &D { &self.store }

    #[cfg(test)]
    pub fn store_mut(&mut self) -> &mut D { &mut self.store }

    /// Read `buf.len()` bytes from `block` starting at `intra`.
    pub fn read_at(&mut self, block: BlockId, intra: usize, buf: &mut [u8]) -> Result<(), FsError> {
        if intra + buf.len() > BLOCK_SIZE {
            return Err(FsError::InvalidArgument);
        }
        self.store.read(block_offset(block) + intra as u32, buf)?;
        Ok(())
    }

    /// Overwrite `data.len()` bytes of `block` at `intra`, keeping the rest.
    pub fn patch(&mut self, block: BlockId, intra: usize, data: &[u8]) -> Result<(), FsError> {
        if intra + data.len() > BLOCK_SIZE {
            return Err(FsError::InvalidArgument);
        }
        let base = block_offset(block);
        if intra == 0 && data.len() == BLOCK_SIZE {
            self.store.write(base, data)?;
            return Ok(());
        }
        self.store.read(base, &mut self.scratch)?;
        self.scratch[intra..intra + data.len()].copy_from_slice(data);
        self.store.write(base, &self.scratch)?;
        Ok(())
    }

    /// Fill a zeroed block image through `fill` and program it to `block`.
    pub fn write_with<F>(&mut self, block: BlockId, fill: F) -> Result<(), FsError>
    where
        F: FnOnce(&mut [u8; BLOCK_SIZE]),
    {
        self.scratch.fill(0);
        fill(&mut self.scratch);
        self.store.write(block_offset(block), &self.scratch)?;
        Ok(())
    }

    /// Load `block` into scratch and hand it to `parse`.
    pub fn read_with<F, R>(&mut self, block: BlockId, parse: F) -> Result<R, FsError>
    where
        F: FnOnce(&[u8; BLOCK_SIZE]) -> Result<R, FsError>,
    {
        self.store.read(block_offset(block), &mut self.scratch)?;
        parse(&self.scratch)
    }

    pub fn erase_block(&mut self, block: BlockId) -> Result<(), FsError> {
        self.store.erase(block_offset(block))?;
        Ok(())
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemFlash;

    #[test]
    fn patch_preserves_surrounding_bytes() {
        let mut dev = Device::new(MemFlash::new(4));
        dev.patch(1, 0, b"Hello, ").unwrap();
        dev.patch(1, 7, b"World!").unwrap();
        let mut buf = [0u8; 13];
        dev.read_at(1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"Hello, World!");
    }

    #[test]
    fn patch_rejects_block_overflow() {
        let mut dev = Device::new(MemFlash::new(4));
        assert_eq!(dev.patch(0, BLOCK_SIZE - 2, b"abc"), Err(FsError::InvalidArgument));
    }

    #[test]
    fn write_with_zero_fills_the_tail() {
        let mut dev = Device::new(MemFlash::new(4));
        dev.patch(2, 100, b"stale").unwrap();
        dev.write_with(2, |buf| buf[..3].copy_from_slice(b"new")).unwrap();
        let tail = dev.read_with(2, |buf| Ok(buf[100])).unwrap();
        assert_eq!(tail, 0);
        let head = dev.read_with(2, |buf| Ok([buf[0], buf[1], buf[2]])).unwrap();
        assert_eq!(&head, b"new");
    }

    #[test]
    fn erase_resets_to_ones() {
        let mut dev = Device::new(MemFlash::new(4));
        dev.patch(3, 0, &[0u8; 16]).unwrap();
        dev.erase_block(3).unwrap();
        assert!(dev.store().block(3).iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn out_of_range_read_is_io_error() {
        let mut dev = Device::new(MemFlash::new(2));
        let mut buf = [0u8; 4];
        assert_eq!(dev.read_at(5, 0, &mut buf), Err(FsError::Io));
    }
}
