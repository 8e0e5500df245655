//! In-memory flash used by the unit tests.

use flashfs_types::BLOCK_SIZE;

use crate::block_dev::{BlockStore, IoError};
use crate::config::{FsConfig, RetryPolicy};
use crate::fs::FlashFs;

const ERASED: u8 = 0xFF;

/// NOR-like flash: erased bytes read as `0xFF` and every program erases the
/// sectors it touches first.
pub(crate) struct MemFlash {
    data:        Vec<u8>,
    erases:      Vec<u32>,
    fail_writes: bool,
    fail_below:  u32,
}

impl MemFlash {
    pub fn new(blocks: u32) -> Self {
        Self {
            data:        vec![ERASED; blocks as usize * BLOCK_SIZE],
            erases:      vec![0; blocks as usize],
            fail_writes: false,
            fail_below:  0,
        }
    }

    pub fn block(&self, n: u32) -> &[u8] {
        let off = n as usize * BLOCK_SIZE;
        &self.data[off..off + BLOCK_SIZE]
    }

    /// Make every subsequent program and erase fail.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Make programs and erases of blocks `0..block` fail, leaving the rest
    /// writable. `0` turns it off.
    pub fn fail_writes_below(&mut self, block: u32) {
        self.fail_below = block;
    }

    fn rejects(&self, offset: u32) -> bool {
        self.fail_writes || (offset as usize) < self.fail_below as usize * BLOCK_SIZE
    }

    pub fn erase_count(&self, n: u32) -> u32 {
        self.erases[n as usize]
    }

    fn span(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, IoError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(IoError)?;
        if end > self.data.len() {
            return Err(IoError);
        }
        Ok(start..end)
    }

    fn erase_sector(&mut self, sector: usize) {
        let off = sector * BLOCK_SIZE;
        self.data[off..off + BLOCK_SIZE].fill(ERASED);
        self.erases[sector] += 1;
    }
}

impl BlockStore for MemFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), IoError> {
        let range = self.span(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), IoError> {
        if self.rejects(offset) {
            return Err(IoError);
        }
        let range = self.span(offset, data.len())?;
        if !data.is_empty() {
            for sector in range.start / BLOCK_SIZE..=(range.end - 1) / BLOCK_SIZE {
                self.erase_sector(sector);
            }
        }
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, offset: u32) -> Result<(), IoError> {
        if self.rejects(offset) {
            return Err(IoError);
        }
        let range = self.span(offset, 1)?;
        self.erase_sector(range.start / BLOCK_SIZE);
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }
}

/// 64 blocks, 4 reserved, and a short retry so exhaustion tests stay fast.
pub(crate) fn test_config() -> FsConfig {
    FsConfig::new(64)
        .with_reserved_blocks(4)
        .with_retry(RetryPolicy { attempts: 2, backoff_spins: 10 })
}

pub(crate) fn fresh_fs() -> FlashFs<MemFlash> {
    FlashFs::format(MemFlash::new(64), test_config()).unwrap()
}
