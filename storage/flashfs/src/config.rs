//! Volume geometry and allocator tuning.
//!
//! The reserved prefix of the flash holds, at its tail, the metadata snapshot
//! area: the FAT image, then one block for the directory table and one block
//! for the file table. Anything before that belongs to the bootloader.

use flashfs_types::{FsError, BLOCK_SIZE, MAX_BLOCKS};

use crate::fat::BlockId;
use crate::snapshot::{FAT_SLOT_SIZE, HEADER_SIZE};

pub const DEFAULT_TOTAL_BLOCKS: u32 = 256;
pub const DEFAULT_RESERVED_BLOCKS: u32 = 4;

/// Bounded retry-with-delay applied when the allocator runs dry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra scans after the first one fails.
    pub attempts:      u32,
    /// `spin_loop` iterations between scans.
    pub backoff_spins: u32,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self { attempts: 5, backoff_spins: 10_000 };
    pub const NONE: Self = Self { attempts: 0, backoff_spins: 0 };

    pub(crate) fn backoff(&self) {
        for _ in 0..self.backoff_spins {
            core::hint::spin_loop();
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::DEFAULT }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsConfig {
    pub total_blocks:    u32,
    pub reserved_blocks: u32,
    pub retry:           RetryPolicy,
}

impl Default for FsConfig {
    fn default() -> Self { Self::new(DEFAULT_TOTAL_BLOCKS) }
}

impl FsConfig {
    pub const fn new(total_blocks: u32) -> Self {
        Self {
            total_blocks,
            reserved_blocks: DEFAULT_RESERVED_BLOCKS,
            retry: RetryPolicy::DEFAULT,
        }
    }

    /// Size the volume to a device of `bytes`, capped at `MAX_BLOCKS`.
    pub fn for_capacity(bytes: u32) -> Self {
        let blocks = (bytes / BLOCK_SIZE as u32).min(MAX_BLOCKS as u32);
        Self::new(blocks)
    }

    pub const fn with_reserved_blocks(mut self, reserved_blocks: u32) -> Self {
        self.reserved_blocks = reserved_blocks;
        self
    }

    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Blocks needed to hold the FAT image for this volume.
    pub fn fat_blocks(&self) -> u32 {
        let bytes = HEADER_SIZE + self.total_blocks as usize * FAT_SLOT_SIZE;
        bytes.div_ceil(BLOCK_SIZE) as u32
    }

    /// Check the geometry and compute where the snapshots live.
    pub fn validate(&self) -> Result<Layout, FsError> {
        if self.total_blocks as usize > MAX_BLOCKS {
            log::error!("config: {} blocks exceeds the {} block table", self.total_blocks, MAX_BLOCKS);
            return Err(FsError::InvalidArgument);
        }
        let meta_blocks = self.fat_blocks() + 2;
        if self.reserved_blocks < meta_blocks {
            log::error!(
                "config: reserved prefix of {} blocks cannot hold {} metadata blocks",
                self.reserved_blocks, meta_blocks,
            );
            return Err(FsError::InvalidArgument);
        }
        // Root directory block plus at least one content block.
        if self.total_blocks < self.reserved_blocks + 2 {
            log::error!("config: no usable blocks after the reserved prefix");
            return Err(FsError::InvalidArgument);
        }
        let file_table = self.reserved_blocks - 1;
        let dir_table = self.reserved_blocks - 2;
        let fat_start = dir_table - self.fat_blocks();
        Ok(Layout {
            total_blocks: self.total_blocks,
            fat_start,
            fat_blocks: self.fat_blocks(),
            dir_table,
            file_table,
            first_usable: self.reserved_blocks,
        })
    }
}

/// Block positions derived from a validated `FsConfig`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub total_blocks: u32,
    pub fat_start:    BlockId,
    pub fat_blocks:   u32,
    pub dir_table:    BlockId,
    pub file_table:   BlockId,
    pub first_usable: BlockId,
}

impl Layout {
    pub fn usable_blocks(&self) -> u32 { self.total_blocks - self.first_usable }

    pub fn byte_len(&self) -> u32 { self.total_blocks * BLOCK_SIZE as u32 }
}
