//! Block allocation table.
//!
//! One `BlockState` per block of the volume. Files are singly linked chains
//! of `Next` slots ending in `EndOfChain`; a directory owns exactly one block
//! tagged with the `Directory` marker. The reserved prefix is never handed
//! out.
//!
//! The whole table sits behind one `spin::Mutex`. Every operation holds the
//! lock for its full duration and nothing finer grained is needed at this
//! size. The retrying `allocate` calls drop it between scans; callers that
//! already hold the entry tables use the single-scan `try_*` variants and
//! back off themselves through `BlockAllocator::back_off`.

use core::sync::atomic::{AtomicU32, Ordering};

use flashfs_types::{FsError, MAX_BLOCKS};
use log::{debug, error, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use spin::Mutex;

use crate::config::RetryPolicy;

pub type BlockId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free,
    /// System/bootloader prefix, including the metadata snapshot area.
    Reserved,
    EndOfChain,
    /// Holds a directory's metadata record; never part of a file chain.
    Directory,
    Next(BlockId),
}

/// On-flash sentinels. Any other value is the index of the next block.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
enum Marker {
    Free       = 0,
    Directory  = 0xFFFF_FFFD,
    Reserved   = 0xFFFF_FFFE,
    EndOfChain = 0xFFFF_FFFF,
}

impl BlockState {
    pub fn encode(self) -> u32 {
        match self {
            BlockState::Free       => Marker::Free.into(),
            BlockState::Reserved   => Marker::Reserved.into(),
            BlockState::EndOfChain => Marker::EndOfChain.into(),
            BlockState::Directory  => Marker::Directory.into(),
            BlockState::Next(b)    => b,
        }
    }

    pub fn decode(raw: u32) -> Self {
        match Marker::try_from(raw) {
            Ok(Marker::Free)       => BlockState::Free,
            Ok(Marker::Reserved)   => BlockState::Reserved,
            Ok(Marker::EndOfChain) => BlockState::EndOfChain,
            Ok(Marker::Directory)  => BlockState::Directory,
            Err(_)                 => BlockState::Next(raw),
        }
    }

    /// Owned by a file or directory.
    pub fn is_allocated(self) -> bool {
        !matches!(self, BlockState::Free | BlockState::Reserved)
    }
}

/// Result of following one link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainLink {
    Next(BlockId),
    End,
}

// ─── Table ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub(crate) struct Fat {
    slots:        heapless::Vec<BlockState, MAX_BLOCKS>,
    first_usable: BlockId,
}

impl Fat {
    /// Every block free except the reserved prefix.
    pub fn new(total_blocks: u32, reserved_blocks: u32) -> Self {
        let mut slots = heapless::Vec::new();
        for b in 0..total_blocks.min(MAX_BLOCKS as u32) {
            let state = if b < reserved_blocks { BlockState::Reserved } else { BlockState::Free };
            let _ = slots.push(state);
        }
        Self { slots, first_usable: reserved_blocks }
    }

    pub fn len(&self) -> u32 { self.slots.len() as u32 }

    pub fn first_usable(&self) -> BlockId { self.first_usable }

    pub fn get(&self, block: BlockId) -> Option<BlockState> {
        self.slots.get(block as usize).copied()
    }

    pub fn set(&mut self, block: BlockId, state: BlockState) {
        if let Some(slot) = self.slots.get_mut(block as usize) {
            *slot = state;
        }
    }

    fn is_free(&self, block: BlockId) -> bool {
        self.get(block) == Some(BlockState::Free)
    }

    fn take_first_free(&mut self, state: BlockState) -> Option<BlockId> {
        let block = (self.first_usable..self.len()).find(|&b| self.is_free(b))?;
        self.set(block, state);
        Some(block)
    }

    fn nearest_free(&self, hint: BlockId) -> Option<BlockId> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let hint = hint.min(len - 1);
        for distance in 0..len {
            if let Some(up) = hint.checked_add(distance) {
                if up < len && self.is_free(up) {
                    return Some(up);
                }
            }
            if let Some(down) = hint.checked_sub(distance) {
                if distance > 0 && down >= self.first_usable && self.is_free(down) {
                    return Some(down);
                }
            }
        }
        None
    }

    /// True if following links from `from` ever reaches `target`.
    fn chain_reaches(&self, from: BlockId, target: BlockId) -> bool {
        let mut cur = from;
        for _ in 0..self.len() {
            if cur == target {
                return true;
            }
            match self.get(cur) {
                Some(BlockState::Next(next)) => cur = next,
                _ => return false,
            }
        }
        // Ran the full length without terminating: an existing cycle.
        true
    }

    pub fn count(&self, state: BlockState) -> u32 {
        self.slots.iter().filter(|&&s| s == state).count() as u32
    }
}

// ─── Allocator ─────────────────────────────────────────────────────────────────

pub struct BlockAllocator {
    table:   Mutex<Fat>,
    retry:   RetryPolicy,
    retries: AtomicU32,
}

impl BlockAllocator {
    pub fn new(total_blocks: u32, reserved_blocks: u32, retry: RetryPolicy) -> Self {
        Self::from_table(Fat::new(total_blocks, reserved_blocks), retry)
    }

    pub(crate) fn from_table(table: Fat, retry: RetryPolicy) -> Self {
        Self { table: Mutex::new(table), retry, retries: AtomicU32::new(0) }
    }

    /// Lock the table directly, for snapshotting and reconciliation.
    pub(crate) fn table(&self) -> spin::MutexGuard<'_, Fat> {
        self.table.lock()
    }

    pub fn total_blocks(&self) -> u32 { self.table.lock().len() }

    pub fn state(&self, block: BlockId) -> Option<BlockState> {
        self.table.lock().get(block)
    }

    pub fn free_count(&self) -> u32 {
        self.table.lock().count(BlockState::Free)
    }

    /// Take the first free block after the reserved prefix as a one-block chain.
    pub fn allocate(&self) -> Result<BlockId, FsError> {
        self.allocate_as(BlockState::EndOfChain)
    }

    /// Take a block for a directory record.
    pub fn allocate_directory_block(&self) -> Result<BlockId, FsError> {
        self.allocate_as(BlockState::Directory)
    }

    /// `allocate` without retries: one scan of the table.
    pub fn try_allocate(&self) -> Result<BlockId, FsError> {
        self.take(BlockState::EndOfChain)
    }

    /// `allocate_directory_block` without retries.
    pub fn try_allocate_directory_block(&self) -> Result<BlockId, FsError> {
        self.take(BlockState::Directory)
    }

    fn take(&self, state: BlockState) -> Result<BlockId, FsError> {
        let block = self.table.lock().take_first_free(state).ok_or(FsError::NoFreeBlocks)?;
        debug!("fat: allocated block {block} as {state:?}");
        Ok(block)
    }

    fn allocate_as(&self, state: BlockState) -> Result<BlockId, FsError> {
        let mut attempt = 0;
        loop {
            // `take` releases the lock before we spin, so concurrent frees can land.
            match self.take(state) {
                Ok(block) => return Ok(block),
                Err(e) if attempt == self.retry.attempts => {
                    warn!("fat: allocation failed after {attempt} retries");
                    return Err(e);
                }
                Err(_) => {
                    attempt += 1;
                    self.back_off(attempt);
                }
            }
        }
    }

    /// Wait out retry `attempt` of the configured policy. Must be called with
    /// no filesystem lock held.
    pub(crate) fn back_off(&self, attempt: u32) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        warn!("fat: out of space, retry {attempt}/{}", self.retry.attempts);
        self.retry.backoff();
    }

    /// Backoff rounds taken since the allocator was created.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Prefer `hint`, otherwise the closest free block in either direction.
    pub fn allocate_near(&self, hint: BlockId) -> Result<BlockId, FsError> {
        let mut fat = self.table.lock();
        let block = fat.nearest_free(hint).ok_or(FsError::NoFreeBlocks)?;
        fat.set(block, BlockState::EndOfChain);
        debug!("fat: allocated block {block} near {hint}");
        Ok(block)
    }

    /// Release one block. Invalid requests are logged and ignored.
    pub fn free(&self, block: BlockId) {
        let mut fat = self.table.lock();
        match fat.get(block) {
            None => warn!("fat: free of out-of-range block {block}"),
            Some(BlockState::Reserved) => warn!("fat: free of reserved block {block}"),
            Some(BlockState::Free) => warn!("fat: double free of block {block}"),
            Some(_) => {
                fat.set(block, BlockState::Free);
                debug!("fat: freed block {block}");
            }
        }
    }

    /// Release every block of the chain starting at `head`.
    ///
    /// Stops at the first inconsistent slot and reports `Corrupted`; the
    /// blocks already visited stay freed.
    pub fn free_chain(&self, head: BlockId) -> Result<u32, FsError> {
        let mut fat = self.table.lock();
        let mut cur = head;
        let mut freed = 0;
        for _ in 0..fat.len() {
            match fat.get(cur) {
                Some(BlockState::Next(next)) => {
                    fat.set(cur, BlockState::Free);
                    freed += 1;
                    cur = next;
                }
                Some(BlockState::EndOfChain | BlockState::Directory) => {
                    fat.set(cur, BlockState::Free);
                    return Ok(freed + 1);
                }
                other => {
                    error!("fat: chain from {head} broken at {cur} ({other:?})");
                    return Err(FsError::Corrupted);
                }
            }
        }
        error!("fat: chain from {head} does not terminate");
        Err(FsError::Corrupted)
    }

    /// Point `prev` at `next`, promoting a free `next` to end-of-chain.
    pub fn link(&self, prev: BlockId, next: BlockId) -> Result<(), FsError> {
        let mut fat = self.table.lock();
        let prev_state = Self::linkable(&fat, prev)?;
        let next_state = Self::linkable(&fat, next)?;

        if fat.chain_reaches(next, prev) {
            error!("fat: linking {prev} -> {next} would create a cycle");
            return Err(FsError::InvalidOperation);
        }
        if let BlockState::Next(old) = prev_state {
            if old != next {
                warn!("fat: relinking {prev} from {old} to {next} orphans the old tail");
            }
        }
        fat.set(prev, BlockState::Next(next));
        if next_state == BlockState::Free {
            fat.set(next, BlockState::EndOfChain);
        }
        Ok(())
    }

    fn linkable(fat: &Fat, block: BlockId) -> Result<BlockState, FsError> {
        match fat.get(block) {
            None => Err(FsError::OutOfRange),
            Some(BlockState::Reserved | BlockState::Directory) => Err(FsError::InvalidOperation),
            Some(state) => Ok(state),
        }
    }

    /// Follow one link of a file chain.
    pub fn next_block(&self, current: BlockId) -> Result<ChainLink, FsError> {
        let fat = self.table.lock();
        match fat.get(current) {
            None => Err(FsError::OutOfRange),
            Some(BlockState::Directory) => Err(FsError::InvalidOperation),
            Some(state @ (BlockState::Free | BlockState::Reserved)) => {
                error!("fat: block {current} is {state:?} but reached through a chain");
                Err(FsError::Corrupted)
            }
            Some(BlockState::EndOfChain) => Ok(ChainLink::End),
            Some(BlockState::Next(next)) => match fat.get(next) {
                Some(BlockState::EndOfChain | BlockState::Next(_)) => Ok(ChainLink::Next(next)),
                other => {
                    error!("fat: block {current} links to {next} ({other:?})");
                    Err(FsError::Corrupted)
                }
            },
        }
    }

    /// Free every allocated block that `reachable` does not mark.
    pub(crate) fn reclaim_unreachable(&self, reachable: &[bool]) -> u32 {
        let mut fat = self.table.lock();
        let mut reclaimed = 0;
        for b in fat.first_usable()..fat.len() {
            let live = reachable.get(b as usize).copied().unwrap_or(false);
            if !live && fat.get(b).is_some_and(BlockState::is_allocated) {
                warn!("fat: reclaiming orphaned block {b}");
                fat.set(b, BlockState::Free);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::vec::Vec;

    const TOTAL: u32 = 16;
    const RESERVED: u32 = 4;

    fn allocator() -> BlockAllocator {
        BlockAllocator::new(TOTAL, RESERVED, RetryPolicy { attempts: 3, backoff_spins: 10 })
    }

    fn fill(fat: &BlockAllocator) -> Vec<BlockId> {
        let mut taken = Vec::new();
        while let Ok(b) = fat.allocate() {
            taken.push(b);
        }
        taken
    }

    // ── encoding ─────────────────────────────────────────────────────────────

    #[test]
    fn state_encoding_roundtrips_sentinels() {
        for state in [BlockState::Free, BlockState::Reserved, BlockState::EndOfChain,
                      BlockState::Directory, BlockState::Next(7)] {
            assert_eq!(BlockState::decode(state.encode()), state);
        }
        assert_eq!(BlockState::EndOfChain.encode(), 0xFFFF_FFFF);
        assert_eq!(BlockState::decode(0), BlockState::Free);
    }

    // ── allocate / free ──────────────────────────────────────────────────────

    #[test]
    fn allocate_skips_reserved_prefix() {
        let fat = allocator();
        let b = fat.allocate().unwrap();
        assert_eq!(b, RESERVED);
        assert_eq!(fat.state(b), Some(BlockState::EndOfChain));
        assert_eq!(fat.state(0), Some(BlockState::Reserved));
    }

    #[test]
    fn free_marks_block_free() {
        let fat = allocator();
        let b = fat.allocate().unwrap();
        fat.free(b);
        assert_eq!(fat.state(b), Some(BlockState::Free));
    }

    #[test]
    fn invalid_frees_change_nothing() {
        let fat = allocator();
        let before = fat.free_count();
        fat.free(1);
        fat.free(TOTAL + 3);
        fat.free(RESERVED + 2);
        assert_eq!(fat.state(1), Some(BlockState::Reserved));
        assert_eq!(fat.free_count(), before);
    }

    #[test]
    fn directory_block_is_marked() {
        let fat = allocator();
        let b = fat.allocate_directory_block().unwrap();
        assert_eq!(fat.state(b), Some(BlockState::Directory));
    }

    #[test]
    fn exhaustion_reports_no_free_blocks_without_damage() {
        let fat = allocator();
        let taken = fill(&fat);
        assert_eq!(taken.len() as u32, TOTAL - RESERVED);
        assert_eq!(fat.allocate(), Err(FsError::NoFreeBlocks));
        assert_eq!(fat.allocate_near(8), Err(FsError::NoFreeBlocks));
        assert_eq!(fat.try_allocate(), Err(FsError::NoFreeBlocks));
        for b in taken {
            assert_eq!(fat.state(b), Some(BlockState::EndOfChain));
        }
        for b in 0..RESERVED {
            assert_eq!(fat.state(b), Some(BlockState::Reserved));
        }
    }

    #[test]
    fn exhaustion_backs_off_once_per_configured_attempt() {
        let fat = allocator();
        let first = fat.allocate().unwrap();
        assert_eq!(fat.retries(), 0);
        fill(&fat);

        let before = fat.retries();
        assert_eq!(fat.allocate_directory_block(), Err(FsError::NoFreeBlocks));
        assert_eq!(fat.retries() - before, 3);
        assert_eq!(fat.try_allocate(), Err(FsError::NoFreeBlocks));
        assert_eq!(fat.allocate_near(first), Err(FsError::NoFreeBlocks));
        assert_eq!(fat.retries() - before, 3);

        fat.free(first);
        assert_eq!(fat.allocate(), Ok(first));
        assert_eq!(fat.retries() - before, 3);
    }

    #[test]
    fn retry_picks_up_concurrent_free() {
        let fat = Arc::new(BlockAllocator::new(
            TOTAL, RESERVED, RetryPolicy { attempts: 10_000, backoff_spins: 1_000 },
        ));
        let taken = fill(&fat);
        let victim = taken[3];
        let gate = Arc::new(Barrier::new(2));

        let freer = {
            let fat = Arc::clone(&fat);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait();
                fat.free(victim);
            })
        };
        gate.wait();
        assert_eq!(fat.allocate(), Ok(victim));
        freer.join().unwrap();
    }

    // ── allocate_near ────────────────────────────────────────────────────────

    #[test]
    fn allocate_near_uses_free_hint() {
        let fat = allocator();
        assert_eq!(fat.allocate_near(10), Ok(10));
        assert_eq!(fat.state(10), Some(BlockState::EndOfChain));
    }

    #[test]
    fn allocate_near_searches_both_directions() {
        let fat = allocator();
        // Occupy 10..16 so the nearest free block lies below the hint.
        for b in 10..TOTAL {
            assert_eq!(fat.allocate_near(b), Ok(b));
        }
        assert_eq!(fat.allocate_near(12), Ok(9));
        assert_eq!(fat.allocate_near(12), Ok(8));
    }

    #[test]
    fn allocate_near_never_returns_reserved() {
        let fat = allocator();
        assert_eq!(fat.allocate_near(0), Ok(RESERVED));
    }

    // ── link / next_block ────────────────────────────────────────────────────

    #[test]
    fn link_then_next_block() {
        let fat = allocator();
        let a = fat.allocate().unwrap();
        let b = fat.allocate().unwrap();
        fat.link(a, b).unwrap();
        assert_eq!(fat.next_block(a), Ok(ChainLink::Next(b)));
        assert_eq!(fat.next_block(b), Ok(ChainLink::End));
    }

    #[test]
    fn link_promotes_free_target() {
        let fat = allocator();
        let a = fat.allocate().unwrap();
        fat.link(a, 12).unwrap();
        assert_eq!(fat.state(12), Some(BlockState::EndOfChain));
    }

    #[test]
    fn link_rejects_bad_blocks() {
        let fat = allocator();
        let a = fat.allocate().unwrap();
        let d = fat.allocate_directory_block().unwrap();
        assert_eq!(fat.link(a, TOTAL), Err(FsError::OutOfRange));
        assert_eq!(fat.link(TOTAL + 1, a), Err(FsError::OutOfRange));
        assert_eq!(fat.link(a, 0), Err(FsError::InvalidOperation));
        assert_eq!(fat.link(a, d), Err(FsError::InvalidOperation));
        assert_eq!(fat.link(d, a), Err(FsError::InvalidOperation));
        assert_eq!(fat.state(a), Some(BlockState::EndOfChain));
    }

    #[test]
    fn link_rejects_cycles() {
        let fat = allocator();
        let a = fat.allocate().unwrap();
        let b = fat.allocate().unwrap();
        let c = fat.allocate().unwrap();
        fat.link(a, b).unwrap();
        fat.link(b, c).unwrap();
        assert_eq!(fat.link(c, a), Err(FsError::InvalidOperation));
        assert_eq!(fat.link(a, a), Err(FsError::InvalidOperation));
        assert_eq!(fat.next_block(c), Ok(ChainLink::End));
    }

    #[test]
    fn relink_overwrites_existing_link() {
        let fat = allocator();
        let a = fat.allocate().unwrap();
        let b = fat.allocate().unwrap();
        let c = fat.allocate().unwrap();
        fat.link(a, b).unwrap();
        fat.link(a, c).unwrap();
        assert_eq!(fat.next_block(a), Ok(ChainLink::Next(c)));
    }

    #[test]
    fn next_block_errors() {
        let fat = allocator();
        let d = fat.allocate_directory_block().unwrap();
        assert_eq!(fat.next_block(TOTAL), Err(FsError::OutOfRange));
        assert_eq!(fat.next_block(d), Err(FsError::InvalidOperation));
        assert_eq!(fat.next_block(RESERVED + 5), Err(FsError::Corrupted));
        assert_eq!(fat.next_block(0), Err(FsError::Corrupted));
        assert_eq!(fat.next_block(RESERVED - 1), Err(FsError::Corrupted));
    }

    #[test]
    fn next_block_detects_link_into_free_block() {
        let fat = allocator();
        let a = fat.allocate().unwrap();
        let b = fat.allocate().unwrap();
        fat.link(a, b).unwrap();
        fat.free(b);
        assert_eq!(fat.next_block(a), Err(FsError::Corrupted));
    }

    // ── free_chain / reclaim ─────────────────────────────────────────────────

    #[test]
    fn free_chain_releases_every_block() {
        let fat = allocator();
        let before = fat.free_count();
        let a = fat.allocate().unwrap();
        let b = fat.allocate().unwrap();
        let c = fat.allocate().unwrap();
        fat.link(a, b).unwrap();
        fat.link(b, c).unwrap();
        assert_eq!(fat.free_chain(a), Ok(3));
        assert_eq!(fat.free_count(), before);
    }

    #[test]
    fn free_chain_on_free_block_is_corruption() {
        let fat = allocator();
        assert_eq!(fat.free_chain(RESERVED + 1), Err(FsError::Corrupted));
    }

    #[test]
    fn reclaim_frees_only_unmarked_blocks() {
        let fat = allocator();
        let keep = fat.allocate().unwrap();
        let lost = fat.allocate().unwrap();
        let mut reachable = [false; TOTAL as usize];
        reachable[keep as usize] = true;
        assert_eq!(fat.reclaim_unreachable(&reachable), 1);
        assert_eq!(fat.state(keep), Some(BlockState::EndOfChain));
        assert_eq!(fat.state(lost), Some(BlockState::Free));
        assert_eq!(fat.state(0), Some(BlockState::Reserved));
    }
}
