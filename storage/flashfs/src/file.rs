//! File handles and byte-level I/O over block chains.
//!
//! A handle is just `{file id, mode, cursor}`; the entry tables stay the
//! single source of truth for start block and size. Byte offset `pos` of a
//! file lives in chain block `pos / BLOCK_SIZE` at `pos % BLOCK_SIZE`.

use flashfs_types::{FsError, OpenMode, Whence, BLOCK_SIZE};
use log::{debug, warn};

use crate::block_dev::BlockStore;
use crate::entry::EntryId;
use crate::fat::{BlockId, ChainLink};
use crate::fs::FlashFs;
use crate::path::{check_path, resolve_path, LeafKind};
use crate::tables::{DirIds, EntryTables, IdSource};

const BS: u32 = BLOCK_SIZE as u32;

/// An open file. Not `Clone`: every handle has exactly one owner, and
/// `close` consumes it.
#[derive(Debug)]
pub struct FileHandle {
    file_id: EntryId,
    mode:    OpenMode,
    cursor:  u32,
}

impl FileHandle {
    pub fn file_id(&self) -> EntryId { self.file_id }
    pub fn mode(&self) -> OpenMode { self.mode }
    pub fn position(&self) -> u32 { self.cursor }
}

impl<D: BlockStore, I: IdSource> FlashFs<D, I> {
    /// Open `path` with a C-style mode string (`"r"`, `"w"` or `"a"`).
    pub fn open_with(&self, path: &str, mode: &str) -> Result<FileHandle, FsError> {
        self.open(path, OpenMode::parse(mode)?)
    }

    /// Open `path`.
    ///
    /// `Write` creates the file (and any missing directories) or resets an
    /// existing one to zero length. `Read` and `Append` require the file to
    /// exist; `Append` starts with the cursor at the end.
    pub fn open(&self, path: &str, mode: OpenMode) -> Result<FileHandle, FsError> {
        check_path(path)?;
        let resolved = resolve_path(path);
        if resolved.kind == LeafKind::Directory {
            return Err(FsError::IsDirectory);
        }

        let (file_id, cursor) = self.with_tables_retrying(|tables| {
            self.open_locked(tables, resolved.parent, resolved.leaf, mode)
        })?;
        debug!("file: opened {path:?} as {file_id} ({mode:?})");
        Ok(FileHandle { file_id, mode, cursor })
    }

    /// Find or create the entry for `open`. Returns its id and the starting
    /// cursor. Entries created here are persisted, or rolled back if that
    /// fails.
    fn open_locked(
        &self,
        tables: &mut EntryTables<I>,
        parent_path: &str,
        leaf: &str,
        mode: OpenMode,
    ) -> Result<(EntryId, u32), FsError> {
        let mut created = DirIds::new();
        let parent = match tables.find_directory(parent_path).map(|d| d.current_id) {
            Some(id) => id,
            None if mode == OpenMode::Write => {
                match self.create_directories_locked(tables, parent_path, &mut created) {
                    Ok(id) => id,
                    Err(e) => {
                        if !created.is_empty() {
                            self.persist_new_entries(tables, &created, None)?;
                        }
                        return Err(e);
                    }
                }
            }
            None => return Err(FsError::DirectoryNotFound),
        };
        if tables.child_directory(leaf, parent).is_some() {
            return Err(FsError::IsDirectory);
        }

        let existing = tables.find_file_entry(leaf, parent).map(|f| (f.unique_file_id, f.size));
        match (mode, existing) {
            (OpenMode::Read, Some((id, _))) => Ok((id, 0)),
            (OpenMode::Append, Some((id, size))) => Ok((id, size)),
            (OpenMode::Write, Some((id, _))) => {
                if let Some(f) = tables.file_mut(id) {
                    f.size = 0;
                }
                self.persist(tables)?;
                Ok((id, 0))
            }
            (OpenMode::Write, None) => match tables.create_file_entry(leaf, parent, &self.fat) {
                Ok(entry) => {
                    let id = entry.unique_file_id;
                    self.persist_new_entries(tables, &created, Some(id))?;
                    Ok((id, 0))
                }
                Err(e) => {
                    if !created.is_empty() {
                        self.persist_new_entries(tables, &created, None)?;
                    }
                    Err(e)
                }
            },
            (_, None) => Err(FsError::FileNotFound),
        }
    }

    /// Read up to `buf.len()` bytes at the cursor. Returns the count read,
    /// which is 0 at end of file.
    pub fn read(&self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize, FsError> {
        if !handle.mode.can_read() {
            return Err(FsError::InvalidMode);
        }
        let tables = self.tables.lock();
        let entry = tables.file(handle.file_id).ok_or(FsError::FileNotFound)?;
        let remaining = entry.size.saturating_sub(handle.cursor) as usize;
        let want = buf.len().min(remaining);
        let Some(start) = entry.start_block.filter(|_| want > 0) else {
            return Ok(0);
        };

        let Some(mut block) = self.walk(start, handle.cursor / BS)? else {
            return Ok(0);
        };
        let mut done = 0;
        loop {
            let intra = (handle.cursor % BS) as usize;
            let n = (BLOCK_SIZE - intra).min(want - done);
            self.device.lock().read_at(block, intra, &mut buf[done..done + n])?;
            done += n;
            handle.cursor += n as u32;
            if done == want {
                break;
            }
            match self.fat.next_block(block)? {
                ChainLink::Next(next) => block = next,
                ChainLink::End => break,
            }
        }
        Ok(done)
    }

    /// Follow `hops` links from `start`; `None` if the chain ends first.
    pub(crate) fn walk(&self, start: BlockId, hops: u32) -> Result<Option<BlockId>, FsError> {
        let mut block = start;
        for _ in 0..hops {
            match self.fat.next_block(block)? {
                ChainLink::Next(next) => block = next,
                ChainLink::End => return Ok(None),
            }
        }
        Ok(Some(block))
    }

    /// Write `data` at the cursor, reusing chain blocks in place and growing
    /// the chain as needed.
    ///
    /// If the volume fills up part way, the bytes already written are kept,
    /// the file size and cursor reflect them, and the allocation error is
    /// returned.
    pub fn write(&self, handle: &mut FileHandle, data: &[u8]) -> Result<usize, FsError> {
        if !handle.mode.can_write() {
            return Err(FsError::InvalidMode);
        }
        let mut written = 0;
        self.with_tables_retrying(|tables| self.write_locked(tables, handle, data, &mut written))?;
        Ok(written)
    }

    /// Write `data[*written..]` at the cursor and commit whatever made it to
    /// flash, so a later call can pick up where this one stopped.
    fn write_locked(
        &self,
        tables: &mut EntryTables<I>,
        handle: &mut FileHandle,
        data: &[u8],
        written: &mut usize,
    ) -> Result<(), FsError> {
        let entry = tables.file(handle.file_id).ok_or(FsError::FileNotFound)?;
        if *written == data.len() {
            return Ok(());
        }
        let mut start = entry.start_block;
        let old_size = entry.size;

        let mut outcome = Ok(());
        match self.chain_block(&mut start, handle.cursor / BS) {
            Err(e) => outcome = Err(e),
            Ok(mut block) => loop {
                let intra = (handle.cursor % BS) as usize;
                let n = (BLOCK_SIZE - intra).min(data.len() - *written);
                if let Err(e) = self.device.lock().patch(block, intra, &data[*written..*written + n]) {
                    outcome = Err(e);
                    break;
                }
                *written += n;
                handle.cursor += n as u32;
                if *written == data.len() {
                    break;
                }
                match self.next_or_extend(block) {
                    Ok(next) => block = next,
                    Err(e) => {
                        warn!("file: {} stopped after {} bytes: {e}", handle.file_id, *written);
                        outcome = Err(e);
                        break;
                    }
                }
            },
        }

        if let Some(f) = tables.file_mut(handle.file_id) {
            f.start_block = start;
            f.size = old_size.max(handle.cursor);
        }
        self.persist(tables)?;
        outcome
    }

    /// Block number `index` of the chain, creating the head and any missing
    /// links on the way.
    pub(crate) fn chain_block(&self, start: &mut Option<BlockId>, index: u32) -> Result<BlockId, FsError> {
        let mut block = match *start {
            Some(b) => b,
            None => {
                let b = self.fat.try_allocate()?;
                *start = Some(b);
                b
            }
        };
        for _ in 0..index {
            block = self.next_or_extend(block)?;
        }
        Ok(block)
    }

    /// The block after `tail`, allocating and linking one if `tail` ends the chain.
    pub(crate) fn next_or_extend(&self, tail: BlockId) -> Result<BlockId, FsError> {
        if let ChainLink::Next(next) = self.fat.next_block(tail)? {
            return Ok(next);
        }
        // Keep chains contiguous when possible. No retry here: the caller
        // holds the tables lock and backs off without it.
        let fresh = self.fat.allocate_near(tail + 1)?;
        if let Err(e) = self.fat.link(tail, fresh) {
            self.fat.free(fresh);
            return Err(e);
        }
        Ok(fresh)
    }

    /// Move the cursor. Targets outside `[0, size]` are rejected and leave
    /// the cursor where it was.
    pub fn seek(&self, handle: &mut FileHandle, offset: i64, whence: Whence) -> Result<u32, FsError> {
        let size = self.tables.lock().file(handle.file_id).ok_or(FsError::FileNotFound)?.size;
        let base = match whence {
            Whence::Start   => 0,
            Whence::Current => i64::from(handle.cursor),
            Whence::End     => i64::from(size),
        };
        let target = base.checked_add(offset).ok_or(FsError::InvalidArgument)?;
        if !(0..=i64::from(size)).contains(&target) {
            return Err(FsError::InvalidArgument);
        }
        handle.cursor = target as u32;
        Ok(handle.cursor)
    }

    pub fn close(&self, handle: FileHandle) {
        debug!("file: closed {} at {}", handle.file_id, handle.cursor);
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::testing::{fresh_fs, test_config, MemFlash};
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};
    use std::vec::Vec;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn write_file(fs: &FlashFs<MemFlash>, path: &str, data: &[u8]) {
        let mut h = fs.open(path, OpenMode::Write).unwrap();
        assert_eq!(fs.write(&mut h, data), Ok(data.len()));
        fs.close(h);
    }

    fn read_file(fs: &FlashFs<MemFlash>, path: &str) -> Vec<u8> {
        let mut h = fs.open(path, OpenMode::Read).unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 1000];
        loop {
            let n = fs.read(&mut h, &mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    fn chain_of(fs: &FlashFs<MemFlash>, path: &str) -> Vec<BlockId> {
        let head = {
            let tables = fs.tables.lock();
            let r = resolve_path(path);
            let parent = tables.find_directory(r.parent).unwrap().current_id;
            tables.find_file_entry(r.leaf, parent).unwrap().start_block.unwrap()
        };
        let mut blocks = std::vec![head];
        while let Ok(ChainLink::Next(n)) = fs.fat.next_block(*blocks.last().unwrap()) {
            blocks.push(n);
        }
        blocks
    }

    // ── scenarios ────────────────────────────────────────────────────────────

    #[test]
    fn write_then_read_back_with_terminator() {
        let fs = fresh_fs();
        let mut h = fs.open_with("/root/file.txt", "w").unwrap();
        assert_eq!(fs.write(&mut h, b"Hello, filesystem!\0"), Ok(19));
        fs.close(h);

        let mut h = fs.open_with("/root/file.txt", "r").unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(fs.read(&mut h, &mut buf), Ok(19));
        assert_eq!(&buf[..19], b"Hello, filesystem!\0");
        assert!(fs.stat("/root").unwrap().is_dir());
    }

    #[test]
    fn append_extends_existing_content() {
        let fs = fresh_fs();
        write_file(&fs, "/greeting", b"Hello, ");

        let mut h = fs.open("/greeting", OpenMode::Append).unwrap();
        assert_eq!(h.position(), 7);
        fs.write(&mut h, b"World!").unwrap();
        fs.close(h);

        assert_eq!(read_file(&fs, "/greeting"), b"Hello, World!");
    }

    // ── round trips ──────────────────────────────────────────────────────────

    #[test]
    fn empty_file_reads_nothing() {
        let fs = fresh_fs();
        write_file(&fs, "/empty", b"");
        assert_eq!(fs.stat("/empty").unwrap().size, 0);
        assert!(read_file(&fs, "/empty").is_empty());
    }

    #[test]
    fn exactly_one_block() {
        let fs = fresh_fs();
        let data = pattern(BLOCK_SIZE);
        write_file(&fs, "/one", &data);
        assert_eq!(chain_of(&fs, "/one").len(), 1);
        assert_eq!(read_file(&fs, "/one"), data);
    }

    #[test]
    fn spans_several_blocks() {
        let fs = fresh_fs();
        let data = pattern(3 * BLOCK_SIZE + 123);
        write_file(&fs, "/big", &data);
        let chain = chain_of(&fs, "/big");
        assert_eq!(chain.len(), 4);
        // Extensions land next to the tail on an empty volume.
        assert!(chain.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(read_file(&fs, "/big"), data);
    }

    #[test]
    fn unaligned_appends_cross_block_boundaries() {
        let fs = fresh_fs();
        let data = pattern(2 * BLOCK_SIZE + 10);
        let mut h = fs.open("/pieces", OpenMode::Write).unwrap();
        for piece in data.chunks(777) {
            fs.write(&mut h, piece).unwrap();
        }
        fs.close(h);
        assert_eq!(read_file(&fs, "/pieces"), data);
    }

    // ── modes ────────────────────────────────────────────────────────────────

    #[test]
    fn write_mode_resets_size_and_reuses_chain() {
        let fs = fresh_fs();
        write_file(&fs, "/f", &pattern(2 * BLOCK_SIZE));
        let chain = chain_of(&fs, "/f");
        let free = fs.free_blocks();

        write_file(&fs, "/f", b"short");
        assert_eq!(fs.stat("/f").unwrap().size, 5);
        assert_eq!(read_file(&fs, "/f"), b"short");
        assert_eq!(chain_of(&fs, "/f"), chain);
        assert_eq!(fs.free_blocks(), free);
    }

    #[test]
    fn handle_mode_is_enforced() {
        let fs = fresh_fs();
        write_file(&fs, "/f", b"abc");
        let mut r = fs.open("/f", OpenMode::Read).unwrap();
        assert_eq!(fs.write(&mut r, b"x"), Err(FsError::InvalidMode));
        let mut w = fs.open("/f", OpenMode::Append).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&mut w, &mut buf), Err(FsError::InvalidMode));
    }

    #[test]
    fn open_errors() {
        let fs = fresh_fs();
        fs.create_directory("/dir").unwrap();
        assert_eq!(fs.open("/missing", OpenMode::Read).map(|_| ()), Err(FsError::FileNotFound));
        assert_eq!(fs.open("/nodir/f", OpenMode::Append).map(|_| ()), Err(FsError::DirectoryNotFound));
        assert_eq!(fs.open("/dir", OpenMode::Read).map(|_| ()), Err(FsError::IsDirectory));
        assert_eq!(fs.open("/dir/", OpenMode::Write).map(|_| ()), Err(FsError::IsDirectory));
        assert_eq!(fs.open_with("/dir/f", "x").map(|_| ()), Err(FsError::InvalidMode));
        assert_eq!(fs.open("", OpenMode::Read).map(|_| ()), Err(FsError::InvalidArgument));
    }

    #[test]
    fn bare_name_lives_in_root() {
        let fs = fresh_fs();
        write_file(&fs, "plain.txt", b"root file");
        assert_eq!(read_file(&fs, "/plain.txt"), b"root file");
    }

    #[test]
    fn failed_create_leaves_no_entry() {
        let fs = fresh_fs();
        let free = fs.free_blocks();

        fs.device.lock().store_mut().fail_writes(true);
        assert_eq!(fs.open("/x", OpenMode::Write).map(|_| ()), Err(FsError::Io));
        fs.device.lock().store_mut().fail_writes(false);

        assert!(!fs.exists("/x"));
        assert_eq!(fs.free_blocks(), free);
        write_file(&fs, "/x", b"second try");
        assert_eq!(read_file(&fs, "/x"), b"second try");
    }

    #[test]
    fn failed_create_rolls_back_new_parents() {
        let fs = fresh_fs();
        let free = fs.free_blocks();

        fs.device.lock().store_mut().fail_writes_below(fs.layout().first_usable);
        assert_eq!(fs.open("/logs/today/x", OpenMode::Write).map(|_| ()), Err(FsError::Io));
        fs.device.lock().store_mut().fail_writes_below(0);

        assert!(!fs.exists("/logs"));
        assert_eq!(fs.free_blocks(), free);
    }

    #[test]
    fn handle_of_removed_file_is_stale() {
        let fs = fresh_fs();
        write_file(&fs, "/gone", b"data");
        let mut h = fs.open("/gone", OpenMode::Read).unwrap();
        fs.remove("/gone").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&mut h, &mut buf), Err(FsError::FileNotFound));
    }

    // ── seek ─────────────────────────────────────────────────────────────────

    #[test]
    fn seek_within_bounds() {
        let fs = fresh_fs();
        write_file(&fs, "/s", b"0123456789");
        let mut h = fs.open("/s", OpenMode::Read).unwrap();
        assert_eq!(fs.seek(&mut h, 4, Whence::Start), Ok(4));
        assert_eq!(fs.seek(&mut h, 2, Whence::Current), Ok(6));
        assert_eq!(fs.seek(&mut h, -3, Whence::End), Ok(7));
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(&mut h, &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"789");
        assert_eq!(fs.seek(&mut h, 0, Whence::End), Ok(10));
    }

    #[test]
    fn seek_out_of_bounds_keeps_cursor() {
        let fs = fresh_fs();
        write_file(&fs, "/s", b"0123456789");
        let mut h = fs.open("/s", OpenMode::Read).unwrap();
        fs.seek(&mut h, 5, Whence::Start).unwrap();
        assert_eq!(fs.seek(&mut h, 11, Whence::Start), Err(FsError::InvalidArgument));
        assert_eq!(fs.seek(&mut h, -6, Whence::Current), Err(FsError::InvalidArgument));
        assert_eq!(fs.seek(&mut h, 1, Whence::End), Err(FsError::InvalidArgument));
        assert_eq!(h.position(), 5);
    }

    #[test]
    fn seek_then_overwrite_in_place() {
        let fs = fresh_fs();
        let mut data = pattern(BLOCK_SIZE + 50);
        write_file(&fs, "/patch", &data);

        let mut h = fs.open("/patch", OpenMode::Append).unwrap();
        fs.seek(&mut h, BLOCK_SIZE as i64 - 2, Whence::Start).unwrap();
        fs.write(&mut h, b"XYZW").unwrap();
        fs.close(h);

        data[BLOCK_SIZE - 2..BLOCK_SIZE + 2].copy_from_slice(b"XYZW");
        assert_eq!(read_file(&fs, "/patch"), data);
        assert_eq!(fs.stat("/patch").unwrap().size, (BLOCK_SIZE + 50) as u32);
    }

    // ── exhaustion and concurrency ───────────────────────────────────────────

    #[test]
    fn partial_write_commits_what_fit() {
        let fs = fresh_fs();
        let mut h = fs.open("/fill", OpenMode::Write).unwrap();
        while fs.free_blocks() > 2 {
            fs.fat.allocate().unwrap();
        }
        let data = pattern(4 * BLOCK_SIZE);
        assert_eq!(fs.write(&mut h, &data), Err(FsError::NoFreeBlocks));
        assert_eq!(h.position(), 3 * BS);
        fs.close(h);

        assert_eq!(fs.stat("/fill").unwrap().size, 3 * BS);
        assert_eq!(read_file(&fs, "/fill"), &data[..3 * BLOCK_SIZE]);
    }

    #[test]
    fn stalled_write_does_not_hold_up_removal() {
        let config = test_config().with_retry(RetryPolicy { attempts: 20_000, backoff_spins: 10_000 });
        let fs = Arc::new(FlashFs::format(MemFlash::new(64), config).unwrap());
        write_file(&fs, "/victim", b"frees one block");
        let mut h = fs.open("/grow", OpenMode::Write).unwrap();
        fs.write(&mut h, &pattern(BLOCK_SIZE)).unwrap();
        while fs.free_blocks() > 0 {
            fs.fat.allocate().unwrap();
        }

        let gate = Arc::new(Barrier::new(2));
        let writer = {
            let fs = Arc::clone(&fs);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait();
                let result = fs.write(&mut h, b"tail");
                (result, h)
            })
        };
        gate.wait();
        thread::sleep(Duration::from_millis(5));
        let started = Instant::now();
        fs.remove("/victim").unwrap();
        let waited = started.elapsed();

        let (result, h) = writer.join().unwrap();
        assert_eq!(result, Ok(4));
        assert_eq!(h.position(), BS + 4);
        assert!(waited < Duration::from_millis(500), "remove waited {waited:?}");
        fs.close(h);
        assert_eq!(&read_file(&fs, "/grow")[BLOCK_SIZE..], b"tail");
    }

    #[test]
    fn exhausted_write_backs_off_per_attempt() {
        let fs = fresh_fs();
        let mut h = fs.open("/full", OpenMode::Write).unwrap();
        fs.write(&mut h, &pattern(BLOCK_SIZE)).unwrap();
        while fs.free_blocks() > 0 {
            fs.fat.allocate().unwrap();
        }
        let before = fs.allocator().retries();
        assert_eq!(fs.write(&mut h, b"more"), Err(FsError::NoFreeBlocks));
        assert_eq!(fs.allocator().retries() - before, test_config().retry.attempts);
        assert_eq!(fs.stat("/full").unwrap().size, BS);
    }

    #[test]
    fn concurrent_writers_get_disjoint_chains() {
        let fs = Arc::new(fresh_fs());
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let fs = Arc::clone(&fs);
                thread::spawn(move || {
                    for i in 0..3 {
                        let path = std::format!("/t{t}/f{i}");
                        let mut h = fs.open(&path, OpenMode::Write).unwrap();
                        fs.write(&mut h, &pattern(BLOCK_SIZE + t * 100 + i)).unwrap();
                        fs.close(h);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let mut seen = HashSet::new();
        for t in 0..4 {
            for i in 0..3 {
                let path = std::format!("/t{t}/f{i}");
                for b in chain_of(&fs, &path) {
                    assert!(seen.insert(b), "block {b} shared");
                }
                assert_eq!(read_file(&fs, &path), pattern(BLOCK_SIZE + t * 100 + i));
            }
        }
    }
}
