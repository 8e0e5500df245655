//! Whole-entry operations: copy, move, remove and wipe.

use flashfs_types::{FsError, Name, BLOCK_SIZE};
use log::{debug, info, warn};

use crate::block_dev::BlockStore;
use crate::entry::EntryId;
use crate::fat::{BlockId, ChainLink};
use crate::fs::FlashFs;
use crate::path::{check_path, copy_name, entry_name, is_root, resolve_path};
use crate::tables::{DirIds, EntryTables, IdSource};

/// Bytes moved per device round trip when copying content.
const COPY_CHUNK: usize = 1024;

const _: () = assert!(BLOCK_SIZE % COPY_CHUNK == 0);

/// Where a copy or move lands.
struct Target {
    parent: EntryId,
    /// `None` keeps the source name.
    name:   Option<Name>,
}

impl<D: BlockStore, I: IdSource> FlashFs<D, I> {
    /// Look up the file at `path`, rejecting directories.
    fn locate_file(tables: &EntryTables<I>, path: &str) -> Result<EntryId, FsError> {
        check_path(path)?;
        if tables.find_directory(path).is_some() {
            return Err(FsError::IsDirectory);
        }
        let resolved = resolve_path(path);
        let parent = tables.find_directory(resolved.parent).ok_or(FsError::DirectoryNotFound)?;
        tables
            .find_file_entry(resolved.leaf, parent.current_id)
            .map(|f| f.unique_file_id)
            .ok_or(FsError::FileNotFound)
    }

    /// An existing directory means "into it, same name"; anything else is
    /// `parent/leaf` with a new name.
    fn locate_target(tables: &EntryTables<I>, path: &str) -> Result<Target, FsError> {
        check_path(path)?;
        if let Some(dir) = tables.find_directory(path) {
            return Ok(Target { parent: dir.current_id, name: None });
        }
        let resolved = resolve_path(path);
        let parent = tables.find_directory(resolved.parent).ok_or(FsError::DirectoryNotFound)?;
        let name = entry_name(resolved.leaf)?;
        Ok(Target { parent: parent.current_id, name: Some(name) })
    }

    // ─── Copy ──────────────────────────────────────────────────────────────────

    /// Duplicate the file at `src` into `dst`.
    ///
    /// `dst` may name a directory, in which case the source name is kept.
    /// When that name is taken, `Copy` is inserted before the extension; if
    /// the suffixed name is taken too the copy fails with `AlreadyExists`.
    pub fn copy(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.with_tables_retrying(|tables| self.copy_locked(tables, src, dst))
    }

    fn copy_locked(&self, tables: &mut EntryTables<I>, src: &str, dst: &str) -> Result<(), FsError> {
        let src_id = Self::locate_file(tables, src)?;
        let target = Self::locate_target(tables, dst)?;
        let (src_name, src_head, size) = {
            let f = tables.file(src_id).ok_or(FsError::FileNotFound)?;
            (f.name.clone(), f.start_block, f.size)
        };

        let mut name = target.name.unwrap_or(src_name);
        if tables.name_taken(&name, target.parent) {
            name = copy_name(&name)?;
            if tables.name_taken(&name, target.parent) {
                return Err(FsError::AlreadyExists);
            }
        }

        let copy = tables.create_file_entry(&name, target.parent, &self.fat)?;
        let mut head = copy.start_block;
        let moved = match src_head {
            Some(src_head) => self.transfer(src_head, size, &mut head),
            None => Ok(()),
        };
        if let Some(f) = tables.file_mut(copy.unique_file_id) {
            f.start_block = head;
            f.size = if moved.is_ok() { size } else { 0 };
        }
        if let Err(e) = moved {
            warn!("ops: copying {src:?} failed: {e}, discarding {name:?}");
            if let Err(cleanup) = self.discard_file(tables, copy.unique_file_id, false) {
                warn!("ops: discarding partial copy {name:?}: {cleanup}");
            }
            self.persist(tables)?;
            return Err(e);
        }
        self.persist_new_entries(tables, &DirIds::new(), Some(copy.unique_file_id))?;
        info!("ops: copied {src:?} to {name:?} ({size} bytes)");
        Ok(())
    }

    /// Copy `size` bytes from the chain at `src` into the chain at `dst`,
    /// growing the destination as needed.
    fn transfer(&self, src: BlockId, size: u32, dst: &mut Option<BlockId>) -> Result<(), FsError> {
        let bs = BLOCK_SIZE as u32;
        let mut chunk = [0u8; COPY_CHUNK];
        let mut from = src;
        let mut to = self.chain_block(dst, 0)?;
        let mut pos = 0u32;
        while pos < size {
            if pos > 0 && pos % bs == 0 {
                from = match self.fat.next_block(from)? {
                    ChainLink::Next(next) => next,
                    ChainLink::End => return Err(FsError::Corrupted),
                };
                to = self.next_or_extend(to)?;
            }
            let intra = (pos % bs) as usize;
            let n = (size - pos).min(COPY_CHUNK as u32) as usize;
            self.device.lock().read_at(from, intra, &mut chunk[..n])?;
            self.device.lock().patch(to, intra, &chunk[..n])?;
            pos += n as u32;
        }
        Ok(())
    }

    // ─── Move ──────────────────────────────────────────────────────────────────

    /// Relink the file at `src` under `dst`. Content blocks stay where they are.
    pub fn move_file(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let mut tables = self.tables.lock();
        let id = Self::locate_file(&tables, src)?;
        let target = Self::locate_target(&tables, dst)?;
        let old_name = tables.file(id).ok_or(FsError::FileNotFound)?.name.clone();
        let name = target.name.unwrap_or(old_name);
        let same_entry = tables.find_file_entry(&name, target.parent).map(|f| f.unique_file_id);
        if same_entry == Some(id) {
            return Ok(());
        }
        if tables.name_taken(&name, target.parent) {
            return Err(FsError::AlreadyExists);
        }

        if let Some(f) = tables.file_mut(id) {
            f.parent_id = target.parent;
            f.name = name;
        }
        self.persist(&tables)?;
        debug!("ops: moved {src:?} to {dst:?}");
        Ok(())
    }

    // ─── Remove / wipe ─────────────────────────────────────────────────────────

    /// Delete the file at `path`, releasing its blocks.
    pub fn remove(&self, path: &str) -> Result<(), FsError> {
        let mut tables = self.tables.lock();
        let id = Self::locate_file(&tables, path)?;
        let result = self.discard_file(&mut tables, id, false);
        self.persist(&tables)?;
        result
    }

    /// Like `remove`, but erases every block on the store before releasing
    /// it. Directories are wiped recursively; failures on children are
    /// logged and skipped.
    pub fn wipe(&self, path: &str) -> Result<(), FsError> {
        check_path(path)?;
        if is_root(path) {
            return Err(FsError::InvalidOperation);
        }
        let mut tables = self.tables.lock();
        if let Some(dir) = tables.find_directory(path).map(|d| d.current_id) {
            let failures = self.remove_tree(&mut tables, dir, true);
            if failures > 0 {
                warn!("ops: wiping {path:?} skipped {failures} broken entries");
            }
            self.persist(&tables)?;
            info!("ops: wiped directory {path:?}");
            return Ok(());
        }
        let id = Self::locate_file(&tables, path)?;
        let result = self.discard_file(&mut tables, id, true);
        self.persist(&tables)?;
        info!("ops: wiped {path:?}");
        result
    }

    /// Release a file's chain (erasing it first when `wipe` is set) and clear
    /// its entry. The entry is cleared even if the chain turns out broken.
    pub(crate) fn discard_file(
        &self,
        tables: &mut EntryTables<I>,
        id: EntryId,
        wipe: bool,
    ) -> Result<(), FsError> {
        let head = tables.file(id).ok_or(FsError::FileNotFound)?.start_block;
        let mut result = Ok(());
        if let Some(head) = head {
            if wipe {
                result = self.erase_chain(head);
            }
            if let Err(e) = self.fat.free_chain(head) {
                result = result.and(Err(e));
            }
        }
        tables.clear_file(id);
        result
    }

    fn erase_chain(&self, head: BlockId) -> Result<(), FsError> {
        let mut block = head;
        for _ in 0..self.layout.total_blocks {
            self.device.lock().erase_block(block)?;
            match self.fat.next_block(block)? {
                ChainLink::Next(next) => block = next,
                ChainLink::End => return Ok(()),
            }
        }
        Err(FsError::Corrupted)
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
