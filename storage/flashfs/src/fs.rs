//! The filesystem object: volume lifecycle, metadata persistence and the
//! directory operations.
//!
//! Locks are always taken in the order entry tables → allocation table →
//! device. The tables lock is the coarse coordinator for every metadata
//! change; the allocator and device locks are held only for single calls.
//! Operations that run out of space give the tables lock back before they
//! back off, so a concurrent removal can free what they are waiting for.

use flashfs_types::{
    DirListing, EntryKind, FsError, Listing, MAX_BLOCKS, MAX_DIRECTORIES, MAX_FILES,
};
use log::{debug, error, info, warn};
use spin::Mutex;

use crate::block_dev::{BlockStore, Device};
use crate::config::{FsConfig, Layout};
use crate::entry::{DirectoryEntry, EntryId, FileEntry};
use crate::fat::{BlockAllocator, BlockId, BlockState, ChainLink, Fat};
use crate::path::{check_path, is_root, resolve_path, segments};
use crate::snapshot;
use crate::tables::{DirIds, EntryTables, IdSource, SequentialIds};

pub struct FlashFs<D, I = SequentialIds> {
    pub(crate) config: FsConfig,
    pub(crate) layout: Layout,
    pub(crate) tables: Mutex<EntryTables<I>>,
    pub(crate) fat:    BlockAllocator,
    pub(crate) device: Mutex<Device<D>>,
}

impl<D: BlockStore> FlashFs<D> {
    /// Create an empty volume on `store`, erasing any previous metadata.
    pub fn format(store: D, config: FsConfig) -> Result<Self, FsError> {
        Self::format_with_ids(store, config, SequentialIds::default())
    }

    /// Restore the volume previously written to `store`.
    pub fn mount(store: D, config: FsConfig) -> Result<Self, FsError> {
        Self::mount_with_ids(store, config, SequentialIds::default())
    }
}

impl<D: BlockStore, I: IdSource> FlashFs<D, I> {
    fn check_geometry(store: &D, config: &FsConfig) -> Result<Layout, FsError> {
        let layout = config.validate()?;
        if store.capacity() < layout.byte_len() {
            error!(
                "flashfs: volume needs {} bytes but the store holds {}",
                layout.byte_len(), store.capacity(),
            );
            return Err(FsError::InvalidArgument);
        }
        Ok(layout)
    }

    pub fn format_with_ids(store: D, config: FsConfig, ids: I) -> Result<Self, FsError> {
        let layout = Self::check_geometry(&store, &config)?;
        let fs = Self {
            config,
            layout,
            tables: Mutex::new(EntryTables::new(ids)),
            fat: BlockAllocator::new(config.total_blocks, config.reserved_blocks, config.retry),
            device: Mutex::new(Device::new(store)),
        };
        {
            let mut tables = fs.tables.lock();
            tables.create_root(&fs.fat, &fs.device)?;
            fs.persist(&tables)?;
        }
        info!(
            "flashfs: formatted {} blocks ({} reserved, {} usable)",
            layout.total_blocks, config.reserved_blocks, layout.usable_blocks(),
        );
        Ok(fs)
    }

    pub fn mount_with_ids(store: D, config: FsConfig, ids: I) -> Result<Self, FsError> {
        let layout = Self::check_geometry(&store, &config)?;
        let mut device = Device::new(store);

        let mut fat = Fat::new(config.total_blocks, config.reserved_blocks);
        for i in 0..layout.fat_blocks {
            device.read_with(layout.fat_start + i, |buf| snapshot::decode_fat_block(&mut fat, i, buf))?;
        }
        for b in 0..fat.len() {
            let reserved = fat.get(b) == Some(BlockState::Reserved);
            if reserved != (b < layout.first_usable) {
                error!("flashfs: block {b} has the wrong reservation state");
                return Err(FsError::Corrupted);
            }
        }
        let dirs = device.read_with(layout.dir_table, |buf| {
            snapshot::decode_table::<DirectoryEntry, MAX_DIRECTORIES>(buf)
        })?;
        let files = device.read_with(layout.file_table, |buf| {
            snapshot::decode_table::<FileEntry, MAX_FILES>(buf)
        })?;

        let fs = Self {
            config,
            layout,
            tables: Mutex::new(EntryTables::from_parts(dirs, files, ids)),
            fat: BlockAllocator::from_table(fat, config.retry),
            device: Mutex::new(device),
        };
        fs.reconcile()?;
        let (dirs, files) = {
            let tables = fs.tables.lock();
            (tables.directories().count(), tables.files().count())
        };
        info!(
            "flashfs: mounted {dirs} directories, {files} files, {} free blocks",
            fs.fat.free_count(),
        );
        Ok(fs)
    }

    /// Check the restored tables against the FAT and release orphaned blocks.
    fn reconcile(&self) -> Result<(), FsError> {
        let tables = self.tables.lock();
        let roots = tables.directories().filter(|d| d.is_root()).count();
        if roots != 1 {
            error!("flashfs: expected one root directory, found {roots}");
            return Err(FsError::Corrupted);
        }

        let mut reachable = [false; MAX_BLOCKS];
        for dir in tables.directories() {
            if !dir.is_root() {
                Self::check_ancestry(&tables, dir)?;
            }
            if self.fat.state(dir.start_block) != Some(BlockState::Directory) {
                error!("flashfs: directory {:?} block {} is not marked", dir.name, dir.start_block);
                return Err(FsError::Corrupted);
            }
            let seen = reachable.get_mut(dir.start_block as usize).ok_or(FsError::OutOfRange)?;
            if *seen {
                error!("flashfs: directory {:?} shares block {}", dir.name, dir.start_block);
                return Err(FsError::Corrupted);
            }
            *seen = true;
        }
        for file in tables.files() {
            if tables.directory(file.parent_id).is_none() {
                error!("flashfs: file {:?} has no parent {}", file.name, file.parent_id);
                return Err(FsError::Corrupted);
            }
            let Some(head) = file.start_block else { continue };
            self.mark_chain(head, &mut reachable)?;
        }

        let reclaimed = self.fat.reclaim_unreachable(&reachable);
        if reclaimed > 0 {
            warn!("flashfs: reclaimed {reclaimed} orphaned blocks");
        }
        Ok(())
    }

    /// Follow parent links from `dir` up to the root.
    fn check_ancestry(tables: &EntryTables<I>, dir: &DirectoryEntry) -> Result<(), FsError> {
        let mut cur = dir.parent_id;
        for _ in 0..MAX_DIRECTORIES {
            let Some(parent) = tables.directory(cur) else {
                error!("flashfs: directory {:?} has no ancestor {cur}", dir.name);
                return Err(FsError::Corrupted);
            };
            if parent.is_root() {
                return Ok(());
            }
            cur = parent.parent_id;
        }
        error!("flashfs: directory {:?} is cut off from the root", dir.name);
        Err(FsError::Corrupted)
    }

    fn mark_chain(&self, head: BlockId, reachable: &mut [bool]) -> Result<(), FsError> {
        let mut cur = head;
        for _ in 0..self.layout.total_blocks {
            let seen = reachable.get_mut(cur as usize).ok_or(FsError::OutOfRange)?;
            if *seen {
                error!("flashfs: block {cur} is shared between chains");
                return Err(FsError::Corrupted);
            }
            *seen = true;
            match self.fat.next_block(cur)? {
                ChainLink::Next(next) => cur = next,
                ChainLink::End => return Ok(()),
            }
        }
        Err(FsError::Corrupted)
    }

    /// Write the FAT and both entry tables to their snapshot blocks.
    pub(crate) fn persist(&self, tables: &EntryTables<I>) -> Result<(), FsError> {
        let layout = self.layout;
        {
            let fat = self.fat.table();
            let mut device = self.device.lock();
            for i in 0..layout.fat_blocks {
                device.write_with(layout.fat_start + i, |buf| snapshot::encode_fat_block(&fat, i, buf))?;
            }
        }
        let mut device = self.device.lock();
        device.write_with(layout.dir_table, |buf| snapshot::encode_table(tables.directories(), buf))?;
        device.write_with(layout.file_table, |buf| snapshot::encode_table(tables.files(), buf))?;
        debug!("flashfs: metadata persisted");
        Ok(())
    }

    /// Persist after creating `dirs` (oldest first) and possibly `file`. If
    /// the snapshot cannot be written, those entries are rolled back and the
    /// write error is returned.
    pub(crate) fn persist_new_entries(
        &self,
        tables: &mut EntryTables<I>,
        dirs: &DirIds,
        file: Option<EntryId>,
    ) -> Result<(), FsError> {
        let Err(e) = self.persist(tables) else {
            return Ok(());
        };
        warn!("flashfs: snapshot failed ({e}), rolling back new entries");
        if let Some(id) = file {
            if let Err(cleanup) = self.discard_file(tables, id, false) {
                warn!("flashfs: rolling back file {id}: {cleanup}");
            }
        }
        for &id in dirs.iter().rev() {
            if let Some(block) = tables.directory(id).map(|d| d.start_block) {
                self.fat.free(block);
            }
            tables.clear_directory(id);
        }
        Err(e)
    }

    /// Run `op` under the tables lock, running it again while it reports
    /// `NoFreeBlocks` or `NoSpace` and retries remain. The lock is released
    /// during each backoff, so `op` starts over from a fresh view of the
    /// tables and must leave them consistent whenever it fails.
    pub(crate) fn with_tables_retrying<R>(
        &self,
        mut op: impl FnMut(&mut EntryTables<I>) -> Result<R, FsError>,
    ) -> Result<R, FsError> {
        let attempts = self.config.retry.attempts;
        let mut attempt = 0;
        loop {
            let mut tables = self.tables.lock();
            let result = op(&mut *tables);
            drop(tables);
            match result {
                Err(FsError::NoFreeBlocks | FsError::NoSpace) if attempt < attempts => {
                    attempt += 1;
                    self.fat.back_off(attempt);
                }
                other => return other,
            }
        }
    }

    /// Flush all metadata to flash.
    pub fn sync(&self) -> Result<(), FsError> {
        let tables = self.tables.lock();
        self.persist(&tables)
    }

    pub fn config(&self) -> &FsConfig { &self.config }

    pub fn layout(&self) -> &Layout { &self.layout }

    pub fn allocator(&self) -> &BlockAllocator { &self.fat }

    pub fn free_blocks(&self) -> u32 { self.fat.free_count() }

    /// Give back the underlying store, e.g. to mount it again.
    pub fn into_store(self) -> D {
        self.device.into_inner().into_store()
    }

    // ─── Directories ───────────────────────────────────────────────────────────

    /// Create `path` and any missing ancestors. Existing directories are kept.
    ///
    /// Directories made before a failure stay; if the snapshot itself cannot
    /// be written, none of the new ones do.
    pub fn create_directory(&self, path: &str) -> Result<(), FsError> {
        check_path(path)?;
        self.with_tables_retrying(|tables| {
            let mut created = DirIds::new();
            let result = self.create_directories_locked(tables, path, &mut created);
            if !created.is_empty() {
                self.persist_new_entries(tables, &created, None)?;
            }
            result.map(|_| ())
        })
    }

    /// Walk `path` from the root, creating each missing segment and noting
    /// it in `created`. Returns the id of the final directory.
    pub(crate) fn create_directories_locked(
        &self,
        tables: &mut EntryTables<I>,
        path: &str,
        created: &mut DirIds,
    ) -> Result<EntryId, FsError> {
        let mut parent = tables.root().ok_or(FsError::Corrupted)?.current_id;
        for segment in segments(path) {
            if let Some(existing) = tables.child_directory(segment, parent) {
                parent = existing.current_id;
                continue;
            }
            if tables.find_file_entry(segment, parent).is_some() {
                return Err(FsError::AlreadyExists);
            }
            parent = tables.create_directory(segment, parent, &self.fat, &self.device)?.current_id;
            let _ = created.push(parent);
        }
        Ok(parent)
    }

    /// Delete a directory and everything below it.
    ///
    /// Children that fail to delete are logged and skipped; the directory
    /// itself is cleared once all of them have been visited.
    pub fn remove_directory(&self, path: &str) -> Result<(), FsError> {
        check_path(path)?;
        if is_root(path) {
            return Err(FsError::InvalidOperation);
        }
        let mut tables = self.tables.lock();
        let id = tables.find_directory(path).ok_or(FsError::DirectoryNotFound)?.current_id;
        let failures = self.remove_tree(&mut tables, id, false);
        if failures > 0 {
            warn!("flashfs: removing {path:?} skipped {failures} broken entries");
        }
        self.persist(&tables)
    }

    /// Depth-first removal of `dir_id`. Returns the number of child failures.
    pub(crate) fn remove_tree(&self, tables: &mut EntryTables<I>, dir_id: EntryId, wipe: bool) -> u32 {
        let (subdirs, files) = tables.children(dir_id);
        let mut failures = 0;
        for file_id in files {
            if let Err(e) = self.discard_file(tables, file_id, wipe) {
                warn!("flashfs: discarding file {file_id} under {dir_id}: {e}");
                failures += 1;
            }
        }
        for sub in subdirs {
            failures += self.remove_tree(tables, sub, wipe);
        }

        if let Some(block) = tables.directory(dir_id).map(|d| d.start_block) {
            if wipe {
                if let Err(e) = self.device.lock().erase_block(block) {
                    warn!("flashfs: erasing directory block {block}: {e}");
                    failures += 1;
                }
            }
            self.fat.free(block);
        }
        tables.clear_directory(dir_id);
        debug!("flashfs: removed directory {dir_id}");
        failures
    }

    /// Owned listing of the children of the directory at `path`.
    pub fn list_directory(&self, path: &str) -> Result<Listing, FsError> {
        check_path(path)?;
        let tables = self.tables.lock();
        let dir = tables.find_directory(path).ok_or(FsError::DirectoryNotFound)?;
        Ok(tables.listing(dir.current_id))
    }

    /// Describe whatever `path` names.
    pub fn stat(&self, path: &str) -> Result<DirListing, FsError> {
        check_path(path)?;
        let tables = self.tables.lock();
        if let Some(dir) = tables.find_directory(path) {
            return Ok(DirListing { name: dir.name.clone(), kind: EntryKind::Directory, size: 0 });
        }
        let resolved = resolve_path(path);
        let parent = tables.find_directory(resolved.parent).ok_or(FsError::DirectoryNotFound)?;
        let file = tables
            .find_file_entry(resolved.leaf, parent.current_id)
            .ok_or(FsError::NotFound)?;
        Ok(DirListing { name: file.name.clone(), kind: EntryKind::File, size: file.size })
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
