//! Directory and file entry tables.
//!
//! Both tables are fixed-capacity arrays of records forming a parent-pointer
//! tree: an entry names its containing directory by id, and a directory's
//! children are found by scanning for that id. Slots are never removed, only
//! marked unused and reused by later creations.

use flashfs_types::{
    DirListing, EntryKind, FsError, Listing, MAX_DIRECTORIES, MAX_FILES, ROOT_PATH,
};
use log::{debug, warn};
use spin::Mutex;

use crate::block_dev::{BlockStore, Device};
use crate::entry::{DirectoryEntry, EntryId, FileEntry};
use crate::fat::BlockAllocator;
use crate::path::{entry_name, segments};

// ─── Id generation ─────────────────────────────────────────────────────────────

/// Source of entry identifiers, typically seeded from an entropy source.
///
/// Ids need not be unique on their own: the tables redraw on collision.
pub trait IdSource: Send {
    fn next_id(&mut self) -> EntryId;
}

/// Monotonic counter; the default source.
#[derive(Clone, Debug)]
pub struct SequentialIds {
    next: EntryId,
}

impl SequentialIds {
    pub const fn starting_at(first: EntryId) -> Self { Self { next: first } }
}

impl Default for SequentialIds {
    fn default() -> Self { Self::starting_at(1) }
}

impl IdSource for SequentialIds {
    fn next_id(&mut self) -> EntryId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Enough draws to step a sequential source past every live id.
const MAX_ID_DRAWS: usize = MAX_DIRECTORIES + MAX_FILES + 1;

pub type DirIds = heapless::Vec<EntryId, MAX_DIRECTORIES>;
pub type FileIds = heapless::Vec<EntryId, MAX_FILES>;

// ─── Tables ────────────────────────────────────────────────────────────────────

pub struct EntryTables<I> {
    dirs:  heapless::Vec<DirectoryEntry, MAX_DIRECTORIES>,
    files: heapless::Vec<FileEntry, MAX_FILES>,
    ids:   I,
}

impl<I: IdSource> EntryTables<I> {
    pub fn new(ids: I) -> Self {
        Self { dirs: heapless::Vec::new(), files: heapless::Vec::new(), ids }
    }

    pub(crate) fn from_parts(
        dirs: heapless::Vec<DirectoryEntry, MAX_DIRECTORIES>,
        files: heapless::Vec<FileEntry, MAX_FILES>,
        ids: I,
    ) -> Self {
        Self { dirs, files, ids }
    }

    pub fn directories(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.dirs.iter().filter(|d| d.in_use)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| f.in_use)
    }

    pub fn root(&self) -> Option<&DirectoryEntry> {
        self.directories().find(|d| d.is_root())
    }

    fn id_in_use(&self, id: EntryId) -> bool {
        self.directories().any(|d| d.current_id == id)
            || self.files().any(|f| f.unique_file_id == id)
    }

    fn fresh_id(&mut self) -> Result<EntryId, FsError> {
        for _ in 0..MAX_ID_DRAWS {
            let id = self.ids.next_id();
            if !self.id_in_use(id) {
                return Ok(id);
            }
            debug!("tables: id {id} already taken, redrawing");
        }
        warn!("tables: id source kept returning live ids");
        Err(FsError::InvalidOperation)
    }

    // ── lookup ───────────────────────────────────────────────────────────────

    pub fn directory(&self, id: EntryId) -> Option<&DirectoryEntry> {
        self.directories().find(|d| d.current_id == id)
    }

    pub fn child_directory(&self, name: &str, parent_id: EntryId) -> Option<&DirectoryEntry> {
        self.directories()
            .find(|d| !d.is_root() && d.parent_id == parent_id && d.name.as_str() == name)
    }

    /// Walk `path` from the root, one component at a time.
    pub fn find_directory(&self, path: &str) -> Option<&DirectoryEntry> {
        let mut dir = self.root()?;
        for segment in segments(path) {
            dir = self.child_directory(segment, dir.current_id)?;
        }
        Some(dir)
    }

    pub fn find_file_entry(&self, name: &str, parent_id: EntryId) -> Option<&FileEntry> {
        self.files().find(|f| f.parent_id == parent_id && f.name.as_str() == name)
    }

    pub fn file(&self, id: EntryId) -> Option<&FileEntry> {
        self.files().find(|f| f.unique_file_id == id)
    }

    #[cfg(test)]
    pub(crate) fn directory_mut(&mut self, id: EntryId) -> Option<&mut DirectoryEntry> {
        self.dirs.iter_mut().find(|d| d.in_use && d.current_id == id)
    }

    pub fn file_mut(&mut self, id: EntryId) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|f| f.in_use && f.unique_file_id == id)
    }

    /// True if a file or directory called `name` already lives in `parent_id`.
    pub fn name_taken(&self, name: &str, parent_id: EntryId) -> bool {
        self.child_directory(name, parent_id).is_some()
            || self.find_file_entry(name, parent_id).is_some()
    }

    pub fn children(&self, parent_id: EntryId) -> (DirIds, FileIds) {
        let mut dirs = DirIds::new();
        let mut files = FileIds::new();
        for d in self.directories().filter(|d| !d.is_root() && d.parent_id == parent_id) {
            let _ = dirs.push(d.current_id);
        }
        for f in self.files().filter(|f| f.parent_id == parent_id) {
            let _ = files.push(f.unique_file_id);
        }
        (dirs, files)
    }

    /// Owned copies of every child of `parent_id`, directories first.
    pub fn listing(&self, parent_id: EntryId) -> Listing {
        let mut out = Listing::new();
        let (dirs, files) = self.children(parent_id);
        for d in dirs.iter().filter_map(|&id| self.directory(id)) {
            let _ = out.push(DirListing { name: d.name.clone(), kind: EntryKind::Directory, size: 0 });
        }
        for f in files.iter().filter_map(|&id| self.file(id)) {
            let _ = out.push(DirListing { name: f.name.clone(), kind: EntryKind::File, size: f.size });
        }
        out
    }

    // ── creation ─────────────────────────────────────────────────────────────

    fn free_dir_slot(&self) -> Option<usize> {
        self.dirs.iter().position(|d| !d.in_use)
            .or((self.dirs.len() < MAX_DIRECTORIES).then_some(self.dirs.len()))
    }

    fn free_file_slot(&self) -> Option<usize> {
        self.files.iter().position(|f| !f.in_use)
            .or((self.files.len() < MAX_FILES).then_some(self.files.len()))
    }

    fn commit_dir(&mut self, slot: usize, entry: DirectoryEntry) {
        match self.dirs.get_mut(slot) {
            Some(existing) => *existing = entry,
            None => { let _ = self.dirs.push(entry); }
        }
    }

    fn commit_file(&mut self, slot: usize, entry: FileEntry) {
        match self.files.get_mut(slot) {
            Some(existing) => *existing = entry,
            None => { let _ = self.files.push(entry); }
        }
    }

    /// Create the root directory of a freshly formatted volume.
    pub(crate) fn create_root<D: BlockStore>(
        &mut self,
        fat: &BlockAllocator,
        device: &Mutex<Device<D>>,
    ) -> Result<DirectoryEntry, FsError> {
        let id = self.fresh_id()?;
        self.insert_directory(ROOT_PATH, id, id, fat, device)
    }

    /// Add `name` under `parent_id` and persist its metadata block.
    ///
    /// On failure no slot is taken and the allocated block is released.
    pub(crate) fn create_directory<D: BlockStore>(
        &mut self,
        name: &str,
        parent_id: EntryId,
        fat: &BlockAllocator,
        device: &Mutex<Device<D>>,
    ) -> Result<DirectoryEntry, FsError> {
        entry_name(name)?;
        if self.directory(parent_id).is_none() {
            return Err(FsError::DirectoryNotFound);
        }
        if self.name_taken(name, parent_id) {
            return Err(FsError::AlreadyExists);
        }
        let id = self.fresh_id()?;
        self.insert_directory(name, id, parent_id, fat, device)
    }

    fn insert_directory<D: BlockStore>(
        &mut self,
        name: &str,
        id: EntryId,
        parent_id: EntryId,
        fat: &BlockAllocator,
        device: &Mutex<Device<D>>,
    ) -> Result<DirectoryEntry, FsError> {
        let slot = self.free_dir_slot().ok_or(FsError::NoSpace)?;
        let block = fat.try_allocate_directory_block().map_err(|_| FsError::NoSpace)?;
        let entry = DirectoryEntry {
            name: flashfs_types::Name::try_from(name).map_err(|_| FsError::NameTooLong)?,
            current_id: id,
            parent_id,
            start_block: block,
            in_use: true,
            size: 0,
        };
        if let Err(e) = device.lock().write_with(block, |buf| entry.encode_block(buf)) {
            warn!("tables: persisting directory {name:?} to block {block} failed: {e}");
            fat.free(block);
            return Err(e);
        }
        self.commit_dir(slot, entry.clone());
        debug!("tables: created directory {name:?} id={id} parent={parent_id} block={block}");
        Ok(entry)
    }

    /// Add an empty file `name` under `parent_id` with its first content block.
    pub(crate) fn create_file_entry(
        &mut self,
        name: &str,
        parent_id: EntryId,
        fat: &BlockAllocator,
    ) -> Result<FileEntry, FsError> {
        let name = entry_name(name)?;
        if self.directory(parent_id).is_none() {
            return Err(FsError::DirectoryNotFound);
        }
        if self.name_taken(&name, parent_id) {
            return Err(FsError::AlreadyExists);
        }
        let slot = self.free_file_slot().ok_or(FsError::NoSpace)?;
        let id = self.fresh_id()?;
        let block = fat.try_allocate().map_err(|_| FsError::NoSpace)?;
        let entry = FileEntry {
            name,
            parent_id,
            start_block: Some(block),
            size: 0,
            unique_file_id: id,
            in_use: true,
        };
        self.commit_file(slot, entry.clone());
        debug!("tables: created file {:?} id={id} parent={parent_id} block={block}", entry.name);
        Ok(entry)
    }

    // ── removal ──────────────────────────────────────────────────────────────

    pub fn clear_directory(&mut self, id: EntryId) {
        if let Some(d) = self.dirs.iter_mut().find(|d| d.in_use && d.current_id == id) {
            d.in_use = false;
        }
    }

    pub fn clear_file(&mut self, id: EntryId) {
        if let Some(f) = self.file_mut(id) {
            f.in_use = false;
        }
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
