//! Directory and file metadata records.
//!
//! Both kinds serialize to the same fixed 64-byte record so the table
//! snapshots and the per-directory metadata block share one codec.

use bitflags::bitflags;
use flashfs_types::{FsError, Name, MAX_NAME_LEN};

use crate::fat::BlockId;

pub type EntryId = u32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name:        Name,
    pub current_id:  EntryId,
    /// Equal to `current_id` only for the root.
    pub parent_id:   EntryId,
    /// Block holding this directory's own metadata record.
    pub start_block: BlockId,
    pub in_use:      bool,
    /// Reserved; children are found by scanning, not counted here.
    pub size:        u32,
}

impl DirectoryEntry {
    pub fn is_directory(&self) -> bool { true }
    pub fn is_root(&self) -> bool { self.current_id == self.parent_id }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub name:           Name,
    pub parent_id:      EntryId,
    /// Head of the content chain.
    pub start_block:    Option<BlockId>,
    pub size:           u32,
    pub unique_file_id: EntryId,
    pub in_use:         bool,
}

impl FileEntry {
    pub fn is_directory(&self) -> bool { false }
}

// ─── Record codec ──────────────────────────────────────────────────────────────

pub(crate) const RECORD_SIZE: usize = 64;

/// Leading bytes of a directory's metadata block.
pub(crate) const DIR_BLOCK_MAGIC: [u8; 4] = *b"FDIR";

const NO_BLOCK: u32 = u32::MAX;

// Field offsets inside a record.
const FLAGS:  usize = 0;
const NAME_LEN: usize = 1;
const NAME:   usize = 2;
const ID:     usize = NAME + MAX_NAME_LEN;
const PARENT: usize = ID + 4;
const START:  usize = PARENT + 4;
const SIZE:   usize = START + 4;

const _: () = assert!(SIZE + 4 <= RECORD_SIZE);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct RecordFlags: u8 {
        const IN_USE    = 1 << 0;
        const DIRECTORY = 1 << 1;
    }
}

struct RawRecord<'a> {
    flags:  RecordFlags,
    name:   &'a str,
    id:     u32,
    parent: u32,
    start:  u32,
    size:   u32,
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn encode(rec: &RawRecord<'_>, out: &mut [u8]) {
    out[..RECORD_SIZE].fill(0);
    out[FLAGS] = rec.flags.bits();
    let name = rec.name.as_bytes();
    out[NAME_LEN] = name.len() as u8;
    out[NAME..NAME + name.len()].copy_from_slice(name);
    put_u32(out, ID, rec.id);
    put_u32(out, PARENT, rec.parent);
    put_u32(out, START, rec.start);
    put_u32(out, SIZE, rec.size);
}

fn decode(raw: &[u8]) -> Result<RawRecord<'_>, FsError> {
    if raw.len() < RECORD_SIZE {
        return Err(FsError::Corrupted);
    }
    let flags = RecordFlags::from_bits(raw[FLAGS]).ok_or(FsError::Corrupted)?;
    let len = raw[NAME_LEN] as usize;
    if len == 0 || len > MAX_NAME_LEN {
        return Err(FsError::Corrupted);
    }
    let name = core::str::from_utf8(&raw[NAME..NAME + len]).map_err(|_| FsError::Corrupted)?;
    Ok(RawRecord {
        flags,
        name,
        id:     get_u32(raw, ID),
        parent: get_u32(raw, PARENT),
        start:  get_u32(raw, START),
        size:   get_u32(raw, SIZE),
    })
}

fn to_name(s: &str) -> Result<Name, FsError> {
    Name::try_from(s).map_err(|_| FsError::Corrupted)
}

impl DirectoryEntry {
    pub(crate) fn encode(&self, out: &mut [u8]) {
        let mut flags = RecordFlags::DIRECTORY;
        flags.set(RecordFlags::IN_USE, self.in_use);
        encode(&RawRecord {
            flags,
            name:   self.name.as_str(),
            id:     self.current_id,
            parent: self.parent_id,
            start:  self.start_block,
            size:   self.size,
        }, out);
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Self, FsError> {
        let rec = decode(raw)?;
        if !rec.flags.contains(RecordFlags::DIRECTORY) {
            return Err(FsError::Corrupted);
        }
        Ok(Self {
            name:        to_name(rec.name)?,
            current_id:  rec.id,
            parent_id:   rec.parent,
            start_block: rec.start,
            in_use:      rec.flags.contains(RecordFlags::IN_USE),
            size:        rec.size,
        })
    }

    /// Image of this entry's metadata block: magic followed by the record.
    pub(crate) fn encode_block(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&DIR_BLOCK_MAGIC);
        self.encode(&mut out[4..4 + RECORD_SIZE]);
    }
}

impl FileEntry {
    pub(crate) fn encode(&self, out: &mut [u8]) {
        let mut flags = RecordFlags::empty();
        flags.set(RecordFlags::IN_USE, self.in_use);
        encode(&RawRecord {
            flags,
            name:   self.name.as_str(),
            id:     self.unique_file_id,
            parent: self.parent_id,
            start:  self.start_block.unwrap_or(NO_BLOCK),
            size:   self.size,
        }, out);
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Self, FsError> {
        let rec = decode(raw)?;
        if rec.flags.contains(RecordFlags::DIRECTORY) {
            return Err(FsError::Corrupted);
        }
        Ok(Self {
            name:           to_name(rec.name)?,
            parent_id:      rec.parent,
            start_block:    (rec.start != NO_BLOCK).then_some(rec.start),
            size:           rec.size,
            unique_file_id: rec.id,
            in_use:         rec.flags.contains(RecordFlags::IN_USE),
        })
    }
}
