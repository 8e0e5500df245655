//! Whole-table metadata images stored in the reserved prefix.
//!
//! Every image starts with a 16-byte header:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | magic                                   |
//! | 4      | 2    | format version (LE)                     |
//! | 6      | 2    | unused                                  |
//! | 8      | 4    | record / slot count (LE)                |
//! | 12     | 4    | extra: first usable block for the FAT   |
//!
//! The FAT image continues with one little-endian `u32` per block and may
//! span several blocks. Each entry table fits in a single block.

use flashfs_types::{FsError, BLOCK_SIZE, MAX_DIRECTORIES, MAX_FILES};

use crate::entry::{DirectoryEntry, FileEntry, RECORD_SIZE};
use crate::fat::{BlockState, Fat};

pub(crate) const HEADER_SIZE: usize = 16;
pub(crate) const FAT_SLOT_SIZE: usize = 4;

const VERSION: u16 = 1;
const FAT_MAGIC: [u8; 4] = *b"FFAT";

const _: () = assert!(HEADER_SIZE + MAX_DIRECTORIES * RECORD_SIZE <= BLOCK_SIZE);
const _: () = assert!(HEADER_SIZE + MAX_FILES * RECORD_SIZE <= BLOCK_SIZE);
const _: () = assert!(BLOCK_SIZE % FAT_SLOT_SIZE == 0);

fn write_header(buf: &mut [u8], magic: [u8; 4], count: u32, extra: u32) {
    buf[0..4].copy_from_slice(&magic);
    buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
    buf[8..12].copy_from_slice(&count.to_le_bytes());
    buf[12..16].copy_from_slice(&extra.to_le_bytes());
}

/// Returns `(count, extra)` if the header carries `magic` at our version.
fn read_header(buf: &[u8], magic: [u8; 4]) -> Result<(u32, u32), FsError> {
    if buf[0..4] != magic {
        log::warn!("snapshot: bad magic {:02x?}", &buf[0..4]);
        return Err(FsError::Corrupted);
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != VERSION {
        log::warn!("snapshot: unsupported version {version}");
        return Err(FsError::Corrupted);
    }
    let count = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let extra = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    Ok((count, extra))
}

// ─── FAT image ─────────────────────────────────────────────────────────────────

/// Slots whose encoding falls inside image block `index`, with their offsets.
fn slots_in_block(len: u32, index: u32) -> impl Iterator<Item = (u32, usize)> {
    let base = index as usize * BLOCK_SIZE;
    let first = base.saturating_sub(HEADER_SIZE).div_ceil(FAT_SLOT_SIZE) as u32;
    (first..len)
        .map(move |slot| (slot, HEADER_SIZE + slot as usize * FAT_SLOT_SIZE))
        .take_while(move |&(_, pos)| pos < base + BLOCK_SIZE)
        .map(move |(slot, pos)| (slot, pos - base))
}

pub(crate) fn encode_fat_block(fat: &Fat, index: u32, buf: &mut [u8; BLOCK_SIZE]) {
    if index == 0 {
        write_header(buf, FAT_MAGIC, fat.len(), fat.first_usable());
    }
    for (slot, off) in slots_in_block(fat.len(), index) {
        let raw = fat.get(slot).unwrap_or(BlockState::Free).encode();
        buf[off..off + FAT_SLOT_SIZE].copy_from_slice(&raw.to_le_bytes());
    }
}

pub(crate) fn decode_fat_block(fat: &mut Fat, index: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), FsError> {
    if index == 0 {
        let (count, first_usable) = read_header(buf, FAT_MAGIC)?;
        if count != fat.len() || first_usable != fat.first_usable() {
            log::warn!(
                "snapshot: FAT geometry {count}/{first_usable} does not match volume {}/{}",
                fat.len(), fat.first_usable(),
            );
            return Err(FsError::Corrupted);
        }
    }
    for (slot, off) in slots_in_block(fat.len(), index) {
        let raw = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        fat.set(slot, BlockState::decode(raw));
    }
    Ok(())
}

// ─── Entry tables ──────────────────────────────────────────────────────────────

pub(crate) trait TableRecord: Sized {
    const MAGIC: [u8; 4];
    fn encode_record(&self, out: &mut [u8]);
    fn decode_record(raw: &[u8]) -> Result<Self, FsError>;
}

impl TableRecord for DirectoryEntry {
    const MAGIC: [u8; 4] = *b"FDTB";
    fn encode_record(&self, out: &mut [u8]) { self.encode(out) }
    fn decode_record(raw: &[u8]) -> Result<Self, FsError> { Self::decode(raw) }
}

impl TableRecord for FileEntry {
    const MAGIC: [u8; 4] = *b"FFTB";
    fn encode_record(&self, out: &mut [u8]) { self.encode(out) }
    fn decode_record(raw: &[u8]) -> Result<Self, FsError> { Self::decode(raw) }
}

/// Write the given records (in-use entries only) into one table block.
pub(crate) fn encode_table<'a, T, It>(records: It, buf: &mut [u8; BLOCK_SIZE])
where
    T: TableRecord + 'a,
    It: Iterator<Item = &'a T>,
{
    let mut count = 0u32;
    for rec in records {
        let at = HEADER_SIZE + count as usize * RECORD_SIZE;
        if at + RECORD_SIZE > BLOCK_SIZE {
            break;
        }
        rec.encode_record(&mut buf[at..at + RECORD_SIZE]);
        count += 1;
    }
    write_header(buf, T::MAGIC, count, 0);
}

pub(crate) fn decode_table<T: TableRecord, const N: usize>(
    buf: &[u8; BLOCK_SIZE],
) -> Result<heapless::Vec<T, N>, FsError> {
    let (count, _) = read_header(buf, T::MAGIC)?;
    if count as usize > N {
        return Err(FsError::Corrupted);
    }
    let mut out = heapless::Vec::new();
    for i in 0..count as usize {
        let at = HEADER_SIZE + i * RECORD_SIZE;
        let rec = T::decode_record(&buf[at..at + RECORD_SIZE])?;
        out.push(rec).map_err(|_| FsError::Corrupted)?;
    }
    Ok(out)
}
