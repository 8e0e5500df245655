#![no_std]

#[cfg(test)]
extern crate std;

use core::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Size of one allocation unit. Also the erase granularity of the flash.
pub const BLOCK_SIZE: usize = 4096;
/// Upper bound on `total_blocks`; sizes the in-memory allocation table.
pub const MAX_BLOCKS: usize = 1024;

pub const MAX_DIRECTORIES: usize = 32;
pub const MAX_FILES: usize = 32;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_PATH_LEN: usize = 256;

/// Most children a single directory listing can hold.
pub const MAX_LISTING: usize = MAX_DIRECTORIES + MAX_FILES;

/// Path of the root directory.
pub const ROOT_PATH: &str = "/";

pub type Name = heapless::String<MAX_NAME_LEN>;
pub type Listing = heapless::Vec<DirListing, MAX_LISTING>;

/// Errors returned by every fallible filesystem call.
///
/// The discriminants are stable and can cross an IPC or FFI boundary as a
/// single status byte (`0` is reserved for success).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum FsError {
    /// The allocator found no free block, even after retrying.
    NoFreeBlocks      = 1,
    /// A chain or table entry is inconsistent with its expected state.
    Corrupted         = 2,
    /// Block index outside the allocation table.
    OutOfRange        = 3,
    /// Chain operation on a directory marker, or a link touching a reserved block.
    InvalidOperation  = 4,
    NotFound          = 5,
    DirectoryNotFound = 6,
    FileNotFound      = 7,
    InvalidMode       = 8,
    /// An entry table is full.
    NoSpace           = 9,
    InvalidArgument   = 10,
    AlreadyExists     = 11,
    IsDirectory       = 12,
    NameTooLong       = 13,
    /// The block store reported a failure.
    Io                = 14,
}

impl FsError {
    /// True for the three lookup-miss variants.
    pub fn is_not_found(self) -> bool {
        matches!(self, FsError::NotFound | FsError::DirectoryNotFound | FsError::FileNotFound)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NoFreeBlocks      => "no free blocks",
            FsError::Corrupted         => "allocation chain corrupted",
            FsError::OutOfRange        => "block index out of range",
            FsError::InvalidOperation  => "invalid operation on block",
            FsError::NotFound          => "not found",
            FsError::DirectoryNotFound => "directory not found",
            FsError::FileNotFound      => "file not found",
            FsError::InvalidMode       => "invalid open mode",
            FsError::NoSpace           => "entry table full",
            FsError::InvalidArgument   => "invalid argument",
            FsError::AlreadyExists     => "already exists",
            FsError::IsDirectory       => "is a directory",
            FsError::NameTooLong       => "name too long",
            FsError::Io                => "block store i/o error",
        };
        f.write_str(msg)
    }
}

/// How a file handle was opened.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum OpenMode {
    Read   = b'r',
    Write  = b'w',
    Append = b'a',
}

impl OpenMode {
    /// Parse a C-style mode string: `"r"`, `"w"` or `"a"`.
    pub fn parse(mode: &str) -> Result<Self, FsError> {
        match mode.as_bytes() {
            [c] => OpenMode::try_from(*c).map_err(|_| FsError::InvalidMode),
            _ => Err(FsError::InvalidMode),
        }
    }

    pub fn can_read(self) -> bool { self == OpenMode::Read }
    pub fn can_write(self) -> bool { self != OpenMode::Read }
}

/// Reference point for `seek`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Whence {
    Start   = 0,
    Current = 1,
    End     = 2,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum EntryKind {
    File      = 0,
    Directory = 1,
}

/// One child of a directory, copied out of the live tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirListing {
    pub name: Name,
    pub kind: EntryKind,
    /// Logical byte length; always 0 for directories.
    pub size: u32,
}

impl DirListing {
    pub fn is_dir(&self) -> bool { self.kind == EntryKind::Directory }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn parse_known_modes() {
        assert_eq!(OpenMode::parse("r"), Ok(OpenMode::Read));
        assert_eq!(OpenMode::parse("w"), Ok(OpenMode::Write));
        assert_eq!(OpenMode::parse("a"), Ok(OpenMode::Append));
    }

    #[test]
    fn parse_rejects_unknown_modes() {
        assert_eq!(OpenMode::parse("x"), Err(FsError::InvalidMode));
        assert_eq!(OpenMode::parse("rw"), Err(FsError::InvalidMode));
        assert_eq!(OpenMode::parse(""), Err(FsError::InvalidMode));
    }

    #[test]
    fn mode_permissions() {
        assert!(OpenMode::Read.can_read());
        assert!(!OpenMode::Read.can_write());
        assert!(OpenMode::Append.can_write());
        assert!(!OpenMode::Write.can_read());
    }

    #[test]
    fn error_status_codes_are_stable() {
        let code: u8 = FsError::NoFreeBlocks.into();
        assert_eq!(code, 1);
        assert_eq!(FsError::try_from(14u8).ok(), Some(FsError::Io));
        assert!(FsError::try_from(0u8).is_err());
    }

    #[test]
    fn error_display() {
        assert_eq!(FsError::IsDirectory.to_string(), "is a directory");
        assert!(FsError::FileNotFound.is_not_found());
        assert!(!FsError::Io.is_not_found());
    }
}
