// Library crate root. Host tests build against std; every other build is no_std.
#![cfg_attr(not(test), no_std)]

pub mod block_dev;
pub mod config;
pub mod entry;
pub mod fat;
pub mod file;
pub mod fs;
pub mod logger;
mod ops;
pub mod path;
mod snapshot;
pub mod tables;

#[cfg(test)]
mod testing;

pub use block_dev::{BlockStore, IoError};
pub use config::{FsConfig, Layout, RetryPolicy};
pub use entry::{DirectoryEntry, EntryId, FileEntry};
pub use fat::{BlockAllocator, BlockId, BlockState, ChainLink};
pub use file::FileHandle;
pub use fs::FlashFs;
pub use path::{resolve_path, LeafKind, ResolvedPath};
pub use tables::{IdSource, SequentialIds};

pub use flashfs_types::{
    DirListing, EntryKind, FsError, Listing, Name, OpenMode, Whence, BLOCK_SIZE, MAX_BLOCKS,
    MAX_DIRECTORIES, MAX_FILES, MAX_NAME_LEN, MAX_PATH_LEN, ROOT_PATH,
};
