//! Slash-delimited path handling.
//!
//! Nothing here touches the tables; every function is pure.

use flashfs_types::{FsError, Name, MAX_NAME_LEN, MAX_PATH_LEN, ROOT_PATH};

/// Whether the final component names a file or only refers to a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafKind {
    File,
    Directory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedPath<'a> {
    /// Containing directory; `ROOT_PATH` when the path has no parent part.
    pub parent: &'a str,
    /// Final component; empty when the path ends in `/`.
    pub leaf:   &'a str,
    pub kind:   LeafKind,
}

/// Split `path` on its last `/` into parent directory and leaf.
///
/// A bare name lives under the root, and a trailing slash yields an empty
/// leaf that refers to the parent directory itself.
pub fn resolve_path(path: &str) -> ResolvedPath<'_> {
    let (parent, leaf) = match path.rfind('/') {
        None    => (ROOT_PATH, path),
        Some(0) => (ROOT_PATH, &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
    };
    let kind = if leaf.is_empty() { LeafKind::Directory } else { LeafKind::File };
    ResolvedPath { parent, leaf, kind }
}

/// Non-empty components of a directory path, root first.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

pub fn is_root(path: &str) -> bool {
    segments(path).next().is_none()
}

/// Reject empty and oversized paths before they reach the tables.
pub fn check_path(path: &str) -> Result<(), FsError> {
    if path.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Validate a single component and copy it into a bounded name.
pub fn entry_name(name: &str) -> Result<Name, FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    Name::try_from(name).map_err(|_| FsError::NameTooLong)
}

/// `report.txt` → `reportCopy.txt`, `notes` → `notesCopy`.
pub fn copy_name(name: &str) -> Result<Name, FsError> {
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    };
    let mut out = Name::new();
    for part in [stem, "Copy", ext] {
        out.push_str(part).map_err(|_| FsError::NameTooLong)?;
    }
    Ok(out)
}
