//! Archive entry classification

use crate::path::{sanitize_path, PathRejection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Entry type as declared by the archive header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Sparse,
    Other(u8),
}

impl EntryKind {
    /// Only regular files and directories are ever written to disk
    pub fn is_materialized(&self) -> bool {
        matches!(self, EntryKind::Regular | EntryKind::Directory)
    }
}

impl From<tar::EntryType> for EntryKind {
    fn from(entry_type: tar::EntryType) -> Self {
        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::Regular,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::HardLink,
            tar::EntryType::Char => EntryKind::CharDevice,
            tar::EntryType::Block => EntryKind::BlockDevice,
            tar::EntryType::Fifo => EntryKind::Fifo,
            tar::EntryType::GNUSparse => EntryKind::Sparse,
            other => EntryKind::Other(other.as_byte()),
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Regular => write!(f, "regular file"),
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::Symlink => write!(f, "symlink"),
            EntryKind::HardLink => write!(f, "hardlink"),
            EntryKind::CharDevice => write!(f, "character device"),
            EntryKind::BlockDevice => write!(f, "block device"),
            EntryKind::Fifo => write!(f, "FIFO"),
            EntryKind::Sparse => write!(f, "sparse file"),
            EntryKind::Other(flag) => write!(f, "entry type 0x{:02x}", flag),
        }
    }
}

/// Reason an entry was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    DisallowedType(EntryKind),
    UnsafePath(PathRejection),
    /// A file entry whose path cleans down to the root itself
    FileAtRoot,
    /// An earlier entry already holds the path, or one of its parents, as the
    /// other kind of node
    PathConflict,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DisallowedType(kind) => write!(f, "{} not allowed", kind),
            SkipReason::UnsafePath(rejection) => write!(f, "{}", rejection),
            SkipReason::FileAtRoot => write!(f, "file would replace destination root"),
            SkipReason::PathConflict => write!(f, "conflicts with an extracted entry"),
        }
    }
}

/// Record of an entry left out of the extracted tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub path: String,
    pub kind: EntryKind,
    pub link_target: Option<String>,
    pub reason: SkipReason,
}

/// What to do with one archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDisposition {
    Directory(PathBuf),
    File(PathBuf),
    Skip(SkipReason),
}

/// Decide the fate of an entry. Type is judged before path, so a symlink is
/// refused as a symlink whatever its name.
pub fn classify(kind: EntryKind, name: &str, root: &Path) -> EntryDisposition {
    if !kind.is_materialized() {
        return EntryDisposition::Skip(SkipReason::DisallowedType(kind));
    }

    let target = match sanitize_path(name, root) {
        Ok(target) => target,
        Err(rejection) => return EntryDisposition::Skip(SkipReason::UnsafePath(rejection)),
    };

    match kind {
        EntryKind::Directory => EntryDisposition::Directory(target),
        _ if target == root => EntryDisposition::Skip(SkipReason::FileAtRoot),
        _ => EntryDisposition::File(target),
    }
}
