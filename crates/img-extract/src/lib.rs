//! Hardened extraction of container filesystem exports
//!
//! Reconstructs an untrusted, forward-only tar stream on local disk. Only
//! regular files and directories are materialized. Links, device nodes and
//! FIFOs are dropped, as is any entry whose path would land outside the
//! destination root or collide with an extracted node of the other kind.
//! Dropped entries are logged and reported; they never abort the run. A
//! corrupt or truncated stream does.

pub mod entry;
pub mod path;
pub mod permissions;

pub use entry::{classify, EntryDisposition, EntryKind, SkipReason, SkippedEntry};
pub use path::{clean_relative, sanitize_path, PathRejection};
pub use permissions::{file_mode, make_readable_for_scan, SAFE_MODE_CEILING};

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Corrupt archive stream: {0}")]
    Stream(#[source] io::Error),

    #[error("Truncated entry {path}: expected {expected} bytes, got {actual}")]
    Truncated {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid destination {}: {source}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type ExtractResult<T> = Result<T, ExtractError>;

/// Default cap on bytes written for a single entry (10 GiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Summary of one extraction run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub files_written: usize,
    pub directories_created: usize,
    pub bytes_written: u64,
    /// Files cut short at the size cap
    pub truncated_files: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

impl ExtractionReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Streaming tar extractor
#[derive(Debug, Clone)]
pub struct Extractor {
    max_file_size: u64,
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    /// Set the cap on bytes written per file
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Extract a tar stream into `destination`, creating it if needed.
    ///
    /// Entries are handled strictly in stream order.
    pub fn extract<R: Read>(&self, reader: R, destination: &Path) -> ExtractResult<ExtractionReport> {
        let root = prepare_root(destination)?;
        let mut report = ExtractionReport::default();

        let mut archive = tar::Archive::new(reader);
        let entries = archive.entries().map_err(ExtractError::Stream)?;

        for entry in entries {
            let mut entry = entry.map_err(ExtractError::Stream)?;

            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let kind = EntryKind::from(entry.header().entry_type());

            let disposition = match classify(kind, &name, &root) {
                EntryDisposition::Directory(target) if path_conflict(&root, &target, true) => {
                    EntryDisposition::Skip(SkipReason::PathConflict)
                }
                EntryDisposition::File(target) if path_conflict(&root, &target, false) => {
                    EntryDisposition::Skip(SkipReason::PathConflict)
                }
                disposition => disposition,
            };

            match disposition {
                EntryDisposition::Directory(target) => {
                    permissions::create_dirs(&target).map_err(|source| ExtractError::Io {
                        path: target.clone(),
                        source,
                    })?;
                    report.directories_created += 1;
                }
                EntryDisposition::File(target) => {
                    let mode = entry.header().mode().map_err(ExtractError::Stream)?;
                    let declared_size = entry.size();
                    self.write_file(&mut entry, &name, &target, declared_size, mode, &mut report)?;
                }
                EntryDisposition::Skip(reason) => {
                    let link_target = entry
                        .link_name_bytes()
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
                    match &link_target {
                        Some(target) => warn!("Skipping {}: {} -> {} ({})", kind, name, target, reason),
                        None => warn!("Skipping {}: {} ({})", kind, name, reason),
                    }
                    report.skipped.push(SkippedEntry {
                        path: name,
                        kind,
                        link_target,
                        reason,
                    });
                }
            }
        }

        debug!(
            "Extracted {} files and {} directories ({} bytes), skipped {} entries",
            report.files_written,
            report.directories_created,
            report.bytes_written,
            report.skipped.len()
        );

        Ok(report)
    }

    fn write_file<R: Read>(
        &self,
        entry: &mut R,
        name: &str,
        target: &Path,
        declared_size: u64,
        declared_mode: u32,
        report: &mut ExtractionReport,
    ) -> ExtractResult<()> {
        let io_error = |source| ExtractError::Io {
            path: target.to_path_buf(),
            source,
        };

        if let Some(parent) = target.parent() {
            permissions::create_dirs(parent).map_err(io_error)?;
        }

        // A later entry for the same path replaces the earlier one, even if
        // the earlier one ended up read-only
        if fs::symlink_metadata(target).map(|m| m.is_file()).unwrap_or(false) {
            fs::remove_file(target).map_err(io_error)?;
        }

        let mut file = permissions::create_restricted_file(target).map_err(io_error)?;
        let limit = self.max_file_size;
        let written = copy_capped(entry, &mut file, limit, target)?;

        let expected = declared_size.min(limit);
        if written < expected {
            return Err(ExtractError::Truncated {
                path: name.to_string(),
                expected,
                actual: written,
            });
        }

        if declared_size > limit {
            warn!(
                "Truncated {} at {} bytes (declared {} bytes)",
                name, limit, declared_size
            );
            report.truncated_files.push(name.to_string());
        }

        drop(file);
        permissions::set_mode(target, file_mode(declared_mode)).map_err(io_error)?;

        report.files_written += 1;
        report.bytes_written += written;
        Ok(())
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract with the default size cap
pub fn safe_extract<R: Read>(reader: R, destination: &Path) -> ExtractResult<ExtractionReport> {
    Extractor::new().extract(reader, destination)
}

/// Whether `target`, or a parent below `root`, is already taken by the other
/// kind of node. Links are never created, so nothing here is followed.
fn path_conflict(root: &Path, target: &Path, directory: bool) -> bool {
    let is_dir = |path: &Path| fs::symlink_metadata(path).ok().map(|m| m.is_dir());

    let parent_blocked = target
        .ancestors()
        .skip(1)
        .take_while(|ancestor| *ancestor != root)
        .any(|ancestor| is_dir(ancestor) == Some(false));

    parent_blocked || is_dir(target) == Some(!directory)
}

fn prepare_root(destination: &Path) -> ExtractResult<PathBuf> {
    let destination_error = |source| ExtractError::Destination {
        path: destination.to_path_buf(),
        source,
    };
    permissions::create_dirs(destination).map_err(destination_error)?;
    fs::canonicalize(destination).map_err(destination_error)
}

/// Copy at most `limit` bytes, keeping read failures (the archive) apart from
/// write failures (the host)
fn copy_capped<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    limit: u64,
    target: &Path,
) -> ExtractResult<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut limited = reader.take(limit);
    let mut written = 0u64;

    loop {
        let n = match limited.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::Stream(e)),
        };
        writer.write_all(&buf[..n]).map_err(|source| ExtractError::Io {
            path: target.to_path_buf(),
            source,
        })?;
        written += n as u64;
    }

    Ok(written)
}
