//! Permission handling for extracted trees

use std::fs;
use std::io;
use std::path::Path;

/// Highest permission set a file may keep. No setuid, setgid, sticky, or
/// group/other write.
pub const SAFE_MODE_CEILING: u32 = 0o755;

/// Mode a file is opened with while its contents are still being written
pub const INITIAL_FILE_MODE: u32 = 0o600;

/// Mode for every directory the extractor creates
pub const DIRECTORY_MODE: u32 = 0o755;

const OWNER_READ: u32 = 0o400;
const OWNER_READ_EXEC: u32 = 0o500;

/// Final mode for an extracted file given the mode its header declared
pub fn file_mode(declared: u32) -> u32 {
    declared & SAFE_MODE_CEILING
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

pub(crate) fn create_dirs(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIRECTORY_MODE);
    }
    builder.create(path)
}

pub(crate) fn create_restricted_file(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(INITIAL_FILE_MODE);
    }
    options.open(path)
}

/// Widen owner bits across an extracted tree so analysis tools, possibly
/// running as another user, can read every file and traverse every
/// directory. Group and other bits are left as they are.
///
/// Returns how many entries had their mode changed. Entries that cannot be
/// inspected are skipped.
#[cfg(unix)]
pub fn make_readable_for_scan(root: &Path) -> usize {
    use std::os::unix::fs::PermissionsExt;

    let mut adjusted = 0;

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Skipping unreadable path during permission pass: {}", e);
                continue;
            }
        };

        let file_type = entry.file_type();
        let required = if file_type.is_dir() {
            OWNER_READ_EXEC
        } else if file_type.is_file() {
            OWNER_READ
        } else {
            continue;
        };

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let perm = metadata.permissions().mode() & 0o7777;
        let widened = perm | required;
        if widened != perm && set_mode(entry.path(), widened).is_ok() {
            adjusted += 1;
        }
    }

    adjusted
}

#[cfg(not(unix))]
pub fn make_readable_for_scan(_root: &Path) -> usize {
    0
}
