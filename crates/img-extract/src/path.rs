//! Archive path sanitization

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Why a declared archive path was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRejection {
    /// The cleaned path still contains a `..` segment
    ParentTraversal,
    /// Joining the cleaned path to the root left the root
    EscapesRoot,
    /// A drive or UNC prefix, which has no meaning inside a container filesystem
    Prefixed,
}

impl std::fmt::Display for PathRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathRejection::ParentTraversal => write!(f, "path traversal detected"),
            PathRejection::EscapesRoot => write!(f, "path escapes destination directory"),
            PathRejection::Prefixed => write!(f, "path carries a platform prefix"),
        }
    }
}

/// Clean a declared archive path into a path relative to the extraction root.
///
/// Leading slashes and `.` segments are dropped. Any remaining `..` segment
/// rejects the whole path; `..` is never resolved against earlier segments.
pub fn clean_relative(name: &str) -> Result<PathBuf, PathRejection> {
    let mut clean = PathBuf::new();

    for component in Path::new(name).components() {
        match component {
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir => return Err(PathRejection::ParentTraversal),
            Component::Prefix(_) => return Err(PathRejection::Prefixed),
            Component::Normal(segment) => clean.push(segment),
        }
    }

    Ok(clean)
}

/// Resolve a declared archive path to an absolute destination under `root`.
///
/// `root` must already be absolute and canonical. The result is either `root`
/// itself or a path whose components begin with all of `root`'s components.
pub fn sanitize_path(name: &str, root: &Path) -> Result<PathBuf, PathRejection> {
    let relative = clean_relative(name)?;
    let full = root.join(&relative);

    if full != root && !full.starts_with(root) {
        return Err(PathRejection::EscapesRoot);
    }

    Ok(full)
}
