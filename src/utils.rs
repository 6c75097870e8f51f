//! Utility functions for vaultkeeper
//!
//! Small filesystem and formatting helpers shared by the vault, the stores
//! and the CLI.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based). Values below 1 KB are shown as whole
/// numbers, larger values with two decimal places.
///
/// # Example
///
/// ```rust
/// use vaultkeeper::utils::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write (write to a temp file in the same directory, then rename)
///
/// The target is never observed partially written. The temporary file is
/// removed if any step fails.
///
/// # Errors
///
/// - [`VaultError::Io`](crate::VaultError::Io) if the write or the rename fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Whether a path's final component is a dot-file
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Modification time of a file as a UTC timestamp
pub fn modified_time(metadata: &fs::Metadata) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

/// First free variant of `path`, as `name (n).ext`
///
/// Returns `path` itself if nothing exists there.
pub fn uniquify_path(path: &Path) -> PathBuf {
    if fs::symlink_metadata(path).is_err() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    (1u32..)
        .map(|n| {
            let name = match &extension {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            parent.join(name)
        })
        .find(|candidate| fs::symlink_metadata(candidate).is_err())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Deepest directory containing every path in `paths`
///
/// Returns `None` for an empty input.
pub fn common_ancestor<'a, I>(paths: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut iter = paths.into_iter();
    let mut common: PathBuf = iter.next()?.to_path_buf();
    for path in iter {
        while !path.starts_with(&common) {
            if !common.pop() {
                return Some(PathBuf::new());
            }
        }
    }
    Some(common)
}
