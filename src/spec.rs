//! What to back up and what to restore
//!
//! ## Backup selection
//!
//! A [`BackupSpecification`] lists root paths to include and subtrees to
//! leave out, optionally narrowed by glob patterns and a size limit.
//! [`BackupSpecification::select`] walks the roots once and yields:
//!
//! - the candidate files, each with its size and modification time
//! - every directory scanned, with the names actually present on disk, so
//!   that members which disappeared can be recorded as deleted
//!
//! Glob patterns match either the full path or the bare file name, so
//! `*.tmp` and `/home/*/cache/**` both work as expected.
//!
//! ```rust,no_run
//! use vaultkeeper::spec::BackupSpecification;
//!
//! # fn main() -> vaultkeeper::Result<()> {
//! let selection = BackupSpecification::new()
//!     .include("/home/me/Documents")
//!     .exclude("/home/me/Documents/scratch")
//!     .exclude_glob("*.tmp")
//!     .max_file_size(512 * 1024 * 1024)
//!     .select(&[])?;
//! println!("{} candidate files", selection.files.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Restore selection
//!
//! A [`RestoreSpecification`] names paths (restored as they were at a date,
//! or at their latest revision) or exact revisions, a directory to restore
//! into, and whether existing files may be overwritten.

use crate::error::{Result, VaultError};
use crate::revision::FileRevision;
use crate::utils::{is_hidden, modified_time};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// A file picked for backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Absolute path
    pub path: PathBuf,
    /// Size on disk
    pub size: u64,
    /// Last modification
    pub modified: DateTime<Utc>,
}

/// A directory visited during selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDirectory {
    /// Absolute path
    pub path: PathBuf,
    /// Names of every entry present on disk, filtered or not
    pub entries: Vec<String>,
}

/// Result of [`BackupSpecification::select`]
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Candidate files in path order
    pub files: Vec<Candidate>,
    /// Scanned directories in path order
    pub directories: Vec<ScannedDirectory>,
}

impl Selection {
    /// Total size of the candidate files
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|c| c.size).sum()
    }
}

/// Which files a backup covers
#[derive(Debug, Clone)]
pub struct BackupSpecification {
    includes: Vec<PathBuf>,
    excludes: Vec<PathBuf>,
    include_globs: Vec<String>,
    exclude_globs: Vec<String>,
    max_file_size: u64,
    only_changed: bool,
    skip_hidden: bool,
}

impl Default for BackupSpecification {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupSpecification {
    /// Empty specification: only changed files, hidden files skipped, no
    /// size limit
    pub fn new() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            max_file_size: 0,
            only_changed: true,
            skip_hidden: true,
        }
    }

    /// Back up `path` (a file or a whole directory tree)
    pub fn include(mut self, path: impl Into<PathBuf>) -> Self {
        self.includes.push(path.into());
        self
    }

    /// Leave out `path` and everything below it
    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.excludes.push(path.into());
        self
    }

    /// Only back up files matching `pattern` (any of, if given several times)
    pub fn include_glob(mut self, pattern: impl Into<String>) -> Self {
        self.include_globs.push(pattern.into());
        self
    }

    /// Skip files matching `pattern`
    pub fn exclude_glob(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_globs.push(pattern.into());
        self
    }

    /// Skip files larger than `bytes` (0 = unlimited)
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Whether unchanged files are left out of the backup
    pub fn only_changed(mut self, only_changed: bool) -> Self {
        self.only_changed = only_changed;
        self
    }

    /// Whether dot-files and dot-directories are skipped
    pub fn skip_hidden(mut self, skip_hidden: bool) -> Self {
        self.skip_hidden = skip_hidden;
        self
    }

    /// Included roots
    pub fn includes(&self) -> &[PathBuf] {
        &self.includes
    }

    /// Whether unchanged files are left out
    pub fn is_only_changed(&self) -> bool {
        self.only_changed
    }

    /// Walk the included roots
    ///
    /// `internal` lists paths that are never selected, whatever the
    /// patterns say (the vault's own index and configuration).
    ///
    /// Missing roots are skipped with a warning. Symbolic links are
    /// neither followed nor selected.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidPattern`] if a glob does not compile
    /// - [`VaultError::WalkDir`] or [`VaultError::Io`] if a directory cannot
    ///   be read
    pub fn select(&self, internal: &[PathBuf]) -> Result<Selection> {
        let filter = Filter {
            include: compile(&self.include_globs)?,
            exclude: compile(&self.exclude_globs)?.unwrap_or_else(GlobSet::empty),
            excludes: self.excludes.iter().map(|p| absolute(p)).collect::<Result<_>>()?,
            internal: internal.to_vec(),
            max_file_size: self.max_file_size,
            skip_hidden: self.skip_hidden,
        };

        let mut files = BTreeMap::new();
        let mut directories = BTreeMap::new();
        for root in &self.includes {
            let root = absolute(root)?;
            if fs::symlink_metadata(&root).is_err() {
                warn!("Skipping missing backup root {:?}", root);
                continue;
            }
            if filter.prunes(&root, false) {
                debug!("Backup root {:?} is excluded", root);
                continue;
            }

            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !filter.prunes(entry.path(), true));
            for entry in walker {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    let mut entries = Vec::new();
                    for child in fs::read_dir(path)? {
                        entries.push(child?.file_name().to_string_lossy().into_owned());
                    }
                    entries.sort();
                    directories.insert(
                        path.to_path_buf(),
                        ScannedDirectory {
                            path: path.to_path_buf(),
                            entries,
                        },
                    );
                } else if file_type.is_file() {
                    let metadata = entry.metadata()?;
                    if !filter.admits_file(path, metadata.len()) {
                        trace!("Filtered out {:?}", path);
                        continue;
                    }
                    files.insert(
                        path.to_path_buf(),
                        Candidate {
                            path: path.to_path_buf(),
                            size: metadata.len(),
                            modified: modified_time(&metadata)?,
                        },
                    );
                }
            }
        }

        debug!(
            "Selected {} file(s) in {} director(ies)",
            files.len(),
            directories.len()
        );
        Ok(Selection {
            files: files.into_values().collect(),
            directories: directories.into_values().collect(),
        })
    }
}

struct Filter {
    include: Option<GlobSet>,
    exclude: GlobSet,
    excludes: Vec<PathBuf>,
    internal: Vec<PathBuf>,
    max_file_size: u64,
    skip_hidden: bool,
}

impl Filter {
    /// Whether a subtree (or file) is cut off entirely
    fn prunes(&self, path: &Path, below_root: bool) -> bool {
        (below_root && self.skip_hidden && is_hidden(path))
            || self.excludes.iter().any(|e| path.starts_with(e))
            || self.internal.iter().any(|i| path == i)
    }

    fn admits_file(&self, path: &Path, size: u64) -> bool {
        if self.max_file_size > 0 && size > self.max_file_size {
            return false;
        }
        if matches_glob(&self.exclude, path) {
            return false;
        }
        self.include.as_ref().map_or(true, |set| matches_glob(set, path))
    }
}

fn matches_glob(set: &GlobSet, path: &Path) -> bool {
    set.is_match(path) || path.file_name().is_some_and(|name| set.is_match(name))
}

fn compile(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).map_err(|e| VaultError::InvalidPattern(format!("{pattern}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| VaultError::InvalidPattern(e.to_string()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

/// One thing to restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSelection {
    /// A file or directory as it was at `as_of` (latest if `None`)
    Path {
        /// Backed-up path
        path: PathBuf,
        /// Point in time
        as_of: Option<DateTime<Utc>>,
    },
    /// One exact file revision
    Revision {
        /// Backed-up path of the file
        path: PathBuf,
        /// The revision to restore
        revision: FileRevision,
    },
}

impl RestoreSelection {
    /// Backed-up path this selection refers to
    pub fn path(&self) -> &Path {
        match self {
            RestoreSelection::Path { path, .. } | RestoreSelection::Revision { path, .. } => path,
        }
    }
}

/// What to restore, and where
#[derive(Debug, Clone)]
pub struct RestoreSpecification {
    selections: Vec<RestoreSelection>,
    restore_root: PathBuf,
    overwrite: bool,
}

impl RestoreSpecification {
    /// Restore into `restore_root`, never overwriting
    pub fn new(restore_root: impl Into<PathBuf>) -> Self {
        Self {
            selections: Vec::new(),
            restore_root: restore_root.into(),
            overwrite: false,
        }
    }

    /// Restore `path` as of its latest revision
    pub fn latest(self, path: impl Into<PathBuf>) -> Self {
        self.select(RestoreSelection::Path {
            path: path.into(),
            as_of: None,
        })
    }

    /// Restore `path` as it was at `as_of`
    pub fn as_of(self, path: impl Into<PathBuf>, as_of: DateTime<Utc>) -> Self {
        self.select(RestoreSelection::Path {
            path: path.into(),
            as_of: Some(as_of),
        })
    }

    /// Restore one exact revision of the file at `path`
    pub fn revision(self, path: impl Into<PathBuf>, revision: FileRevision) -> Self {
        self.select(RestoreSelection::Revision {
            path: path.into(),
            revision,
        })
    }

    /// Add a selection
    pub fn select(mut self, selection: RestoreSelection) -> Self {
        self.selections.push(selection);
        self
    }

    /// Allow replacing existing files (directories are never replaced)
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Selections in the order given
    pub fn selections(&self) -> &[RestoreSelection] {
        &self.selections
    }

    /// Directory restored files are placed under
    pub fn restore_root(&self) -> &Path {
        &self.restore_root
    }

    /// Whether existing files may be replaced
    pub fn allows_overwrite(&self) -> bool {
        self.overwrite
    }
}
