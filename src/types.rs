//! Core data types shared across vault operations
//!
//! ## Overview
//!
//! - **Phases**: [`BackupPhase`], the state machine a backup walks through
//! - **Reports**: [`Estimate`], [`BackupReport`], [`ReclaimReport`],
//!   [`RestoreReport`], returned by the vault's operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Phase of a backup operation
///
/// A backup always moves forward through these phases; `ReclaimingSpace` is
/// skipped when the estimate fits the available capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupPhase {
    /// Sizing the files that will be backed up
    Estimating,
    /// Pruning old revisions to make room
    ReclaimingSpace,
    /// Transferring changed files
    BackingUpFiles,
    /// Saving and self-backing-up the index
    RecordingIndex,
    /// Finished
    Done,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupPhase::Estimating => "estimating",
            BackupPhase::ReclaimingSpace => "reclaiming space",
            BackupPhase::BackingUpFiles => "backing up files",
            BackupPhase::RecordingIndex => "recording index",
            BackupPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Projected cost of a backup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Files that would be transferred
    pub files: usize,
    /// Their total size on disk
    pub original_bytes: u64,
    /// Projected size after compression and encryption
    pub estimated_stored_bytes: u64,
}

/// Outcome of a completed backup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupReport {
    /// Date stamped on every revision of this backup
    pub date: Option<DateTime<Utc>>,
    /// Files examined
    pub files_scanned: usize,
    /// Files skipped because they had not changed
    pub files_unchanged: usize,
    /// Files recorded with a new revision
    pub files_backed_up: usize,
    /// Of those, files whose content was already stored
    pub files_deduplicated: usize,
    /// Bytes read from disk for new revisions
    pub original_bytes: u64,
    /// Bytes newly charged to the stores
    pub stored_bytes: u64,
    /// Members recorded as deleted from directories
    pub deletions_recorded: usize,
    /// Space reclamation performed before the transfer, if any
    pub reclaimed: Option<ReclaimReport>,
}

/// Outcome of space reclamation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    /// Bytes released on the stores
    pub bytes_freed: u64,
    /// File revisions removed from the tree
    pub revisions_removed: usize,
}

/// Outcome of a completed restore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Files written
    pub files_restored: usize,
    /// Bytes written
    pub bytes_restored: u64,
    /// Where each file ended up, in restore order
    pub targets: Vec<PathBuf>,
    /// Targets that were renamed to avoid overwriting
    pub renamed: usize,
}
