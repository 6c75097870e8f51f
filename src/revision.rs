//! Revisions: dated facts about one node of the namespace
//!
//! A node's history is a list of [`Revision`]s in strictly increasing date
//! order. A [`FileRevision`] says "this path was a file with this content";
//! a [`DirectoryRevision`] says "this path was a directory, and since the
//! previous directory state these members were added and these removed".
//!
//! Directory revisions are deltas. The member set as of a date is rebuilt by
//! scanning back from the governing revision to the start of its run of
//! consecutive directory revisions (a file revision, or the beginning of the
//! history, resets the state) and replaying the deltas forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Key of stored content plus the backend that owns the bytes
///
/// Equality used for deduplication is by `guid` alone; `handler_name` only
/// says where to look the bytes up.
#[derive(Debug, Clone, Serialize, Deserialize, Eq)]
pub struct RevisionIdentifier {
    /// Content-derived (or, for legacy entries, random) identifier
    pub guid: String,
    /// Name of the store holding the bytes (empty until stored)
    pub handler_name: String,
}

impl RevisionIdentifier {
    /// Identifier not yet assigned to a store
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            handler_name: String::new(),
        }
    }

    /// Identifier held by a named store
    pub fn with_handler(guid: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            handler_name: handler_name.into(),
        }
    }

    /// Identifier using a random guid, as older backups did
    pub fn legacy() -> Self {
        Self::new(crate::digest::legacy_identifier())
    }
}

impl PartialEq for RevisionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl std::hash::Hash for RevisionIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.guid.hash(state);
    }
}

/// "Was this file" at a date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRevision {
    /// When the backup recorded this revision
    pub date: DateTime<Utc>,
    /// Where the content lives
    pub identifier: RevisionIdentifier,
    /// Size of the file on disk
    pub original_size: u64,
    /// Size after compression and encryption, as charged to the store
    pub stored_size: u64,
}

/// "Was a directory; these members changed" at a date
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectoryRevision {
    /// When the change was recorded
    pub date: DateTime<Utc>,
    /// Members added since the previous directory state
    pub added: BTreeSet<String>,
    /// Members removed since the previous directory state
    pub removed: BTreeSet<String>,
}

impl DirectoryRevision {
    /// An empty delta at a date
    pub fn new(date: DateTime<Utc>) -> Self {
        Self {
            date,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Record that `name` became a member in this delta
    pub fn add_member(&mut self, name: &str) {
        if !self.removed.remove(name) {
            self.added.insert(name.to_string());
        }
    }

    /// Record that `name` stopped being a member in this delta
    pub fn remove_member(&mut self, name: &str) {
        if !self.added.remove(name) {
            self.removed.insert(name.to_string());
        }
    }

    /// Apply this delta to a member set
    pub fn apply(&self, members: &mut BTreeSet<String>) {
        for name in &self.removed {
            members.remove(name);
        }
        for name in &self.added {
            members.insert(name.clone());
        }
    }
}

/// One dated fact about a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Revision {
    /// The node was a file
    File(FileRevision),
    /// The node was a directory
    Directory(DirectoryRevision),
}

impl Revision {
    /// Date of the revision
    pub fn date(&self) -> DateTime<Utc> {
        match self {
            Revision::File(file) => file.date,
            Revision::Directory(dir) => dir.date,
        }
    }

    /// Whether this is a directory revision
    pub fn is_directory(&self) -> bool {
        matches!(self, Revision::Directory(_))
    }

    /// The file revision, if this is one
    pub fn as_file(&self) -> Option<&FileRevision> {
        match self {
            Revision::File(file) => Some(file),
            Revision::Directory(_) => None,
        }
    }

    /// The directory revision, if this is one
    pub fn as_directory(&self) -> Option<&DirectoryRevision> {
        match self {
            Revision::Directory(dir) => Some(dir),
            Revision::File(_) => None,
        }
    }
}

/// Index of the revision governing `as_of` (latest with date <= as_of)
///
/// `None` for `as_of` means the most recent revision. Revisions are scanned
/// from most recent backward.
pub(crate) fn governing_index(revisions: &[Revision], as_of: Option<DateTime<Utc>>) -> Option<usize> {
    match as_of {
        None => revisions.len().checked_sub(1),
        Some(date) => revisions.iter().rposition(|r| r.date() <= date),
    }
}

/// Member set of a directory whose governing revision is at `index`
///
/// Returns `None` if that revision is a file revision.
pub(crate) fn members_at(revisions: &[Revision], index: usize) -> Option<BTreeSet<String>> {
    if !revisions.get(index)?.is_directory() {
        return None;
    }
    let mut start = index;
    while start > 0 && revisions[start - 1].is_directory() {
        start -= 1;
    }
    let mut members = BTreeSet::new();
    for revision in &revisions[start..=index] {
        if let Revision::Directory(dir) = revision {
            dir.apply(&mut members);
        }
    }
    Some(members)
}
