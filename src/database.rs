//! The backup database: a revision tree behind one lock, with persistence
//!
//! [`BackupDatabase`] owns the [`RevisionTree`] and its index file. Every read
//! and mutation goes through a single exclusive lock. After a mutation
//! commits, the lock is released and only then are change listeners called,
//! so a listener may read the database again without deadlocking.
//!
//! The index is saved atomically. Mutations are counted, and once the count
//! reaches the autosave threshold the index is written as part of the
//! mutation that crossed it.

use crate::error::{Result, VaultError};
use crate::index::{decode_tree, encode_tree, read_index, write_index};
use crate::revision::{FileRevision, Revision};
use crate::tree::{NodeId, RemovedRevision, RevisionTree};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of mutations between automatic saves
pub const DEFAULT_AUTOSAVE_THRESHOLD: usize = 50;

/// Notification posted after the database changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEvent {
    /// A mutation was committed
    Changed,
    /// The index was written to disk
    Saved,
    /// The whole tree was replaced (index recovery)
    Replaced,
}

/// Callback receiving [`DatabaseEvent`]s
pub type DatabaseListener = Arc<dyn Fn(DatabaseEvent) + Send + Sync>;

struct DatabaseState {
    tree: RevisionTree,
    unsaved: usize,
}

/// Revision tree plus index persistence and change notification
pub struct BackupDatabase {
    path: PathBuf,
    autosave_threshold: usize,
    state: Mutex<DatabaseState>,
    listeners: RwLock<Vec<DatabaseListener>>,
}

impl std::fmt::Debug for BackupDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupDatabase")
            .field("path", &self.path)
            .field("autosave_threshold", &self.autosave_threshold)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl BackupDatabase {
    /// Open the index at `path`, or start an empty tree if none exists
    ///
    /// # Arguments
    ///
    /// * `path` - Index file location
    /// * `autosave_threshold` - Mutations between automatic saves (0 disables)
    ///
    /// # Errors
    ///
    /// - [`VaultError::CorruptIndex`] or [`VaultError::Bincode`] if an
    ///   existing index cannot be decoded
    pub fn open_or_create(path: &Path, autosave_threshold: usize) -> Result<Self> {
        let tree = if path.exists() {
            read_index(path)?
        } else {
            info!("No index at {:?}, starting an empty tree", path);
            RevisionTree::new()
        };
        Ok(Self::with_tree(path, tree, autosave_threshold))
    }

    fn with_tree(path: &Path, tree: RevisionTree, autosave_threshold: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            autosave_threshold,
            state: Mutex::new(DatabaseState { tree, unsaved: 0 }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Index file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a change listener
    pub fn subscribe(&self, listener: DatabaseListener) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, event: DatabaseEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// Run a read-only query against the tree
    pub fn read<R>(&self, query: impl FnOnce(&RevisionTree) -> R) -> R {
        query(&self.state.lock().tree)
    }

    /// Apply a mutation to the tree
    ///
    /// On success the mutation is counted towards autosave and listeners are
    /// notified once the lock has been released. A failed mutation counts
    /// for nothing.
    pub fn mutate<R>(&self, mutation: impl FnOnce(&mut RevisionTree) -> Result<R>) -> Result<R> {
        let mut saved = false;
        let result = {
            let mut state = self.state.lock();
            let result = mutation(&mut state.tree)?;
            state.unsaved += 1;
            if self.autosave_threshold > 0 && state.unsaved >= self.autosave_threshold {
                match write_index(&self.path, &state.tree) {
                    Ok(_) => {
                        state.unsaved = 0;
                        saved = true;
                        debug!("Autosaved index after {} mutations", self.autosave_threshold);
                    }
                    Err(e) => warn!("Autosave of {:?} failed: {}", self.path, e),
                }
            }
            result
        };
        self.notify(DatabaseEvent::Changed);
        if saved {
            self.notify(DatabaseEvent::Saved);
        }
        Ok(result)
    }

    /// Write the index now
    ///
    /// Returns the index size in bytes.
    pub fn save(&self) -> Result<u64> {
        let written = {
            let mut state = self.state.lock();
            let written = write_index(&self.path, &state.tree)?;
            state.unsaved = 0;
            written
        };
        self.notify(DatabaseEvent::Saved);
        Ok(written)
    }

    /// Mutations since the last save
    pub fn unsaved_changes(&self) -> usize {
        self.state.lock().unsaved
    }

    /// Current tree in index format
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.read(encode_tree)
    }

    /// Replace the whole tree with one decoded from index bytes
    pub fn replace_from_index(&self, bytes: &[u8]) -> Result<()> {
        let tree = decode_tree(bytes)?;
        {
            let mut state = self.state.lock();
            state.tree = tree;
            state.unsaved += 1;
        }
        self.notify(DatabaseEvent::Replaced);
        Ok(())
    }

    /// See [`RevisionTree::record_file_revision`]
    pub fn record_file_revision(&self, path: &Path, revision: FileRevision) -> Result<NodeId> {
        self.mutate(|tree| tree.record_file_revision(path, revision))
    }

    /// See [`RevisionTree::update_directory_membership`]
    pub fn update_directory_membership<S: AsRef<str>>(
        &self,
        path: &Path,
        date: DateTime<Utc>,
        present: &[S],
    ) -> Result<Vec<String>> {
        self.mutate(|tree| tree.update_directory_membership(path, date, present))
    }

    /// See [`RevisionTree::remove_file_revision`]
    pub fn remove_file_revision(&self, id: NodeId, date: DateTime<Utc>) -> Result<RemovedRevision> {
        self.mutate(|tree| tree.remove_file_revision(id, date))
    }

    /// Revision of `path` governing `as_of`
    pub fn find_revision(&self, path: &Path, as_of: Option<DateTime<Utc>>) -> Option<Revision> {
        self.read(|tree| tree.find_revision(path, as_of).cloned())
    }

    /// Full history of `path`
    pub fn history(&self, path: &Path) -> Vec<Revision> {
        self.read(|tree| tree.history(path).to_vec())
    }

    /// Stored bytes under `path` (cached aggregate)
    pub fn backed_up_size(&self, path: &Path) -> Result<u64> {
        self.read(|tree| {
            tree.find_node(path)
                .and_then(|id| tree.backed_up_size(id))
                .ok_or_else(|| VaultError::NotFound(path.to_path_buf()))
        })
    }
}
