//! A store that keeps nothing
//!
//! Accepts every file, reads it through to honour progress and
//! cancellation, and counts the calls it receives. Tests use it to check
//! how often the vault actually moved bytes.

use super::{FileStore, Listeners, StoreEvent, StoreKind, StoreListener};
use crate::error::Result;
use crate::progress::{from_io_error, TransferProgress};
use crate::revision::RevisionIdentifier;
use crate::transport::ProgressReader;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Settings of a [`NoopFileStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoopSettings {
    /// Store name
    pub name: String,
    /// Reported capacity
    #[serde(default = "unlimited")]
    pub capacity: u64,
}

fn unlimited() -> u64 {
    u64::MAX
}

/// Store that discards content and counts calls
#[derive(Debug)]
pub struct NoopFileStore {
    settings: NoopSettings,
    backups: AtomicUsize,
    restores: AtomicUsize,
    deletes: AtomicUsize,
    used: AtomicU64,
    listeners: Listeners,
}

impl NoopFileStore {
    /// Create a store
    pub fn new(settings: NoopSettings) -> Self {
        Self {
            settings,
            backups: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            used: AtomicU64::new(0),
            listeners: Listeners::default(),
        }
    }

    /// Unlimited store called `name`
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(NoopSettings {
            name: name.into(),
            capacity: u64::MAX,
        })
    }

    /// `backup_file` calls that completed
    pub fn backup_calls(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    /// `restore_file` calls
    pub fn restore_calls(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    /// `delete_file` calls
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl FileStore for NoopFileStore {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Noop
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn can_backup_file(&self, _source: &Path, estimated_size: u64) -> bool {
        self.used.load(Ordering::SeqCst).saturating_add(estimated_size) <= self.settings.capacity
    }

    fn backup_file(
        &self,
        source: &Path,
        identifier: &mut RevisionIdentifier,
        progress: &mut dyn TransferProgress,
    ) -> Result<u64> {
        let mut reader = ProgressReader::new(File::open(source)?, progress);
        let size = io::copy(&mut reader, &mut io::sink()).map_err(from_io_error)?;

        identifier.handler_name = self.settings.name.clone();
        self.backups.fetch_add(1, Ordering::SeqCst);
        self.used.fetch_add(size, Ordering::SeqCst);
        self.listeners.emit(&StoreEvent::ContentStored {
            store: self.settings.name.clone(),
            guid: identifier.guid.clone(),
            bytes: size,
        });
        Ok(size)
    }

    fn restore_file(
        &self,
        _identifier: &RevisionIdentifier,
        _as_of: DateTime<Utc>,
        _progress: &mut dyn TransferProgress,
    ) -> Result<Option<Vec<u8>>> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn delete_file(&self, identifier: &RevisionIdentifier, stored_size: u64) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| Some(u.saturating_sub(stored_size)));
        self.listeners.emit(&StoreEvent::ContentDeleted {
            store: self.settings.name.clone(),
            guid: identifier.guid.clone(),
        });
        Ok(())
    }

    fn available_bytes(&self) -> Result<u64> {
        Ok(self
            .settings
            .capacity
            .saturating_sub(self.used.load(Ordering::SeqCst)))
    }

    fn subscribe(&self, listener: StoreListener) {
        self.listeners.push(listener);
    }
}
