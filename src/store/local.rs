//! Local disk storage backend
//!
//! Blobs are files named after their guid, spread over one to three levels
//! of two-hex-character shard directories taken from the SHA-256 of the
//! guid:
//!
//! ```text
//! root/
//! └── 3f/                 # fan_out = 2
//!     └── a9/
//!         └── 1B2M2Y8AsgTpgAmY7PhCfg.blob
//! ```
//!
//! Available space is a configured budget, not what the filesystem reports:
//! the store counts the bytes it holds (one scan at open, then updated on
//! every store and delete) and subtracts them from its capacity.

use super::{FileStore, Listeners, StoreEvent, StoreKind, StoreListener};
use crate::error::{Result, VaultError};
use crate::progress::TransferProgress;
use crate::revision::RevisionIdentifier;
use crate::transport::Pipeline;
use crate::utils::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Extension of blob files
const BLOB_EXTENSION: &str = "blob";

/// Settings of a [`LocalDiskFileStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDiskSettings {
    /// Store name
    pub name: String,
    /// Directory holding the blobs
    pub root: PathBuf,
    /// Byte budget
    pub capacity: u64,
    /// Shard directory levels (1 to 3)
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

fn default_fan_out() -> usize {
    2
}

/// Store keeping blobs in a sharded directory tree
#[derive(Debug)]
pub struct LocalDiskFileStore {
    settings: LocalDiskSettings,
    used: AtomicU64,
    pipeline: Arc<Pipeline>,
    listeners: Listeners,
}

impl LocalDiskFileStore {
    /// Open (creating if needed) the store directory and measure its usage
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if `fan_out` is not 1 to 3
    /// - [`VaultError::Io`] if the directory cannot be created or scanned
    pub fn open(settings: LocalDiskSettings, pipeline: Arc<Pipeline>) -> Result<Self> {
        if !(1..=3).contains(&settings.fan_out) {
            return Err(VaultError::InvalidConfiguration(format!(
                "fan out of store '{}' must be 1 to 3, got {}",
                settings.name, settings.fan_out
            )));
        }
        fs::create_dir_all(&settings.root)?;

        let mut used = 0u64;
        for entry in WalkDir::new(&settings.root) {
            let entry = entry?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e == BLOB_EXTENSION)
            {
                used += entry.metadata()?.len();
            }
        }
        info!(
            "Opened local store '{}' at {:?}: {} of {} bytes used",
            settings.name, settings.root, used, settings.capacity
        );

        Ok(Self {
            settings,
            used: AtomicU64::new(used),
            pipeline,
            listeners: Listeners::default(),
        })
    }

    /// Blob path for a guid
    pub fn blob_path(&self, guid: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(guid.as_bytes()));
        let mut path = self.settings.root.clone();
        for level in 0..self.settings.fan_out {
            path.push(&digest[level * 2..level * 2 + 2]);
        }
        path.push(format!("{guid}.{BLOB_EXTENSION}"));
        path
    }

    /// Bytes currently held
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| Some(u.saturating_sub(bytes)));
    }
}

impl FileStore for LocalDiskFileStore {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::LocalDisk
    }

    fn is_configured(&self) -> bool {
        self.settings.capacity > 0 && !self.settings.root.as_os_str().is_empty()
    }

    fn can_backup_file(&self, _source: &Path, estimated_size: u64) -> bool {
        self.used_bytes().saturating_add(estimated_size) <= self.settings.capacity
    }

    fn backup_file(
        &self,
        source: &Path,
        identifier: &mut RevisionIdentifier,
        progress: &mut dyn TransferProgress,
    ) -> Result<u64> {
        let path = self.blob_path(&identifier.guid);
        if let Ok(existing) = fs::metadata(&path) {
            debug!("Blob {} already on '{}'", identifier.guid, self.settings.name);
            identifier.handler_name = self.settings.name.clone();
            return Ok(existing.len());
        }

        let blob = self.pipeline.encode_file(source, progress)?;
        let size = blob.len() as u64;
        let available = self.settings.capacity.saturating_sub(self.used_bytes());
        if size > available {
            return Err(VaultError::InsufficientSpace {
                needed: size,
                available,
            });
        }
        if !progress.transferred(0) {
            return Err(VaultError::OperationCanceled);
        }

        atomic_write(&path, &blob)?;
        self.used.fetch_add(size, Ordering::SeqCst);
        identifier.handler_name = self.settings.name.clone();
        trace!("Stored {} ({} bytes) at {:?}", identifier.guid, size, path);

        self.listeners.emit(&StoreEvent::ContentStored {
            store: self.settings.name.clone(),
            guid: identifier.guid.clone(),
            bytes: size,
        });
        Ok(size)
    }

    fn restore_file(
        &self,
        identifier: &RevisionIdentifier,
        as_of: DateTime<Utc>,
        progress: &mut dyn TransferProgress,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(&identifier.guid);
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob {} missing from '{}'", identifier.guid, self.settings.name);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if !progress.transferred(blob.len() as u64) {
            return Err(VaultError::OperationCanceled);
        }
        self.pipeline.decode(&blob, as_of).map(Some)
    }

    fn delete_file(&self, identifier: &RevisionIdentifier, stored_size: u64) -> Result<()> {
        let path = self.blob_path(&identifier.guid);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Blob {} already gone", identifier.guid);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;
        if size != stored_size {
            debug!("Blob {} was {} bytes, index said {}", identifier.guid, size, stored_size);
        }
        self.release(size);

        // Drop empty shard directories on the way up
        let mut dir = path.parent();
        for _ in 0..self.settings.fan_out {
            match dir {
                Some(d) if fs::read_dir(d).map(|mut it| it.next().is_none()).unwrap_or(false) => {
                    let _ = fs::remove_dir(d);
                    dir = d.parent();
                }
                _ => break,
            }
        }

        self.listeners.emit(&StoreEvent::ContentDeleted {
            store: self.settings.name.clone(),
            guid: identifier.guid.clone(),
        });
        Ok(())
    }

    fn available_bytes(&self) -> Result<u64> {
        Ok(self.settings.capacity.saturating_sub(self.used_bytes()))
    }

    fn subscribe(&self, listener: StoreListener) {
        self.listeners.push(listener);
    }
}
