//! Storage backends
//!
//! A [`FileStore`] holds the encoded content of file revisions under the
//! revision guid. The vault only ever talks to a [`CoordinatingFileStore`],
//! which admits each new file to the first configured sub-store with room
//! for it and routes restores and deletions by the identifier's handler name.
//!
//! | Backend | Kind name | Holds bytes in |
//! |---|---|---|
//! | [`LocalDiskFileStore`] | `local_disk` | sharded files under a directory |
//! | [`GMailFileStore`] | `gmail` | one mail message per chunk |
//! | [`NoopFileStore`] | `noop` | nowhere (test double) |
//!
//! Stores never call back into the vault while holding their own locks;
//! observers learn about changes through [`StoreEvent`]s delivered after the
//! fact.

use crate::error::Result;
use crate::progress::TransferProgress;
use crate::revision::RevisionIdentifier;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

pub mod coordinating;
pub mod gmail;
pub mod local;
pub mod mailbox;
pub mod noop;
pub mod registry;
pub mod webmail;

pub use coordinating::CoordinatingFileStore;
pub use gmail::{GMail, GMailFileStore};
pub use local::{LocalDiskFileStore, LocalDiskSettings};
pub use mailbox::{MailTransport, MemoryMailbox, MessageSummary, Quota};
pub use noop::{NoopFileStore, NoopSettings};
pub use registry::{StoreContext, StoreKind, StoreRegistry, StoreSettings};
pub use webmail::{WebMailFileStore, WebMailProvider, WebMailSettings};

/// Change observed on a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Content was written
    ContentStored {
        /// Store that holds it
        store: String,
        /// Guid it was stored under
        guid: String,
        /// Bytes charged
        bytes: u64,
    },
    /// Content was removed
    ContentDeleted {
        /// Store that held it
        store: String,
        /// Guid it was stored under
        guid: String,
    },
    /// Available capacity changed for a reason other than a store or delete
    AvailabilityChanged {
        /// Store whose capacity changed
        store: String,
    },
}

/// Callback receiving [`StoreEvent`]s
pub type StoreListener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Listener list shared by every store implementation
#[derive(Default, Clone)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<StoreListener>>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listeners({})", self.inner.read().len())
    }
}

impl Listeners {
    /// Add a listener
    pub fn push(&self, listener: StoreListener) {
        self.inner.write().push(listener);
    }

    /// Deliver an event to every listener
    ///
    /// The list is copied first so no lock is held during callbacks.
    pub fn emit(&self, event: &StoreEvent) {
        let listeners = self.inner.read().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Capability contract of a storage backend
///
/// Implementations must be safe to share between the vault's operation
/// thread and its maintenance worker.
pub trait FileStore: Send + Sync {
    /// Unique name, recorded as the handler name of identifiers it stores
    fn name(&self) -> &str;

    /// Stable kind name of the backend
    fn kind(&self) -> StoreKind;

    /// Whether the store has what it needs to operate
    fn is_configured(&self) -> bool;

    /// Admission check for a file whose encoded size is about `estimated_size`
    fn can_backup_file(&self, source: &Path, estimated_size: u64) -> bool;

    /// Store the content of `source` under `identifier.guid`
    ///
    /// Sets `identifier.handler_name` to this store's name and returns the
    /// bytes charged to the store.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InsufficientSpace`](crate::VaultError::InsufficientSpace)
    ///   if the encoded content does not fit
    /// - [`VaultError::AuthenticationFailed`](crate::VaultError::AuthenticationFailed)
    ///   if the backend rejected its login
    /// - [`VaultError::OperationCanceled`](crate::VaultError::OperationCanceled)
    ///   if `progress` asked to stop
    /// - [`VaultError::Transport`](crate::VaultError::Transport) or
    ///   [`VaultError::Io`](crate::VaultError::Io) on other faults
    fn backup_file(
        &self,
        source: &Path,
        identifier: &mut RevisionIdentifier,
        progress: &mut dyn TransferProgress,
    ) -> Result<u64>;

    /// Fetch and decode the content for `identifier`
    ///
    /// `as_of` is the revision's backup date and selects the password epoch.
    /// Returns `Ok(None)` if the store cannot locate the content.
    fn restore_file(
        &self,
        identifier: &RevisionIdentifier,
        as_of: DateTime<Utc>,
        progress: &mut dyn TransferProgress,
    ) -> Result<Option<Vec<u8>>>;

    /// Remove the content for `identifier`
    fn delete_file(&self, identifier: &RevisionIdentifier, stored_size: u64) -> Result<()>;

    /// Bytes that can still be stored (may be slow for remote stores)
    fn available_bytes(&self) -> Result<u64>;

    /// Periodic housekeeping
    fn perform_maintenance(&self) -> Result<()> {
        Ok(())
    }

    /// Release sessions and flush state before the process exits
    fn prepare_for_shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Register for [`StoreEvent`]s
    fn subscribe(&self, listener: StoreListener);
}
