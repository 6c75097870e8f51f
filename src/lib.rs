//! # Vaultkeeper - versioned, encrypted personal backups
//!
//! A backup engine that keeps every version of every file it has seen,
//! spread over storage backends with limited capacity.
//!
//! ## Overview
//!
//! Vaultkeeper lets you:
//! - Back up directory trees, transferring only files that changed
//! - Restore any file or directory as it was at any backup date
//! - Store content compressed and encrypted under a password that can be
//!   changed without re-encrypting old backups
//! - Combine local disks and mailboxes into one pool, filled first fit
//! - Make room automatically by pruning the oldest versions of the largest
//!   files
//!
//! ## Architecture
//!
//! - **Revision tree** ([`tree`]): one node per path ever backed up, each with
//!   a date-ordered history. Files record where their content lives;
//!   directories record membership changes as deltas.
//! - **Database** ([`database`]): the tree behind a lock, persisted to an
//!   index file in the [`index`] format.
//! - **Pipeline** ([`transport`]): compress ([`compression`]), encrypt with
//!   the key of the current password epoch ([`crypto`]) and split into parts
//!   for backends with message size limits.
//! - **Stores** ([`store`]): the [`FileStore`](store::FileStore) backends and
//!   the coordinating store that routes between them.
//! - **Vault** ([`vault`]): backup, restore, estimate and reclaim over all of
//!   the above.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vaultkeeper::{BackupSpecification, RestoreSpecification, VaultBuilder, VaultConfiguration};
//! use vaultkeeper::progress::SilentProgress;
//! use vaultkeeper::store::StoreRegistry;
//! use std::sync::Arc;
//!
//! # fn main() -> vaultkeeper::Result<()> {
//! let config = Arc::new(VaultConfiguration::load("vault.json".as_ref(), Some("correct horse"))?);
//! let vault = VaultBuilder::new("vault.idx", config)
//!     .stores_from_registry(StoreRegistry::with_defaults())
//!     .build()?;
//!
//! let report = vault.backup(&BackupSpecification::new().include("/home/me/docs"), &SilentProgress)?;
//! println!("{} files backed up", report.files_backed_up);
//!
//! let yesterday = chrono::Utc::now() - chrono::Duration::days(1);
//! vault.restore(
//!     &RestoreSpecification::new("/tmp/restored").as_of("/home/me/docs", yesterday),
//!     &SilentProgress,
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`Result<T>`](Result) with a
//! [`VaultError`]. [`VaultError::kind`] groups errors into broad categories
//! and [`VaultError::is_canceled`] tells a user cancellation apart from a
//! failure, also when the error carries the path of the file involved.

pub mod collections;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod database;
pub mod digest;
pub mod error;
pub mod index;
pub mod progress;
pub mod revision;
pub mod spec;
pub mod store;
pub mod transport;
pub mod tree;
pub mod types;
pub mod utils;
pub mod vault;
pub mod worker;

pub use compression::CompressionStrategy;
pub use config::VaultConfiguration;
pub use database::BackupDatabase;
pub use error::{ErrorKind, Result, VaultError};
pub use progress::{CancellationToken, ProgressSink, TransferProgress};
pub use revision::{DirectoryRevision, FileRevision, Revision, RevisionIdentifier};
pub use spec::{BackupSpecification, RestoreSelection, RestoreSpecification};
pub use store::{FileStore, StoreKind, StoreRegistry, StoreSettings};
pub use tree::RevisionTree;
pub use types::*;
pub use vault::{Vault, VaultBuilder};
