//! Composite store over an ordered list of backends
//!
//! New content goes to the first configured backend that admits it
//! (first fit). Everything else is routed by the handler name recorded in
//! the revision identifier.
//!
//! Admission is judged on the worst-case encoded size when a [`Pipeline`]
//! is attached, the raw file size otherwise. A backend that still runs out
//! of room mid-upload passes the file on to the next one.

use super::{FileStore, Listeners, StoreEvent, StoreKind, StoreListener};
use crate::error::{Result, VaultError};
use crate::progress::TransferProgress;
use crate::revision::RevisionIdentifier;
use crate::transport::Pipeline;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Store delegating to sub-stores
pub struct CoordinatingFileStore {
    name: String,
    stores: Vec<Arc<dyn FileStore>>,
    pipeline: Option<Arc<Pipeline>>,
    listeners: Listeners,
}

impl std::fmt::Debug for CoordinatingFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stores.iter().map(|s| s.name()).collect();
        f.debug_struct("CoordinatingFileStore")
            .field("name", &self.name)
            .field("stores", &names)
            .finish()
    }
}

impl CoordinatingFileStore {
    /// Coordinate `stores`, tried in the given order
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if two stores share a name
    pub fn new(name: impl Into<String>, stores: Vec<Arc<dyn FileStore>>) -> Result<Self> {
        for (i, store) in stores.iter().enumerate() {
            if stores[..i].iter().any(|s| s.name() == store.name()) {
                return Err(VaultError::InvalidConfiguration(format!(
                    "store name '{}' is used twice",
                    store.name()
                )));
            }
        }

        let listeners = Listeners::default();
        for store in &stores {
            let relay = listeners.clone();
            store.subscribe(Arc::new(move |event: &StoreEvent| relay.emit(event)));
        }
        Ok(Self {
            name: name.into(),
            stores,
            pipeline: None,
            listeners,
        })
    }

    /// Size admission estimates by what `pipeline` may produce
    pub fn with_pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Largest stored size the content of `source` may take
    fn estimated_size(&self, source: &Path) -> Result<u64> {
        let original = std::fs::metadata(source)?.len();
        Ok(self
            .pipeline
            .as_ref()
            .map_or(original, |p| p.max_encoded_len(original)))
    }

    /// Sub-stores in admission order
    pub fn stores(&self) -> &[Arc<dyn FileStore>] {
        &self.stores
    }

    /// Sub-store called `name`
    pub fn store(&self, name: &str) -> Option<&Arc<dyn FileStore>> {
        self.stores.iter().find(|s| s.name() == name)
    }

    fn owner(&self, identifier: &RevisionIdentifier) -> Result<&Arc<dyn FileStore>> {
        self.store(&identifier.handler_name)
            .ok_or_else(|| VaultError::UnknownStore(identifier.handler_name.clone()))
    }

    fn configured(&self) -> impl Iterator<Item = &Arc<dyn FileStore>> {
        self.stores.iter().filter(|s| s.is_configured())
    }
}

impl FileStore for CoordinatingFileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        // Reports the kind of its first backend; the composite has none of its own
        self.stores.first().map_or(StoreKind::Noop, |s| s.kind())
    }

    fn is_configured(&self) -> bool {
        self.configured().next().is_some()
    }

    fn can_backup_file(&self, source: &Path, estimated_size: u64) -> bool {
        self.configured().any(|s| s.can_backup_file(source, estimated_size))
    }

    fn backup_file(
        &self,
        source: &Path,
        identifier: &mut RevisionIdentifier,
        progress: &mut dyn TransferProgress,
    ) -> Result<u64> {
        let estimated_size = self.estimated_size(source)?;
        for store in self.configured().filter(|s| s.can_backup_file(source, estimated_size)) {
            debug!("Admitting {:?} to '{}'", source, store.name());
            match store.backup_file(source, identifier, progress) {
                Err(VaultError::InsufficientSpace { needed, available }) => {
                    debug!(
                        "'{}' ran out of room ({} needed, {} available), trying the next store",
                        store.name(),
                        needed,
                        available
                    );
                }
                result => return result,
            }
        }
        Err(VaultError::InsufficientSpace {
            needed: estimated_size,
            available: self.available_bytes()?,
        })
    }

    fn restore_file(
        &self,
        identifier: &RevisionIdentifier,
        as_of: DateTime<Utc>,
        progress: &mut dyn TransferProgress,
    ) -> Result<Option<Vec<u8>>> {
        self.owner(identifier)?.restore_file(identifier, as_of, progress)
    }

    fn delete_file(&self, identifier: &RevisionIdentifier, stored_size: u64) -> Result<()> {
        self.owner(identifier)?.delete_file(identifier, stored_size)
    }

    fn available_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for store in self.configured() {
            total = total.saturating_add(store.available_bytes()?);
        }
        Ok(total)
    }

    fn perform_maintenance(&self) -> Result<()> {
        let mut first_error = None;
        for store in self.configured() {
            if let Err(e) = store.perform_maintenance() {
                warn!("Maintenance of '{}' failed: {}", store.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn prepare_for_shutdown(&self) -> Result<()> {
        for store in &self.stores {
            if let Err(e) = store.prepare_for_shutdown() {
                warn!("Shutdown of '{}' failed: {}", store.name(), e);
            }
        }
        Ok(())
    }

    fn subscribe(&self, listener: StoreListener) {
        self.listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionStrategy;
    use crate::config::VaultConfiguration;
    use crate::progress::Unobserved;
    use crate::store::{LocalDiskFileStore, LocalDiskSettings, NoopFileStore, NoopSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn noop(name: &str, capacity: u64) -> Arc<NoopFileStore> {
        Arc::new(NoopFileStore::new(NoopSettings {
            name: name.to_string(),
            capacity,
        }))
    }

    fn erased(stores: &[&Arc<NoopFileStore>]) -> Vec<Arc<dyn FileStore>> {
        stores
            .iter()
            .map(|s| Arc::clone(*s) as Arc<dyn FileStore>)
            .collect()
    }

    #[test]
    fn test_first_fit_and_dispatch() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("f");
        std::fs::write(&source, vec![0u8; 50]).unwrap();

        let small = noop("small", 10);
        let large = noop("large", 1000);
        let coordinator =
            CoordinatingFileStore::new("all", erased(&[&small, &large])).unwrap();

        let mut id = RevisionIdentifier::new("g");
        coordinator.backup_file(&source, &mut id, &mut Unobserved).unwrap();
        assert_eq!(id.handler_name, "large");
        assert_eq!((small.backup_calls(), large.backup_calls()), (0, 1));

        coordinator.delete_file(&id, 50).unwrap();
        assert_eq!(large.delete_calls(), 1);
        assert_eq!(coordinator.available_bytes().unwrap(), 1010);
    }

    fn sealed_pipeline() -> Arc<Pipeline> {
        let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
        config.change_password("vault password").unwrap();
        Arc::new(Pipeline::new(config, CompressionStrategy::None))
    }

    fn disk(dir: &TempDir, name: &str, capacity: u64, pipeline: &Arc<Pipeline>) -> Arc<dyn FileStore> {
        Arc::new(
            LocalDiskFileStore::open(
                LocalDiskSettings {
                    name: name.to_string(),
                    root: dir.path().join(name),
                    capacity,
                    fan_out: 1,
                },
                pipeline.clone(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_admission_counts_encoding_overhead() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("f");
        std::fs::write(&source, vec![7u8; 64]).unwrap();
        let pipeline = sealed_pipeline();
        assert!(pipeline.max_encoded_len(64) > 64);

        // The first disk holds exactly the raw file, not its sealed blob
        let stores = vec![
            disk(&temp_dir, "exact", 64, &pipeline),
            disk(&temp_dir, "roomy", 4096, &pipeline),
        ];
        let coordinator = CoordinatingFileStore::new("all", stores)
            .unwrap()
            .with_pipeline(pipeline);

        let mut id = RevisionIdentifier::new("g");
        let stored = coordinator.backup_file(&source, &mut id, &mut Unobserved).unwrap();
        assert_eq!(id.handler_name, "roomy");
        assert!(stored > 64);
        assert_eq!(coordinator.store("exact").unwrap().available_bytes().unwrap(), 64);
    }

    #[test]
    fn test_store_out_of_room_falls_through() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("f");
        std::fs::write(&source, vec![7u8; 64]).unwrap();
        let pipeline = sealed_pipeline();

        // No pipeline attached: the raw size admits the first disk, which
        // then finds the sealed blob too large
        let stores = vec![
            disk(&temp_dir, "exact", 64, &pipeline),
            disk(&temp_dir, "roomy", 4096, &pipeline),
        ];
        let coordinator = CoordinatingFileStore::new("all", stores).unwrap();

        let mut id = RevisionIdentifier::new("g");
        coordinator.backup_file(&source, &mut id, &mut Unobserved).unwrap();
        assert_eq!(id.handler_name, "roomy");
        let restored = coordinator.restore_file(&id, Utc::now(), &mut Unobserved).unwrap();
        assert_eq!(restored, Some(vec![7u8; 64]));
    }

    #[test]
    fn test_no_room_anywhere() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("f");
        std::fs::write(&source, vec![0u8; 50]).unwrap();
        let coordinator = CoordinatingFileStore::new("all", erased(&[&noop("a", 10), &noop("b", 20)])).unwrap();

        let err = coordinator
            .backup_file(&source, &mut RevisionIdentifier::new("g"), &mut Unobserved)
            .unwrap_err();
        match err {
            VaultError::InsufficientSpace { needed, available } => {
                assert_eq!((needed, available), (50, 30));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_handler() {
        let coordinator = CoordinatingFileStore::new("all", erased(&[&noop("a", 10)])).unwrap();
        let id = RevisionIdentifier::with_handler("g", "gone");
        assert!(matches!(coordinator.delete_file(&id, 1), Err(VaultError::UnknownStore(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(CoordinatingFileStore::new("all", erased(&[&noop("a", 1), &noop("a", 2)])).is_err());
    }

    #[test]
    fn test_events_are_relayed() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("f");
        std::fs::write(&source, b"x").unwrap();
        let coordinator = CoordinatingFileStore::new("all", erased(&[&noop("a", 10)])).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        coordinator.subscribe(Arc::new(move |event: &StoreEvent| {
            if let StoreEvent::ContentStored { store, .. } = event {
                assert_eq!(store, "a");
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        coordinator
            .backup_file(&source, &mut RevisionIdentifier::new("g"), &mut Unobserved)
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
