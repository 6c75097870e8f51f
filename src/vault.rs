//! The vault: backups, restores and space management over a set of stores
//!
//! [`Vault`] ties the revision database, the configuration and a
//! [`CoordinatingFileStore`] together. It is assembled by [`VaultBuilder`].
//!
//! ## Backup
//!
//! A backup walks these phases, reported through
//! [`ProgressSink::phase_changed`]:
//!
//! ```text
//! Estimating ─▶ ReclaimingSpace (only if short of space) ─▶ BackingUpFiles ─▶ RecordingIndex ─▶ Done
//! ```
//!
//! 1. **Estimating**: select files, drop the unchanged ones and project the
//!    stored size of the rest.
//! 2. **ReclaimingSpace**: if the projection does not fit, prune the oldest
//!    revisions of the largest files until it does. A file's only revision
//!    is never pruned.
//! 3. **BackingUpFiles**: record directory deletions, then store each file
//!    (or reuse stored content with the same digest) and record its
//!    revision. Every revision of one backup carries the same date.
//! 4. **RecordingIndex**: save the index and back it up too, so history can
//!    be recovered from the stores alone with [`Vault::recover_index`].
//!
//! The first failure stops the walk. What was recorded up to that point is
//! saved before the error is returned.
//!
//! ## Restore
//!
//! Selections are expanded into file revisions, their common parent is
//! replaced by the restore root, and each file is written through a
//! temporary file so a failed or canceled restore leaves nothing behind at
//! the target. Existing files are never replaced unless allowed, and
//! directories never are: such targets get a `name (n).ext` variant.
//!
//! ## Concurrency
//!
//! One backup, restore, reclaim or recovery runs at a time; a second
//! concurrent call fails with [`VaultError::Busy`]. Store notifications only
//! flag the cached availability as stale and never take vault locks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vaultkeeper::{BackupSpecification, RestoreSpecification, VaultBuilder, VaultConfiguration};
//! use vaultkeeper::progress::SilentProgress;
//! use vaultkeeper::store::{StoreRegistry, StoreSettings, LocalDiskSettings};
//! use std::sync::Arc;
//!
//! # fn main() -> vaultkeeper::Result<()> {
//! let config = Arc::new(VaultConfiguration::create_default("vault.json".as_ref())?);
//! config.add_store(StoreSettings::LocalDisk(LocalDiskSettings {
//!     name: "disk".to_string(),
//!     root: "/mnt/backup".into(),
//!     capacity: 100 * 1024 * 1024 * 1024,
//!     fan_out: 2,
//! }))?;
//!
//! let vault = VaultBuilder::new("vault.idx", config)
//!     .stores_from_registry(StoreRegistry::with_defaults())
//!     .build()?;
//! let report = vault.backup(&BackupSpecification::new().include("/home/me"), &SilentProgress)?;
//! println!("{} files backed up", report.files_backed_up);
//!
//! vault.restore(&RestoreSpecification::new("/tmp/restored").latest("/home/me/notes.txt"), &SilentProgress)?;
//! # Ok(())
//! # }
//! ```

use crate::compression::CompressionStrategy;
use crate::config::{IndexRecord, VaultConfiguration};
use crate::database::{BackupDatabase, DEFAULT_AUTOSAVE_THRESHOLD};
use crate::digest::ContentDigest;
use crate::error::{Result, VaultError};
use crate::progress::{FileTransferProgress, ProgressSink, Unobserved};
use crate::revision::{FileRevision, Revision, RevisionIdentifier};
use crate::spec::{BackupSpecification, Candidate, RestoreSelection, RestoreSpecification, Selection};
use crate::store::{CoordinatingFileStore, FileStore, StoreContext, StoreEvent, StoreRegistry};
use crate::transport::Pipeline;
use crate::types::{BackupPhase, BackupReport, Estimate, ReclaimReport, RestoreReport};
use crate::utils::{common_ancestor, uniquify_path};
use crate::worker::MaintenanceWorker;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, trace, warn};

/// Default lifetime of the cached available-bytes figure
pub const DEFAULT_AVAILABILITY_REFRESH: Duration = Duration::from_secs(60);

/// Modification times within this much of the last backup count as unchanged
pub const MODIFICATION_TOLERANCE_SECS: i64 = 1;

/// Name of the coordinating store the vault talks to
const COORDINATOR_NAME: &str = "vault";

#[derive(Debug, Default)]
struct Availability {
    bytes: Option<u64>,
    refreshed: Option<Instant>,
}

/// Files of a selection that need a new revision
#[derive(Debug, Default)]
struct BackupPlan {
    estimate: Estimate,
    changed: Vec<Candidate>,
    unchanged: usize,
}

/// Clears the busy flag when the operation ends, however it ends
struct OperationGuard<'a>(&'a AtomicBool);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Backup engine over a revision database and a set of stores
pub struct Vault {
    database: Arc<BackupDatabase>,
    config: Arc<VaultConfiguration>,
    pipeline: Arc<Pipeline>,
    store: Arc<CoordinatingFileStore>,
    internal_paths: Vec<PathBuf>,
    busy: AtomicBool,
    availability: Mutex<Availability>,
    availability_stale: Arc<AtomicBool>,
    availability_refresh: Duration,
    worker: Mutex<Option<MaintenanceWorker>>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("index", &self.database.path())
            .field("store", &self.store)
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .finish()
    }
}

impl Vault {
    /// The revision database
    pub fn database(&self) -> &BackupDatabase {
        &self.database
    }

    /// The configuration
    pub fn config(&self) -> &Arc<VaultConfiguration> {
        &self.config
    }

    /// The store every operation goes through
    pub fn store(&self) -> &Arc<CoordinatingFileStore> {
        &self.store
    }

    /// The shared transport pipeline
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Whether a backup, restore, reclaim or recovery is running
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<OperationGuard<'_>> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(VaultError::Busy);
        }
        Ok(OperationGuard(&self.busy))
    }

    /// Run `operation` bracketed by the sink's start and end callbacks
    fn observed<R>(&self, progress: &dyn ProgressSink, operation: impl FnOnce() -> Result<R>) -> Result<R> {
        progress.operation_will_start();
        let result = operation();
        match &result {
            Ok(_) => progress.operation_did_end(None, false),
            Err(e) => progress.operation_did_end(Some(e), e.is_canceled()),
        }
        result
    }

    /// Bytes the stores can still take
    ///
    /// Served from a cache that is refreshed after the configured interval
    /// or as soon as a store reports a change.
    pub fn available_bytes(&self) -> Result<u64> {
        {
            let cache = self.availability.lock();
            if let (Some(bytes), Some(refreshed)) = (cache.bytes, cache.refreshed) {
                if !self.availability_stale.load(Ordering::SeqCst)
                    && refreshed.elapsed() < self.availability_refresh
                {
                    return Ok(bytes);
                }
            }
        }
        self.refresh_availability()
    }

    /// Query the stores for available bytes now
    pub fn refresh_availability(&self) -> Result<u64> {
        self.availability_stale.store(false, Ordering::SeqCst);
        let bytes = self.store.available_bytes()?;
        *self.availability.lock() = Availability {
            bytes: Some(bytes),
            refreshed: Some(Instant::now()),
        };
        trace!("Stores report {} bytes available", bytes);
        Ok(bytes)
    }

    /// Project the cost of a backup without performing it
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidPattern`] if the specification has a bad glob
    /// - [`VaultError::Io`] or [`VaultError::WalkDir`] if scanning fails
    pub fn estimate(&self, spec: &BackupSpecification) -> Result<Estimate> {
        let selection = spec.select(&self.internal_paths)?;
        Ok(self.plan(spec, &selection).estimate)
    }

    fn plan(&self, spec: &BackupSpecification, selection: &Selection) -> BackupPlan {
        self.database.read(|tree| {
            let ratios = tree.extension_ratios();
            let mut plan = BackupPlan::default();
            for candidate in &selection.files {
                let last = tree
                    .find_node(&candidate.path)
                    .and_then(|id| tree.node(id))
                    .and_then(|node| node.last_file_revision());
                if spec.is_only_changed() && !has_changed(candidate, last) {
                    plan.unchanged += 1;
                    continue;
                }

                let ratio = last
                    .filter(|r| r.original_size > 0)
                    .map(|r| r.stored_size as f64 / r.original_size as f64)
                    .or_else(|| {
                        candidate
                            .path
                            .extension()
                            .and_then(|e| ratios.get(&e.to_string_lossy().to_lowercase()).copied())
                    })
                    .unwrap_or(1.0);
                plan.estimate.files += 1;
                plan.estimate.original_bytes += candidate.size;
                plan.estimate.estimated_stored_bytes += (candidate.size as f64 * ratio).ceil() as u64;
                plan.changed.push(candidate.clone());
            }
            plan
        })
    }

    /// Back up what `spec` selects
    ///
    /// # Arguments
    ///
    /// * `spec` - Files to consider
    /// * `progress` - Observer; returning `false` from it cancels the backup
    ///
    /// # Errors
    ///
    /// - [`VaultError::Busy`] if another operation is running
    /// - [`VaultError::InsufficientSpace`] if the backup cannot fit even
    ///   after pruning
    /// - [`VaultError::OperationCanceled`] if `progress` asked to stop
    /// - store errors, wrapped with the path of the file being processed
    #[instrument(skip(self, spec, progress))]
    pub fn backup(&self, spec: &BackupSpecification, progress: &dyn ProgressSink) -> Result<BackupReport> {
        let _guard = self.begin()?;
        self.observed(progress, || self.run_backup(spec, progress))
    }

    fn run_backup(&self, spec: &BackupSpecification, progress: &dyn ProgressSink) -> Result<BackupReport> {
        progress.phase_changed(BackupPhase::Estimating);
        let selection = spec.select(&self.internal_paths)?;
        let plan = self.plan(spec, &selection);
        let mut report = BackupReport {
            files_scanned: selection.files.len(),
            files_unchanged: plan.unchanged,
            ..BackupReport::default()
        };
        info!(
            "Backing up {} of {} file(s), about {} bytes",
            plan.estimate.files, report.files_scanned, plan.estimate.estimated_stored_bytes
        );

        let available = self.available_bytes()?;
        if plan.estimate.estimated_stored_bytes > available {
            progress.phase_changed(BackupPhase::ReclaimingSpace);
            let shortfall = plan.estimate.estimated_stored_bytes - available;
            report.reclaimed = Some(self.reclaim(shortfall)?);
        }

        progress.phase_changed(BackupPhase::BackingUpFiles);
        let date = Utc::now();
        report.date = Some(date);
        if let Err(e) = self.transfer(&selection, &plan.changed, date, progress, &mut report) {
            if let Err(save) = self.database.save() {
                warn!("Could not save the index after a failed backup: {}", save);
            }
            return Err(e);
        }

        progress.phase_changed(BackupPhase::RecordingIndex);
        self.record_index(date)?;

        progress.phase_changed(BackupPhase::Done);
        info!(
            "Backup done: {} file(s), {} deduplicated, {} bytes stored",
            report.files_backed_up, report.files_deduplicated, report.stored_bytes
        );
        Ok(report)
    }

    fn transfer(
        &self,
        selection: &Selection,
        changed: &[Candidate],
        date: DateTime<Utc>,
        progress: &dyn ProgressSink,
        report: &mut BackupReport,
    ) -> Result<()> {
        for directory in &selection.directories {
            let removed = self
                .database
                .update_directory_membership(&directory.path, date, &directory.entries)
                .map_err(|e| e.with_path(&directory.path))?;
            report.deletions_recorded += removed.len();
        }

        for candidate in changed {
            if !progress.will_process_file(&candidate.path) {
                info!("Backup canceled before {:?}", candidate.path);
                return Err(VaultError::OperationCanceled);
            }
            self.backup_file(candidate, date, progress, report)
                .map_err(|e| e.with_path(&candidate.path))?;
        }
        Ok(())
    }

    fn backup_file(
        &self,
        candidate: &Candidate,
        date: DateTime<Utc>,
        progress: &dyn ProgressSink,
        report: &mut BackupReport,
    ) -> Result<()> {
        let path = &candidate.path;
        let guid = ContentDigest::of_file(path)?.identifier();
        let existing = self.database.read(|tree| tree.find_identifier(&guid));

        let (identifier, stored_size) = match existing {
            Some((identifier, stored_size)) => {
                debug!("Content of {:?} already stored as {}", path, guid);
                report.files_deduplicated += 1;
                (identifier, stored_size)
            }
            None => {
                let mut identifier = RevisionIdentifier::new(guid);
                let mut transfer = FileTransferProgress::new(progress, path);
                let stored_size = self.store.backup_file(path, &mut identifier, &mut transfer)?;
                report.stored_bytes += stored_size;
                (identifier, stored_size)
            }
        };

        self.database.record_file_revision(
            path,
            FileRevision {
                date,
                identifier,
                original_size: candidate.size,
                stored_size,
            },
        )?;
        report.files_backed_up += 1;
        report.original_bytes += candidate.size;
        Ok(())
    }

    /// Save the index and back it up, replacing the previous index blob
    fn record_index(&self, date: DateTime<Utc>) -> Result<()> {
        let index_path = self.database.path().to_path_buf();
        self.database.save()?;

        let guid = ContentDigest::of_file(&index_path)?.identifier();
        let previous = self.config.last_index()?;
        if previous.as_ref().is_some_and(|p| p.identifier.guid == guid) {
            debug!("Index unchanged since the last backup");
            return Ok(());
        }

        let mut identifier = RevisionIdentifier::new(guid);
        let stored_size = self
            .store
            .backup_file(&index_path, &mut identifier, &mut Unobserved)
            .map_err(|e| e.with_path(&index_path))?;
        self.config.set_last_index(&IndexRecord {
            identifier,
            date,
            stored_size,
        })?;
        self.config.save()?;

        if let Some(previous) = previous {
            let in_use = self
                .database
                .read(|tree| tree.identifier_in_use(&previous.identifier.guid));
            if !in_use {
                if let Err(e) = self.store.delete_file(&previous.identifier, previous.stored_size) {
                    warn!("Could not delete the previous index blob: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Free at least `bytes` on the stores by pruning old revisions
    ///
    /// The largest files lose their oldest revisions first. A file's only
    /// revision is never pruned, and stored content is only deleted once no
    /// remaining revision refers to it.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Busy`] if another operation is running
    /// - [`VaultError::InsufficientSpace`] if pruning everything prunable
    ///   frees less than `bytes`
    #[instrument(skip(self))]
    pub fn reclaim_space(&self, bytes: u64) -> Result<ReclaimReport> {
        let _guard = self.begin()?;
        self.reclaim(bytes)
    }

    fn reclaim(&self, needed: u64) -> Result<ReclaimReport> {
        let mut candidates: BinaryHeap<(u64, Reverse<PathBuf>)> = self.database.read(|tree| {
            tree.find_largest_nodes(usize::MAX)
                .into_iter()
                .filter(|(id, _)| tree.node(*id).is_some_and(|n| n.file_revision_count() >= 2))
                .filter_map(|(id, size)| Some((size, Reverse(tree.node_path(id)?))))
                .collect()
        });

        let mut report = ReclaimReport::default();
        let result = loop {
            if report.bytes_freed >= needed {
                break Ok(());
            }
            let Some((_, Reverse(path))) = candidates.pop() else {
                break Err(VaultError::InsufficientSpace {
                    needed,
                    available: report.bytes_freed,
                });
            };

            let pruned = self.database.mutate(|tree| {
                let Some(id) = tree.find_node(&path) else {
                    return Ok(None);
                };
                let Some(oldest) = tree
                    .node(id)
                    .filter(|n| n.file_revision_count() >= 2)
                    .and_then(|n| n.revisions().iter().find_map(Revision::as_file))
                    .map(|f| f.date)
                else {
                    return Ok(None);
                };
                let removed = tree.remove_file_revision(id, oldest)?;
                let remaining = tree
                    .node(id)
                    .map(|n| (n.file_revision_count(), n.own_backed_up_size()))
                    .unwrap_or((0, 0));
                Ok(Some((removed, remaining)))
            });
            let (removed, (count, size)) = match pruned {
                Ok(Some(pruned)) => pruned,
                Ok(None) => continue,
                Err(e) => break Err(e),
            };

            report.revisions_removed += 1;
            debug!("Pruned revision of {:?} dated {}", removed.path, removed.revision.date);
            if removed.last_reference {
                let revision = &removed.revision;
                if let Err(e) = self.store.delete_file(&revision.identifier, revision.stored_size) {
                    break Err(e.with_path(&removed.path));
                }
                report.bytes_freed += revision.stored_size;
            }
            if count >= 2 {
                candidates.push((size, Reverse(path)));
            }
        };

        if report.revisions_removed > 0 {
            self.database.save()?;
        }
        info!(
            "Reclaimed {} bytes from {} revision(s)",
            report.bytes_freed, report.revisions_removed
        );
        result.map(|_| report)
    }

    /// Restore what `spec` selects
    ///
    /// # Errors
    ///
    /// - [`VaultError::Busy`] if another operation is running
    /// - [`VaultError::NotFound`] if a selected path has nothing to restore
    /// - [`VaultError::ContentNotFound`] if a store lost the content
    /// - [`VaultError::OperationCanceled`] if `progress` asked to stop
    #[instrument(skip(self, spec, progress))]
    pub fn restore(&self, spec: &RestoreSpecification, progress: &dyn ProgressSink) -> Result<RestoreReport> {
        let _guard = self.begin()?;
        self.observed(progress, || self.run_restore(spec, progress))
    }

    fn run_restore(&self, spec: &RestoreSpecification, progress: &dyn ProgressSink) -> Result<RestoreReport> {
        let mut items: Vec<(PathBuf, FileRevision)> = Vec::new();
        for selection in spec.selections() {
            match selection {
                RestoreSelection::Path { path, as_of } => {
                    let found = self.database.read(|tree| tree.file_revisions_as_of(path, *as_of));
                    if found.is_empty() {
                        return Err(VaultError::NotFound(path.clone()));
                    }
                    items.extend(found);
                }
                RestoreSelection::Revision { path, revision } => {
                    items.push((path.clone(), revision.clone()));
                }
            }
        }

        let prefix = common_ancestor(
            spec.selections()
                .iter()
                .map(|s| s.path().parent().unwrap_or_else(|| s.path())),
        )
        .unwrap_or_default();
        debug!("Restoring {} file(s) from under {:?}", items.len(), prefix);

        let mut report = RestoreReport::default();
        for (path, revision) in &items {
            if !progress.will_process_file(path) {
                info!("Restore canceled before {:?}", path);
                return Err(VaultError::OperationCanceled);
            }
            let relative = path.strip_prefix(&prefix).unwrap_or(path.as_path());
            let relative: PathBuf = relative
                .components()
                .filter(|c| matches!(c, std::path::Component::Normal(_)))
                .collect();
            let target = self.restore_target(&spec.restore_root().join(relative), spec.allows_overwrite(), &mut report);
            let written = self
                .restore_file(path, revision, &target, progress)
                .map_err(|e| e.with_path(path))?;
            report.files_restored += 1;
            report.bytes_restored += written;
            report.targets.push(target);
        }
        info!("Restored {} file(s), {} bytes", report.files_restored, report.bytes_restored);
        Ok(report)
    }

    fn restore_target(&self, target: &Path, overwrite: bool, report: &mut RestoreReport) -> PathBuf {
        let Ok(metadata) = fs::symlink_metadata(target) else {
            return target.to_path_buf();
        };
        if overwrite && !metadata.is_dir() {
            return target.to_path_buf();
        }
        let unique = uniquify_path(target);
        if unique != target {
            report.renamed += 1;
            debug!("{:?} exists, restoring to {:?}", target, unique);
        }
        unique
    }

    fn restore_file(
        &self,
        path: &Path,
        revision: &FileRevision,
        target: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64> {
        let mut transfer = FileTransferProgress::new(progress, path);
        let content = self
            .store
            .restore_file(&revision.identifier, revision.date, &mut transfer)?
            .ok_or_else(|| VaultError::ContentNotFound(revision.identifier.guid.clone()))?;

        let parent = target
            .parent()
            .ok_or_else(|| VaultError::internal(format!("restore target {target:?} has no parent")))?;
        fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(&content)?;
        temp.as_file().sync_all()?;
        temp.persist(target).map_err(|e| e.error)?;
        trace!("Restored {:?} to {:?}", path, target);
        Ok(content.len() as u64)
    }

    /// Rebuild the revision database from the last backed-up index
    ///
    /// # Errors
    ///
    /// - [`VaultError::ContentNotFound`] if no index was ever backed up, or
    ///   the store no longer has it
    /// - [`VaultError::CorruptIndex`] if the fetched index does not decode
    #[instrument(skip(self))]
    pub fn recover_index(&self) -> Result<()> {
        let _guard = self.begin()?;
        let record = self
            .config
            .last_index()?
            .ok_or_else(|| VaultError::ContentNotFound("no index has been backed up".to_string()))?;
        let bytes = self
            .store
            .restore_file(&record.identifier, record.date, &mut Unobserved)?
            .ok_or_else(|| VaultError::ContentNotFound(record.identifier.guid.clone()))?;
        self.database.replace_from_index(&bytes)?;
        self.database.save()?;
        info!("Recovered index backed up at {}", record.date);
        Ok(())
    }

    /// Revisions of `path`, oldest first
    pub fn history(&self, path: &Path) -> Vec<Revision> {
        self.database.history(path)
    }

    /// Revision of `path` governing `as_of` (latest if `None`)
    pub fn find_revision(&self, path: &Path, as_of: Option<DateTime<Utc>>) -> Option<Revision> {
        self.database.find_revision(path, as_of)
    }

    /// Members of the directory at `path` as of a date
    pub fn list(&self, path: &Path, as_of: Option<DateTime<Utc>>) -> Option<BTreeSet<String>> {
        self.database.read(|tree| tree.children_as_of(path, as_of))
    }

    /// Stored bytes under `path`
    pub fn backed_up_size(&self, path: &Path) -> Result<u64> {
        self.database.backed_up_size(path)
    }

    /// Run store housekeeping and refresh the availability cache
    pub fn perform_maintenance(&self) -> Result<()> {
        self.store.perform_maintenance()?;
        self.refresh_availability()?;
        Ok(())
    }

    fn maintenance_tick(&self) {
        if self.is_busy() {
            trace!("Skipping maintenance while an operation runs");
            return;
        }
        if let Err(e) = self.perform_maintenance() {
            warn!("Periodic maintenance failed: {}", e);
        }
    }

    /// Stop the worker, persist state and release store sessions
    pub fn shutdown(&self) -> Result<()> {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
        self.database.save()?;
        self.config.save()?;
        self.store.prepare_for_shutdown()?;
        info!("Vault shut down");
        Ok(())
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

/// Whether a file differs from its last backed-up revision
fn has_changed(candidate: &Candidate, last: Option<&FileRevision>) -> bool {
    match last {
        None => true,
        Some(last) => {
            candidate.size != last.original_size
                || candidate.modified > last.date + ChronoDuration::seconds(MODIFICATION_TOLERANCE_SECS)
        }
    }
}

/// Builder for [`Vault`]
///
/// # Default Values
///
/// - compression: [`CompressionStrategy::Fast`]
/// - autosave threshold: [`DEFAULT_AUTOSAVE_THRESHOLD`] mutations
/// - availability refresh: [`DEFAULT_AVAILABILITY_REFRESH`]
/// - maintenance: no background worker
pub struct VaultBuilder {
    index_path: PathBuf,
    config: Arc<VaultConfiguration>,
    compression: CompressionStrategy,
    pipeline: Arc<Pipeline>,
    stores: Vec<Arc<dyn FileStore>>,
    registry: Option<StoreRegistry>,
    autosave_threshold: usize,
    availability_refresh: Duration,
    maintenance_interval: Option<Duration>,
}

impl std::fmt::Debug for VaultBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultBuilder")
            .field("index_path", &self.index_path)
            .field("compression", &self.compression)
            .field("stores", &self.stores.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl VaultBuilder {
    /// Start building a vault whose index lives at `index_path`
    pub fn new(index_path: impl Into<PathBuf>, config: Arc<VaultConfiguration>) -> Self {
        let compression = CompressionStrategy::default();
        Self {
            index_path: index_path.into(),
            pipeline: Arc::new(Pipeline::new(config.clone(), compression.clone())),
            config,
            compression,
            stores: Vec::new(),
            registry: None,
            autosave_threshold: DEFAULT_AUTOSAVE_THRESHOLD,
            availability_refresh: DEFAULT_AVAILABILITY_REFRESH,
            maintenance_interval: None,
        }
    }

    /// Set the compression strategy
    ///
    /// Stores built afterwards from [`pipeline`](Self::pipeline) or the
    /// registry use it.
    pub fn compression(mut self, strategy: CompressionStrategy) -> Self {
        self.pipeline = Arc::new(Pipeline::new(self.config.clone(), strategy.clone()));
        self.compression = strategy;
        self
    }

    /// Pipeline to hand to stores constructed by the caller
    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    /// Add a store; stores are tried in the order added
    pub fn store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Also build every store in the configuration with `registry`
    ///
    /// They come after stores added with [`store`](Self::store).
    pub fn stores_from_registry(mut self, registry: StoreRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Mutations between automatic index saves (0 disables)
    pub fn autosave_threshold(mut self, threshold: usize) -> Self {
        self.autosave_threshold = threshold;
        self
    }

    /// How long the available-bytes figure is trusted
    pub fn availability_refresh(mut self, interval: Duration) -> Self {
        self.availability_refresh = interval;
        self
    }

    /// Run maintenance on a background thread every `interval`
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = Some(interval);
        self
    }

    /// Open the index and assemble the vault
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if no store is configured
    /// - [`VaultError::UnknownStore`] if the registry cannot build a
    ///   configured store
    /// - index decoding errors
    pub fn build(self) -> Result<Arc<Vault>> {
        let mut stores = self.stores;
        if let Some(registry) = &self.registry {
            let context = StoreContext {
                pipeline: self.pipeline.clone(),
                config: self.config.clone(),
            };
            for settings in self.config.stores() {
                stores.push(registry.build(&settings, &context)?);
            }
        }
        if stores.is_empty() {
            return Err(VaultError::InvalidConfiguration("no store is configured".to_string()));
        }
        let store = Arc::new(
            CoordinatingFileStore::new(COORDINATOR_NAME, stores)?.with_pipeline(self.pipeline.clone()),
        );
        if !store.is_configured() {
            warn!("None of the stores is fully configured");
        }

        let availability_stale = Arc::new(AtomicBool::new(true));
        let stale = availability_stale.clone();
        store.subscribe(Arc::new(move |event: &StoreEvent| {
            trace!("Store event {:?}", event);
            stale.store(true, Ordering::SeqCst);
        }));

        let database = Arc::new(BackupDatabase::open_or_create(&self.index_path, self.autosave_threshold)?);
        let mut internal_paths = vec![std::path::absolute(&self.index_path)?];
        if let Some(config_path) = self.config.path() {
            internal_paths.push(std::path::absolute(config_path)?);
        }

        let vault = Arc::new(Vault {
            database,
            config: self.config,
            pipeline: self.pipeline,
            store,
            internal_paths,
            busy: AtomicBool::new(false),
            availability: Mutex::new(Availability::default()),
            availability_stale,
            availability_refresh: self.availability_refresh,
            worker: Mutex::new(None),
        });

        if let Some(interval) = self.maintenance_interval {
            let weak: Weak<Vault> = Arc::downgrade(&vault);
            let worker = MaintenanceWorker::spawn("vaultkeeper-maintenance", interval, move || {
                if let Some(vault) = weak.upgrade() {
                    vault.maintenance_tick();
                }
            })?;
            *vault.worker.lock() = Some(worker);
        }
        info!("Vault ready with index {:?}", self.index_path);
        Ok(vault)
    }
}
