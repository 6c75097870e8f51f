//! Integration tests for vaultkeeper
//!
//! End-to-end backup and restore scenarios over real stores: history
//! navigation, change detection, deduplication, space reclamation,
//! password epochs, index recovery and the webmail backend.

use ::vaultkeeper::progress::{ProgressCounter, SilentProgress};
use ::vaultkeeper::store::{
    FileStore, GMailFileStore, LocalDiskFileStore, LocalDiskSettings, MemoryMailbox, NoopFileStore, WebMailSettings,
};
use ::vaultkeeper::*;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tracing::info;

/// A source tree, a state directory and a vault over a local disk store
pub struct VaultHarness {
    pub source: TempDir,
    pub state: TempDir,
    pub config: Arc<VaultConfiguration>,
    pub vault: Arc<Vault>,
}

impl VaultHarness {
    /// Vault over one local disk store of `capacity` bytes
    pub fn local(capacity: u64) -> Self {
        Self::with_config(Arc::new(VaultConfiguration::new(1_000).unwrap()), capacity)
    }

    /// Same, with a prepared configuration
    pub fn with_config(config: Arc<VaultConfiguration>, capacity: u64) -> Self {
        let source = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let vault = open_local(state.path(), config.clone(), capacity);
        Self {
            source,
            state,
            config,
            vault,
        }
    }

    /// Absolute path of a file in the source tree
    pub fn path(&self, relative: &str) -> PathBuf {
        std::path::absolute(self.source.path().join(relative)).unwrap()
    }

    /// Absolute path of the source tree
    pub fn root(&self) -> PathBuf {
        std::path::absolute(self.source.path()).unwrap()
    }

    /// Write a file in the source tree, creating parents
    pub fn write(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Push a file's modification time into the future so it reads as changed
    pub fn touch_later(&self, relative: &str) {
        let later = SystemTime::now() + Duration::from_secs(10);
        filetime::set_file_mtime(self.path(relative), FileTime::from_system_time(later)).unwrap();
    }

    pub fn spec(&self) -> BackupSpecification {
        BackupSpecification::new().include(self.source.path())
    }

    pub fn backup(&self) -> BackupReport {
        self.vault.backup(&self.spec(), &SilentProgress).unwrap()
    }

    /// Restore the whole source tree as of a date into a fresh directory
    pub fn restore_all(&self, as_of: Option<DateTime<Utc>>) -> (TempDir, PathBuf) {
        let out = TempDir::new().unwrap();
        let root = self.root();
        let spec = match as_of {
            Some(date) => RestoreSpecification::new(out.path()).as_of(&root, date),
            None => RestoreSpecification::new(out.path()).latest(&root),
        };
        self.vault.restore(&spec, &SilentProgress).unwrap();
        let restored = out.path().join(root.file_name().unwrap());
        (out, restored)
    }
}

fn open_local(state: &Path, config: Arc<VaultConfiguration>, capacity: u64) -> Arc<Vault> {
    let builder = VaultBuilder::new(state.join("vault.idx"), config).compression(CompressionStrategy::Fast);
    let store = LocalDiskFileStore::open(
        LocalDiskSettings {
            name: "disk".to_string(),
            root: state.join("blobs"),
            capacity,
            fan_out: 2,
        },
        builder.pipeline(),
    )
    .unwrap();
    builder.store(Arc::new(store)).build().unwrap()
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

#[test]
fn test_backup_and_restore_tree() {
    let harness = VaultHarness::local(1 << 24);
    harness.write("readme.md", b"# project");
    harness.write("src/main.rs", b"fn main() {}");
    harness.write("src/nested/deep/data.bin", &random_bytes(1, 10_000));
    harness.write("assets/logo.txt", &[b'x'; 4096]);

    let report = harness.backup();
    assert_eq!(report.files_scanned, 4);
    assert_eq!(report.files_backed_up, 4);
    assert!(report.stored_bytes > 0);

    let (_out, restored) = harness.restore_all(None);
    for relative in ["readme.md", "src/main.rs", "src/nested/deep/data.bin", "assets/logo.txt"] {
        assert_eq!(
            fs::read(restored.join(relative)).unwrap(),
            fs::read(harness.path(relative)).unwrap(),
            "{relative} differs"
        );
    }
}

#[test]
fn test_restore_previous_version() {
    let harness = VaultHarness::local(1 << 24);
    harness.write("notes.txt", b"first draft");
    let first = harness.backup().date.unwrap();

    harness.write("notes.txt", b"second draft, longer");
    let second = harness.backup();
    assert_eq!(second.files_backed_up, 1);

    let history = harness.vault.history(&harness.path("notes.txt"));
    assert_eq!(history.len(), 2);
    assert!(history[0].date() < history[1].date());

    let (_old, restored) = harness.restore_all(Some(first));
    assert_eq!(fs::read(restored.join("notes.txt")).unwrap(), b"first draft");
    let (_new, restored) = harness.restore_all(None);
    assert_eq!(fs::read(restored.join("notes.txt")).unwrap(), b"second draft, longer");
}

#[test]
fn test_deletions_are_recorded() {
    let harness = VaultHarness::local(1 << 24);
    harness.write("keep.txt", b"keep");
    harness.write("gone.txt", b"gone");
    let first = harness.backup().date.unwrap();

    fs::remove_file(harness.path("gone.txt")).unwrap();
    let second = harness.backup();
    assert_eq!(second.deletions_recorded, 1);

    let root = harness.root();
    let now: Vec<String> = harness.vault.list(&root, None).unwrap().into_iter().collect();
    assert_eq!(now, vec!["keep.txt".to_string()]);
    let then = harness.vault.list(&root, Some(first)).unwrap();
    assert!(then.contains("gone.txt"));

    let (_out, restored) = harness.restore_all(None);
    assert!(!restored.join("gone.txt").exists());
    let (_out, restored) = harness.restore_all(Some(first));
    assert_eq!(fs::read(restored.join("gone.txt")).unwrap(), b"gone");
}

#[test]
fn test_modification_time_drives_change_detection() {
    let harness = VaultHarness::local(1 << 24);
    harness.write("same-size.txt", b"aaaa");
    harness.backup();

    // Same size, rewritten within the tolerance: not picked up
    harness.write("same-size.txt", b"bbbb");
    assert_eq!(harness.backup().files_backed_up, 0);

    harness.touch_later("same-size.txt");
    let report = harness.backup();
    assert_eq!(report.files_backed_up, 1);
    assert_eq!(harness.vault.history(&harness.path("same-size.txt")).len(), 2);

    let (_out, restored) = harness.restore_all(None);
    assert_eq!(fs::read(restored.join("same-size.txt")).unwrap(), b"bbbb");
}

#[test]
fn test_identical_content_is_transferred_once() {
    let state = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let noop = Arc::new(NoopFileStore::named("null"));
    let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
    let vault = VaultBuilder::new(state.path().join("vault.idx"), config)
        .store(noop.clone())
        .build()
        .unwrap();

    let content = random_bytes(7, 2048);
    fs::write(source.path().join("a.bin"), &content).unwrap();
    fs::write(source.path().join("b.bin"), &content).unwrap();
    fs::write(source.path().join("c.bin"), b"different").unwrap();

    let report = vault
        .backup(&BackupSpecification::new().include(source.path()), &SilentProgress)
        .unwrap();
    assert_eq!(report.files_backed_up, 3);
    assert_eq!(report.files_deduplicated, 1);
    // Two distinct contents plus the index
    assert_eq!(noop.backup_calls(), 3);

    let a = vault.find_revision(&std::path::absolute(source.path().join("a.bin")).unwrap(), None);
    let b = vault.find_revision(&std::path::absolute(source.path().join("b.bin")).unwrap(), None);
    let guid = |r: Option<Revision>| r.and_then(|r| r.as_file().map(|f| f.identifier.guid.clone()));
    assert_eq!(guid(a), guid(b));
}

#[test]
fn test_reclaim_prunes_oldest_revisions_first() {
    let harness = VaultHarness::local(1 << 24);
    let mut dates = Vec::new();
    for version in 0..3u64 {
        harness.write("big.bin", &random_bytes(version, 20_000 + version as usize));
        harness.write("small.txt", format!("v{version}").repeat(version as usize + 1).as_bytes());
        dates.push(harness.backup().date.unwrap());
    }
    let big = harness.path("big.bin");
    assert_eq!(harness.vault.history(&big).len(), 3);

    let report = harness.vault.reclaim_space(1).unwrap();
    assert_eq!(report.revisions_removed, 1);
    assert!(report.bytes_freed >= 20_000);
    let history = harness.vault.history(&big);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].date(), dates[1]);

    // Asking for more than can ever be freed prunes down to one revision each
    let err = harness.vault.reclaim_space(u64::MAX).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientSpace);
    assert_eq!(harness.vault.history(&big).len(), 1);
    assert_eq!(harness.vault.history(&harness.path("small.txt")).len(), 1);

    let (_out, restored) = harness.restore_all(None);
    assert_eq!(fs::read(restored.join("big.bin")).unwrap(), fs::read(&big).unwrap());
}

#[test]
fn test_backup_fails_when_nothing_can_be_pruned() {
    let harness = VaultHarness::local(4096);
    harness.write("huge.bin", &random_bytes(3, 64 * 1024));

    let err = harness.vault.backup(&harness.spec(), &SilentProgress).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientSpace);
    assert!(harness.vault.history(&harness.path("huge.bin")).is_empty());
    assert!(!harness.vault.is_busy());
}

#[test]
fn test_canceled_restore_leaves_no_partial_file() {
    struct CancelOnBytes;
    impl ProgressSink for CancelOnBytes {
        fn file_progress(&self, _path: &Path, _bytes: u64) -> bool {
            false
        }
    }

    let harness = VaultHarness::local(1 << 24);
    harness.write("payload.bin", &random_bytes(9, 50_000));
    harness.backup();

    let out = TempDir::new().unwrap();
    let err = harness
        .vault
        .restore(
            &RestoreSpecification::new(out.path()).latest(harness.path("payload.bin")),
            &CancelOnBytes,
        )
        .unwrap_err();
    assert!(err.is_canceled());
    assert!(!out.path().join("payload.bin").exists());
    let leftovers: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_restore_does_not_overwrite_unless_allowed() {
    let harness = VaultHarness::local(1 << 24);
    let file = harness.write("doc.txt", b"backed up");
    harness.backup();

    let out = TempDir::new().unwrap();
    fs::write(out.path().join("doc.txt"), b"local edit").unwrap();
    let spec = RestoreSpecification::new(out.path()).latest(&file);

    let report = harness.vault.restore(&spec, &SilentProgress).unwrap();
    assert_eq!(report.renamed, 1);
    assert_eq!(fs::read(out.path().join("doc.txt")).unwrap(), b"local edit");
    assert_eq!(fs::read(out.path().join("doc (1).txt")).unwrap(), b"backed up");

    let report = harness.vault.restore(&spec.overwrite(true), &SilentProgress).unwrap();
    assert_eq!(report.renamed, 0);
    assert_eq!(fs::read(out.path().join("doc.txt")).unwrap(), b"backed up");
}

#[test]
fn test_password_change_keeps_old_backups_readable() {
    let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
    config.add_password("first", Utc::now() - chrono::Duration::hours(1)).unwrap();
    let harness = VaultHarness::with_config(config.clone(), 1 << 24);

    harness.write("secret.txt", b"encrypted under the first password");
    let first = harness.backup().date.unwrap();

    config.add_password("second", Utc::now()).unwrap();
    harness.write("secret.txt", b"encrypted under the second password!");
    harness.backup();
    assert_eq!(config.password_count(), 2);

    let (_old, restored) = harness.restore_all(Some(first));
    assert_eq!(
        fs::read(restored.join("secret.txt")).unwrap(),
        b"encrypted under the first password"
    );
    let (_new, restored) = harness.restore_all(None);
    assert_eq!(
        fs::read(restored.join("secret.txt")).unwrap(),
        b"encrypted under the second password!"
    );
}

#[test]
fn test_configuration_requires_the_newest_password() {
    let state = TempDir::new().unwrap();
    let path = state.path().join("vault.json");
    let config = VaultConfiguration::create(&path, 1_000).unwrap();
    config.add_password("old", Utc::now() - chrono::Duration::hours(1)).unwrap();
    config.change_password("new").unwrap();

    assert!(matches!(
        VaultConfiguration::load(&path, Some("old")),
        Err(VaultError::WrongPassword)
    ));
    assert!(matches!(VaultConfiguration::load(&path, None), Err(VaultError::WrongPassword)));
    let loaded = VaultConfiguration::load(&path, Some("new")).unwrap();
    assert_eq!(loaded.password_count(), 2);
    assert_eq!(loaded.current_password().as_deref(), Some("new"));
}

#[test]
fn test_recover_index_from_store() {
    let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
    config.add_password("pw", Utc::now() - chrono::Duration::minutes(1)).unwrap();
    let harness = VaultHarness::with_config(config.clone(), 1 << 24);
    harness.write("a.txt", b"alpha");
    harness.write("dir/b.txt", b"bravo");
    harness.backup();
    assert!(config.last_index().unwrap().is_some());

    // Lose the local index entirely
    harness.vault.shutdown().unwrap();
    fs::remove_file(harness.state.path().join("vault.idx")).unwrap();
    let reopened = open_local(harness.state.path(), config, 1 << 24);
    assert!(reopened.history(&harness.path("a.txt")).is_empty());

    reopened.recover_index().unwrap();
    assert_eq!(reopened.history(&harness.path("a.txt")).len(), 1);
    assert_eq!(reopened.history(&harness.path("dir/b.txt")).len(), 1);
    assert!(harness.state.path().join("vault.idx").exists());
}

#[test]
fn test_recover_index_without_backup() {
    let harness = VaultHarness::local(1 << 20);
    let err = harness.vault.recover_index().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContentNotFound);
}

#[test]
fn test_second_operation_while_busy() {
    struct Reentrant {
        vault: Arc<Vault>,
        spec: BackupSpecification,
        saw_busy: AtomicBool,
    }
    impl ProgressSink for Reentrant {
        fn will_process_file(&self, _path: &Path) -> bool {
            let nested = self.vault.backup(&self.spec, &SilentProgress);
            if matches!(nested, Err(VaultError::Busy)) {
                self.saw_busy.store(true, Ordering::SeqCst);
            }
            assert!(self.vault.reclaim_space(1).is_err());
            true
        }
    }

    let harness = VaultHarness::local(1 << 20);
    harness.write("file.txt", b"content");
    let sink = Reentrant {
        vault: harness.vault.clone(),
        spec: harness.spec(),
        saw_busy: AtomicBool::new(false),
    };
    harness.vault.backup(&harness.spec(), &sink).unwrap();
    assert!(sink.saw_busy.load(Ordering::SeqCst));

    // The flag is released afterwards
    assert_eq!(harness.backup().files_unchanged, 1);
}

#[test]
fn test_progress_is_reported_per_file_and_byte() {
    let harness = VaultHarness::local(1 << 24);
    harness.write("one.bin", &random_bytes(1, 3000));
    harness.write("two.bin", &random_bytes(2, 5000));

    let counter = ProgressCounter::default();
    harness.vault.backup(&harness.spec(), &counter).unwrap();
    assert_eq!(counter.files.load(Ordering::SeqCst), 2);
    assert_eq!(counter.bytes.load(Ordering::SeqCst), 8000);
    assert_eq!(counter.operations_ended.load(Ordering::SeqCst), 1);
}

#[test]
fn test_estimate_projects_without_transfer() {
    let harness = VaultHarness::local(1 << 24);
    harness.write("a.txt", &[b'a'; 1000]);
    harness.write("b.log", &[b'b'; 3000]);

    let estimate = harness.vault.estimate(&harness.spec()).unwrap();
    assert_eq!(estimate.files, 2);
    assert_eq!(estimate.original_bytes, 4000);
    // Nothing is known about these extensions yet
    assert_eq!(estimate.estimated_stored_bytes, 4000);
    assert!(harness.vault.history(&harness.path("a.txt")).is_empty());

    harness.backup();
    let estimate = harness.vault.estimate(&harness.spec().only_changed(false)).unwrap();
    // Repetitive text compresses well; the projection follows what was stored
    assert!(estimate.estimated_stored_bytes < 4000);
}

#[test]
fn test_webmail_store_end_to_end() {
    let source = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
    config.add_password("vault-pw", Utc::now() - chrono::Duration::minutes(1)).unwrap();

    let mailbox = Arc::new(MemoryMailbox::new("me@example.com", "mail-pw", 1 << 16, 1 << 24));
    let builder = VaultBuilder::new(state.path().join("vault.idx"), config);
    let store = GMailFileStore::new(
        WebMailSettings {
            name: "mail".to_string(),
            account: "me@example.com".to_string(),
            outgoing_limit: Some(1024),
            capacity: None,
        },
        Some("mail-pw".to_string()),
        mailbox.clone(),
        builder.pipeline(),
    );
    let vault = builder.store(Arc::new(store)).build().unwrap();

    let payload = random_bytes(11, 5000);
    fs::write(source.path().join("photo.raw"), &payload).unwrap();
    fs::write(source.path().join("note.txt"), b"short").unwrap();
    vault
        .backup(&BackupSpecification::new().include(source.path()), &SilentProgress)
        .unwrap();
    info!("Mailbox holds {} message(s)", mailbox.message_count());
    // The 5000-byte file alone needs several 768-byte parts
    assert!(mailbox.message_count() > 7);

    let out = TempDir::new().unwrap();
    let file = std::path::absolute(source.path().join("photo.raw")).unwrap();
    vault
        .restore(&RestoreSpecification::new(out.path()).latest(&file), &SilentProgress)
        .unwrap();
    assert_eq!(fs::read(out.path().join("photo.raw")).unwrap(), payload);

    vault.perform_maintenance().unwrap();
    assert!(mailbox.inbox_subjects().is_empty());
    vault.shutdown().unwrap();
}

#[test]
fn test_webmail_rejects_bad_login() {
    let state = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("f.txt"), b"data").unwrap();
    let config = Arc::new(VaultConfiguration::new(1_000).unwrap());

    let mailbox = Arc::new(MemoryMailbox::new("me@example.com", "right", 1 << 16, 1 << 20));
    let builder = VaultBuilder::new(state.path().join("vault.idx"), config);
    let store = GMailFileStore::new(
        WebMailSettings {
            name: "mail".to_string(),
            account: "me@example.com".to_string(),
            outgoing_limit: None,
            capacity: None,
        },
        Some("wrong".to_string()),
        mailbox,
        builder.pipeline(),
    );
    assert!(store.is_configured());
    let vault = builder.store(Arc::new(store)).build().unwrap();

    let err = vault
        .backup(&BackupSpecification::new().include(source.path()), &SilentProgress)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
}

#[test]
fn test_maintenance_worker_runs_in_background() {
    let state = TempDir::new().unwrap();
    let noop = Arc::new(NoopFileStore::named("null"));
    let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
    let vault = VaultBuilder::new(state.path().join("vault.idx"), config)
        .store(noop)
        .availability_refresh(Duration::from_secs(3600))
        .maintenance_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(vault.available_bytes().unwrap() > 0);
    vault.shutdown().unwrap();
}
