//! Gmail profile for the webmail store

use super::webmail::{WebMailFileStore, WebMailProvider};
use super::StoreKind;

/// Gmail limits and search syntax
#[derive(Debug, Clone, Copy, Default)]
pub struct GMail;

impl WebMailProvider for GMail {
    const KIND: StoreKind = StoreKind::Gmail;
    const MESSAGE_LIMIT: u64 = 25 * 1024 * 1024;
    const HEADER_ALLOWANCE: u64 = 64 * 1024;
    const ARCHIVE_LABEL: &'static str = "vaultkeeper";

    fn search_query(text: &str) -> String {
        format!("subject:\"{text}\"")
    }
}

/// Webmail store speaking to a Gmail account through `T`
pub type GMailFileStore<T> = WebMailFileStore<GMail, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionStrategy;
    use crate::config::VaultConfiguration;
    use crate::error::VaultError;
    use crate::progress::Unobserved;
    use crate::revision::RevisionIdentifier;
    use crate::store::webmail::subject_for;
    use crate::store::{FileStore, MailTransport, MemoryMailbox, StoreEvent, WebMailSettings};
    use crate::transport::Pipeline;
    use chrono::Utc;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const ACCOUNT: &str = "backup@example.com";

    fn setup(outgoing_limit: u64) -> (Arc<MemoryMailbox>, GMailFileStore<MemoryMailbox>) {
        let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
        config.change_password("vault password").unwrap();
        let pipeline = Arc::new(Pipeline::new(config, CompressionStrategy::None));
        let mailbox = Arc::new(MemoryMailbox::new(ACCOUNT, "mail password", outgoing_limit, 1 << 20));
        let store = GMailFileStore::new(
            WebMailSettings {
                name: "mail".to_string(),
                account: ACCOUNT.to_string(),
                outgoing_limit: Some(outgoing_limit),
                capacity: None,
            },
            Some("mail password".to_string()),
            mailbox.clone(),
            pipeline,
        );
        (mailbox, store)
    }

    fn source(dir: &TempDir, len: usize) -> (PathBuf, Vec<u8>) {
        let content: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        let path = dir.path().join("source.bin");
        std::fs::write(&path, &content).unwrap();
        (path, content)
    }

    #[test]
    fn test_multi_part_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let (mailbox, store) = setup(400);
        assert_eq!(store.chunk_size(), 300);
        let (path, content) = source(&temp_dir, 1000);

        let mut id = RevisionIdentifier::new("guidA");
        let stored = store.backup_file(&path, &mut id, &mut Unobserved).unwrap();
        assert_eq!(id.handler_name, "mail");
        assert_eq!(mailbox.send_count() as u64, stored.div_ceil(300));

        let restored = store.restore_file(&id, Utc::now(), &mut Unobserved).unwrap();
        assert_eq!(restored, Some(content));
        // One login served every operation
        assert_eq!(mailbox.login_count(), 1);
    }

    #[test]
    fn test_missing_content_is_none() {
        let (_mailbox, store) = setup(400);
        let id = RevisionIdentifier::with_handler("nothing", "mail");
        assert!(store.restore_file(&id, Utc::now(), &mut Unobserved).unwrap().is_none());
    }

    #[test]
    fn test_out_of_range_part_is_inconsistent() {
        let (mailbox, store) = setup(400);
        mailbox.deliver(&subject_for("g", 0, 2), b"a");
        mailbox.deliver(&subject_for("g", 2, 2), b"c");
        let id = RevisionIdentifier::with_handler("g", "mail");
        let err = store.restore_file(&id, Utc::now(), &mut Unobserved).unwrap_err();
        assert!(matches!(err, VaultError::Inconsistent(_)));
    }

    #[test]
    fn test_missing_trailing_part_is_inconsistent() {
        let temp_dir = TempDir::new().unwrap();
        let (mailbox, store) = setup(400);
        let (path, _) = source(&temp_dir, 1000);
        let mut id = RevisionIdentifier::new("guidA");
        let stored = store.backup_file(&path, &mut id, &mut Unobserved).unwrap();
        let total = stored.div_ceil(300) as usize;
        assert!(total > 2);

        // Lose the last part only
        let mut session = mailbox.login(ACCOUNT, "mail password").unwrap();
        let last = mailbox
            .search(&mut session, &GMail::search_query(&subject_for("guidA", total - 1, total)))
            .unwrap();
        let ids: Vec<String> = last.into_iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 1);
        mailbox.trash(&mut session, &ids).unwrap();
        mailbox.purge(&mut session, &ids).unwrap();

        let err = store.restore_file(&id, Utc::now(), &mut Unobserved).unwrap_err();
        assert!(matches!(err, VaultError::Inconsistent(_)), "unexpected {err:?}");

        // Deleting still clears what is left
        store.delete_file(&id, stored).unwrap();
        assert_eq!(mailbox.message_count(), 0);
    }

    #[test]
    fn test_same_content_sent_twice_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let (mailbox, store) = setup(400);
        let (path, content) = source(&temp_dir, 1000);

        let mut first = RevisionIdentifier::new("guidA");
        let stored = store.backup_file(&path, &mut first, &mut Unobserved).unwrap();
        let sends = mailbox.send_count();

        // An index that never learned about the first upload offers it again
        let mut second = RevisionIdentifier::new("guidA");
        assert_eq!(store.backup_file(&path, &mut second, &mut Unobserved).unwrap(), stored);
        assert_eq!(second.handler_name, "mail");
        assert_eq!(mailbox.send_count(), sends);

        let restored = store.restore_file(&second, Utc::now(), &mut Unobserved).unwrap();
        assert_eq!(restored, Some(content));
    }

    #[test]
    fn test_incomplete_leftover_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let (mailbox, store) = setup(400);
        let (path, content) = source(&temp_dir, 1000);
        // Leftover of an upload that died after its first message
        mailbox.deliver(&subject_for("guidA", 0, 4), b"stale");

        let mut id = RevisionIdentifier::new("guidA");
        let stored = store.backup_file(&path, &mut id, &mut Unobserved).unwrap();
        assert_eq!(mailbox.message_count() as u64, stored.div_ceil(300));
        let restored = store.restore_file(&id, Utc::now(), &mut Unobserved).unwrap();
        assert_eq!(restored, Some(content));
    }

    #[test]
    fn test_similar_guid_is_not_mixed_in() {
        let temp_dir = TempDir::new().unwrap();
        let (mailbox, store) = setup(400);
        let (path, content) = source(&temp_dir, 100);
        let mut id = RevisionIdentifier::new("g");
        store.backup_file(&path, &mut id, &mut Unobserved).unwrap();
        // Same prefix, different guid
        mailbox.deliver(&subject_for("g2", 5, 6), b"noise");
        assert_eq!(store.restore_file(&id, Utc::now(), &mut Unobserved).unwrap(), Some(content));
    }

    #[test]
    fn test_delete_removes_every_part() {
        let temp_dir = TempDir::new().unwrap();
        let (mailbox, store) = setup(400);
        let (path, _) = source(&temp_dir, 1000);
        let mut id = RevisionIdentifier::new("g");
        let before = store.available_bytes().unwrap();
        let stored = store.backup_file(&path, &mut id, &mut Unobserved).unwrap();
        assert_eq!(store.available_bytes().unwrap(), before - stored);

        store.delete_file(&id, stored).unwrap();
        assert_eq!(mailbox.message_count(), 0);
        assert_eq!(store.available_bytes().unwrap(), before);
    }

    #[test]
    fn test_failed_send_leaves_no_parts() {
        let temp_dir = TempDir::new().unwrap();
        let (mailbox, store) = setup(400);
        let (path, _) = source(&temp_dir, 1000);
        let sent = AtomicUsize::new(0);
        let mailbox_for_progress = mailbox.clone();
        let mut progress = |_: u64| {
            // Break the connection after the first message went out
            if mailbox_for_progress.send_count() == 1 && sent.fetch_add(1, Ordering::SeqCst) == 0 {
                mailbox_for_progress.refuse_sends(true);
            }
            true
        };
        let err = store
            .backup_file(&path, &mut RevisionIdentifier::new("g"), &mut progress)
            .unwrap_err();
        assert!(matches!(err, VaultError::Transport(_)));
        mailbox.refuse_sends(false);
        assert_eq!(mailbox.message_count(), 0);
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let temp_dir = TempDir::new().unwrap();
        let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
        let pipeline = Arc::new(Pipeline::new(config, CompressionStrategy::Fast));
        let mailbox = Arc::new(MemoryMailbox::new(ACCOUNT, "right", 1 << 16, 1 << 20));
        let store = GMailFileStore::new(
            WebMailSettings {
                name: "mail".to_string(),
                account: ACCOUNT.to_string(),
                outgoing_limit: None,
                capacity: None,
            },
            Some("wrong".to_string()),
            mailbox,
            pipeline,
        );
        let (path, _) = source(&temp_dir, 10);
        let err = store
            .backup_file(&path, &mut RevisionIdentifier::new("g"), &mut Unobserved)
            .unwrap_err();
        assert!(matches!(err, VaultError::AuthenticationFailed { .. }));
        assert!(!store.can_backup_file(Path::new("x"), 1));
    }

    #[test]
    fn test_idle_sessions_are_discarded() {
        let (mailbox, store) = setup(400);
        let store = store.with_idle_timeout(Duration::ZERO);
        store.available_bytes().unwrap();
        store.perform_maintenance().unwrap();
        assert_eq!(mailbox.login_count(), 2);
        store.prepare_for_shutdown().unwrap();
        assert_eq!(store.pooled_sessions(), 0);
    }

    #[test]
    fn test_maintenance_archives_backups_only() {
        let (mailbox, store) = setup(400);
        mailbox.deliver(&subject_for("g", 0, 1), b"part");
        mailbox.deliver("Lunch on Friday?", b"");

        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        store.subscribe(Arc::new(move |event: &StoreEvent| {
            if matches!(event, StoreEvent::AvailabilityChanged { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        store.perform_maintenance().unwrap();
        assert_eq!(mailbox.inbox_subjects(), vec!["Lunch on Friday?".to_string()]);
        // Quota was never cached before, so it changed
        assert_eq!(events.load(Ordering::SeqCst), 1);

        let mut session = mailbox.login(ACCOUNT, "mail password").unwrap();
        assert_eq!(
            mailbox.search(&mut session, &GMail::search_query("vaultkeeper backup g")).unwrap().len(),
            1
        );
    }
}
