//! Main test module for vaultkeeper
//!
//! This module includes all test suites:
//! - Integration tests for backup and restore scenarios
//! - Property-based tests for revision history invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::vaultkeeper::progress::SilentProgress;
    use ::vaultkeeper::store::NoopFileStore;
    use ::vaultkeeper::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn noop_vault(state: &TempDir) -> (Arc<Vault>, Arc<NoopFileStore>) {
        let noop = Arc::new(NoopFileStore::named("null"));
        let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
        let vault = VaultBuilder::new(state.path().join("vault.idx"), config)
            .store(noop.clone())
            .build()
            .unwrap();
        (vault, noop)
    }

    #[test]
    fn test_empty_directory() {
        let source = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (vault, noop) = noop_vault(&state);

        let report = vault
            .backup(&BackupSpecification::new().include(source.path()), &SilentProgress)
            .unwrap();
        assert_eq!(report.files_scanned, 0);
        assert_eq!(report.files_backed_up, 0);
        // Only the index was stored
        assert_eq!(noop.backup_calls(), 1);
    }

    #[test]
    fn test_missing_include_is_skipped() {
        let state = TempDir::new().unwrap();
        let (vault, _) = noop_vault(&state);

        let report = vault
            .backup(
                &BackupSpecification::new().include(state.path().join("does-not-exist")),
                &SilentProgress,
            )
            .unwrap();
        assert_eq!(report.files_scanned, 0);
    }

    #[test]
    fn test_special_filenames() {
        let source = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (vault, _) = noop_vault(&state);

        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.multiple.dots.txt",
            "unicode_文件.txt",
            "emoji_🚀.txt",
        ];
        for name in names {
            fs::write(source.path().join(name), name).unwrap();
        }

        let report = vault
            .backup(&BackupSpecification::new().include(source.path()), &SilentProgress)
            .unwrap();
        assert_eq!(report.files_backed_up, names.len());
        for name in names {
            let path = std::path::absolute(source.path().join(name)).unwrap();
            assert!(vault.find_revision(&path, None).is_some(), "{name} not recorded");
        }
        let root = std::path::absolute(source.path()).unwrap();
        assert_eq!(vault.list(&root, None).unwrap().len(), names.len());
    }

    #[test]
    fn test_hidden_files_skipped_by_default() {
        let source = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (vault, _) = noop_vault(&state);
        fs::write(source.path().join(".secret"), "hidden").unwrap();
        fs::write(source.path().join("visible"), "shown").unwrap();

        let spec = BackupSpecification::new().include(source.path());
        assert_eq!(vault.estimate(&spec).unwrap().files, 1);
        assert_eq!(vault.estimate(&spec.skip_hidden(false)).unwrap().files, 2);
    }

    #[test]
    fn test_restore_unknown_path() {
        let state = TempDir::new().unwrap();
        let (vault, _) = noop_vault(&state);

        let err = vault
            .restore(
                &RestoreSpecification::new(state.path()).latest("/never/backed/up"),
                &SilentProgress,
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[test]
    fn test_lost_content_is_reported() {
        let source = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (vault, _) = noop_vault(&state);
        fs::write(source.path().join("file.txt"), "content").unwrap();
        vault
            .backup(&BackupSpecification::new().include(source.path()), &SilentProgress)
            .unwrap();

        // The noop store keeps nothing, so every restore finds no content
        let path = std::path::absolute(source.path().join("file.txt")).unwrap();
        let err = vault
            .restore(
                &RestoreSpecification::new(state.path().join("out")).latest(&path),
                &SilentProgress,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContentNotFound);
        assert!(matches!(err, VaultError::File { .. }));
        assert!(!state.path().join("out/file.txt").exists());
    }

    #[test]
    fn test_empty_file() {
        let source = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (vault, _) = noop_vault(&state);
        fs::write(source.path().join("empty"), b"").unwrap();

        let report = vault
            .backup(&BackupSpecification::new().include(source.path()), &SilentProgress)
            .unwrap();
        assert_eq!(report.files_backed_up, 1);
        assert_eq!(report.original_bytes, 0);
    }
}
