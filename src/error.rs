//! Error types for the vaultkeeper library
//!
//! Every fallible operation returns [`Result<T>`], whose error is the single
//! crate-wide [`VaultError`]. Backend faults are wrapped with the file path
//! being processed (see [`VaultError::File`]) so that callers can report
//! where a failure happened, while [`VaultError::kind`] still exposes the
//! underlying category for branching.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the vaultkeeper library
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for all vault operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// The backend lost, or never had, the bytes for an identifier
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    /// A backend rejected its login
    #[error("Authentication failed for {store}: {reason}")]
    AuthenticationFailed {
        /// Name of the store whose login failed
        store: String,
        /// Reason given by the backend
        reason: String,
    },

    /// No backend (even after reclaiming space) can fit the backup
    #[error("Insufficient space: {needed} bytes needed, {available} bytes available")]
    InsufficientSpace {
        /// Bytes required
        needed: u64,
        /// Bytes available
        available: u64,
    },

    /// A cooperative cancellation request was honored
    #[error("Operation canceled")]
    OperationCanceled,

    /// Attempt to append a revision that is not after the last one
    #[error("Cannot append revision for {path:?} at {attempted}: last revision is at {last}")]
    HistoryOrderingViolation {
        /// Path of the node whose history would be violated
        path: PathBuf,
        /// Date of the node's last revision
        last: DateTime<Utc>,
        /// Date of the rejected revision
        attempted: DateTime<Utc>,
    },

    /// Generic network or backend transport fault
    #[error("Transport error: {0}")]
    Transport(String),

    /// Search results from a backend do not form a complete chunk sequence
    #[error("Inconsistent backend state: {0}")]
    Inconsistent(String),

    /// The vault password could not unlock the configuration
    #[error("Wrong vault password")]
    WrongPassword,

    /// Authenticated decryption failed
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// The persisted index is not a valid revision tree
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No store is registered under the given name or kind
    #[error("Unknown store: {0}")]
    UnknownStore(String),

    /// Another backup or restore is already running on this vault
    #[error("Another operation is already in progress")]
    Busy,

    /// The path has no recorded history
    #[error("No history for {0:?}")]
    NotFound(PathBuf),

    /// Pattern parsing error
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A failure while processing a specific file
    #[error("{path:?}: {source}")]
    File {
        /// File being processed when the failure happened
        path: PathBuf,
        /// Underlying error
        #[source]
        source: Box<VaultError>,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Category of a [`VaultError`], independent of path wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend lost or never had the bytes
    ContentNotFound,
    /// Backend login rejected
    AuthenticationFailed,
    /// Backup cannot fit
    InsufficientSpace,
    /// Cooperative cancellation honored
    OperationCanceled,
    /// Revision not after the last one
    HistoryOrderingViolation,
    /// I/O, network or backend fault
    Transport,
    /// Anything else (configuration, corruption, programming errors)
    Other,
}

impl From<bincode::error::DecodeError> for VaultError {
    fn from(err: bincode::error::DecodeError) -> Self {
        VaultError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for VaultError {
    fn from(err: bincode::error::EncodeError) -> Self {
        VaultError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for VaultError {
    fn from(err: globset::Error) -> Self {
        VaultError::InvalidPattern(err.to_string())
    }
}

impl VaultError {
    /// Create a transport error with a custom message
    pub fn transport(msg: impl Into<String>) -> Self {
        VaultError::Transport(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VaultError::Internal(msg.into())
    }

    /// Create an authentication error for a named store
    pub fn authentication(store: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::AuthenticationFailed {
            store: store.into(),
            reason: reason.into(),
        }
    }

    /// Wrap this error with the path being processed
    ///
    /// Already-wrapped errors and cancellations are returned unchanged so a
    /// failure is attributed to the innermost path only.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            VaultError::File { .. } | VaultError::OperationCanceled => self,
            other => VaultError::File {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// The error with any path wrapping removed
    pub fn root_cause(&self) -> &VaultError {
        match self {
            VaultError::File { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Taxonomy category of this error
    pub fn kind(&self) -> ErrorKind {
        match self.root_cause() {
            VaultError::ContentNotFound(_) => ErrorKind::ContentNotFound,
            VaultError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            VaultError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            VaultError::OperationCanceled => ErrorKind::OperationCanceled,
            VaultError::HistoryOrderingViolation { .. } => ErrorKind::HistoryOrderingViolation,
            VaultError::Transport(_)
            | VaultError::Io(_)
            | VaultError::WalkDir(_)
            | VaultError::Inconsistent(_) => ErrorKind::Transport,
            _ => ErrorKind::Other,
        }
    }

    /// Check whether this error is a honored cancellation
    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::OperationCanceled
    }

    /// Check if retrying the operation later might succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::AuthenticationFailed
        ) || matches!(self.root_cause(), VaultError::Busy)
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self.root_cause() {
            VaultError::InsufficientSpace { needed, available } => format!(
                "Not enough backup space: {} bytes needed but only {} bytes available, \
                 even after pruning old revisions. Add a store or exclude large files.",
                needed, available
            ),
            VaultError::WrongPassword => {
                "The vault password is incorrect. Use the newest password you set.".to_string()
            }
            VaultError::AuthenticationFailed { store, .. } => format!(
                "Store '{}' rejected its login. Check the account credentials and try again.",
                store
            ),
            VaultError::Busy => {
                "Another backup or restore is running. Wait for it to finish.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VaultError::ContentNotFound("abc123".to_string());
        assert_eq!(err.to_string(), "Content not found: abc123");
    }

    #[test]
    fn test_kind_sees_through_path_wrapping() {
        let err = VaultError::InsufficientSpace { needed: 10, available: 3 }
            .with_path("/home/user/a.txt");
        assert!(matches!(err, VaultError::File { .. }));
        assert_eq!(err.kind(), ErrorKind::InsufficientSpace);
        assert!(err.to_string().contains("a.txt"));
    }

    #[test]
    fn test_with_path_wraps_once() {
        let err = VaultError::transport("boom")
            .with_path("/a")
            .with_path("/b");
        match err {
            VaultError::File { path, .. } => assert_eq!(path, PathBuf::from("/a")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancellation_is_never_wrapped() {
        let err = VaultError::OperationCanceled.with_path("/x");
        assert!(matches!(err, VaultError::OperationCanceled));
        assert!(err.is_canceled());
    }

    #[test]
    fn test_error_recoverable() {
        assert!(VaultError::Busy.is_recoverable());
        assert!(VaultError::transport("reset").is_recoverable());
        assert!(!VaultError::CorruptIndex("bad".to_string()).is_recoverable());
    }
}
