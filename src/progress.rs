//! Progress reporting and cooperative cancellation
//!
//! Long-running vault operations report through a [`ProgressSink`]. The
//! boolean returned by [`ProgressSink::will_process_file`] and
//! [`ProgressSink::file_progress`] doubles as the cancellation signal:
//! returning `false` asks the operation to stop. Requests are polled between
//! files and between chunk transfers, never in the middle of a buffer.
//!
//! Stores see a narrower [`TransferProgress`] for the one file they are
//! moving. [`FileTransferProgress`] adapts a sink to it.
//!
//! ## Example
//!
//! ```rust
//! use vaultkeeper::progress::{CancellationToken, ProgressSink};
//! use std::path::Path;
//!
//! let token = CancellationToken::new();
//! assert!(token.will_process_file(Path::new("/a")));
//! token.cancel();
//! assert!(!token.will_process_file(Path::new("/b")));
//! ```

use crate::error::VaultError;
use crate::types::BackupPhase;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Observer of a vault operation
///
/// Every method has a default so implementors only override what they need.
pub trait ProgressSink: Send + Sync {
    /// About to process `path`; return `false` to cancel
    fn will_process_file(&self, _path: &Path) -> bool {
        true
    }

    /// `bytes` more of `path` were transferred since the last call; return
    /// `false` to cancel
    fn file_progress(&self, _path: &Path, _bytes: u64) -> bool {
        true
    }

    /// The operation is starting
    fn operation_will_start(&self) {}

    /// The operation finished, with its error if it failed
    fn operation_did_end(&self, _error: Option<&VaultError>, _was_canceled: bool) {}

    /// A backup moved to a new phase
    fn phase_changed(&self, _phase: BackupPhase) {}
}

/// Sink that observes nothing and never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {}

/// Sink whose only job is to carry a cancellation request
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that has not been canceled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl ProgressSink for CancellationToken {
    fn will_process_file(&self, _path: &Path) -> bool {
        !self.is_canceled()
    }

    fn file_progress(&self, _path: &Path, _bytes: u64) -> bool {
        !self.is_canceled()
    }
}

/// Sink that tallies what it was told
#[derive(Debug, Default)]
pub struct ProgressCounter {
    /// Files announced through `will_process_file`
    pub files: AtomicUsize,
    /// Bytes reported through `file_progress`
    pub bytes: AtomicU64,
    /// Times `operation_did_end` was called
    pub operations_ended: AtomicUsize,
}

impl ProgressSink for ProgressCounter {
    fn will_process_file(&self, _path: &Path) -> bool {
        self.files.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn file_progress(&self, _path: &Path, bytes: u64) -> bool {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        true
    }

    fn operation_did_end(&self, _error: Option<&VaultError>, _was_canceled: bool) {
        self.operations_ended.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-file progress seen by a store while it moves bytes
pub trait TransferProgress {
    /// `bytes` more were moved (0 is a pure cancellation poll); return
    /// `false` to cancel
    fn transferred(&mut self, bytes: u64) -> bool;
}

impl<F: FnMut(u64) -> bool> TransferProgress for F {
    fn transferred(&mut self, bytes: u64) -> bool {
        self(bytes)
    }
}

/// Transfer progress that never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct Unobserved;

impl TransferProgress for Unobserved {
    fn transferred(&mut self, _bytes: u64) -> bool {
        true
    }
}

/// Adapts a [`ProgressSink`] to the [`TransferProgress`] of one file
pub struct FileTransferProgress<'a> {
    sink: &'a dyn ProgressSink,
    path: &'a Path,
}

impl<'a> FileTransferProgress<'a> {
    /// Report transfers of `path` to `sink`
    pub fn new(sink: &'a dyn ProgressSink, path: &'a Path) -> Self {
        Self { sink, path }
    }
}

impl TransferProgress for FileTransferProgress<'_> {
    fn transferred(&mut self, bytes: u64) -> bool {
        self.sink.file_progress(self.path, bytes)
    }
}

/// Marker carried inside an `io::Error` when a read was canceled
#[derive(Debug)]
struct CancellationMarker;

impl std::fmt::Display for CancellationMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation canceled")
    }
}

impl std::error::Error for CancellationMarker {}

/// An `io::Error` that [`from_io_error`] maps back to a cancellation
pub fn canceled_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, CancellationMarker)
}

/// Map an I/O error, recognising cancellations raised mid-stream
pub fn from_io_error(err: io::Error) -> VaultError {
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<CancellationMarker>())
    {
        VaultError::OperationCanceled
    } else {
        VaultError::Io(err)
    }
}
