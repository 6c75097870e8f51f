//! Transport pipeline between files on disk and stored blobs
//!
//! ## Backup direction
//!
//! ```text
//! file ─▶ ProgressReader ─▶ compress ─▶ seal (current password) ─▶ CountingWriter ─▶ Chunker ─▶ store
//! ```
//!
//! ## Restore direction
//!
//! ```text
//! store ─▶ ordered chunks ─▶ concatenate ─▶ open (password as of backup date) ─▶ decompress ─▶ bytes
//! ```
//!
//! A stored blob is one flag byte followed by the payload:
//!
//! - `0`: the compressed content (see [`compression`](crate::compression))
//! - `1`: `nonce || ciphertext || tag` of the compressed content
//!
//! Chunks are plain slices of the blob; only their order matters.

use crate::compression::{CompressionEngine, CompressionStrategy};
use crate::config::VaultConfiguration;
use crate::crypto::{self, SEAL_OVERHEAD};
use crate::error::{Result, VaultError};
use crate::progress::{canceled_io_error, from_io_error, TransferProgress};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Flag byte of an unencrypted blob
pub const FLAG_PLAIN: u8 = 0;

/// Flag byte of an encrypted blob
pub const FLAG_SEALED: u8 = 1;

/// Reader that reports every read and can be canceled between reads
///
/// When the progress callback returns `false` the next read fails with an
/// error that [`from_io_error`] turns into
/// [`VaultError::OperationCanceled`].
pub struct ProgressReader<'a, R> {
    inner: R,
    progress: &'a mut dyn TransferProgress,
    total: u64,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    /// Wrap a reader
    pub fn new(inner: R, progress: &'a mut dyn TransferProgress) -> Self {
        Self {
            inner,
            progress,
            total: 0,
        }
    }

    /// Bytes read so far
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.total += read as u64;
        if !self.progress.transferred(read as u64) {
            return Err(canceled_io_error());
        }
        Ok(read)
    }
}

/// Writer that counts the bytes passing through
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    /// Bytes written so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Unwrap, returning the inner writer and the byte count
    pub fn into_inner(self) -> (W, u64) {
        (self.inner, self.count)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Splits a blob into fixed-size parts and puts it back together
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    /// Chunker producing parts of at most `chunk_size` bytes
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if `chunk_size` is zero
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(VaultError::InvalidConfiguration("chunk size must be non-zero".to_string()));
        }
        Ok(Self { chunk_size })
    }

    /// Maximum part size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of parts a blob of `len` bytes splits into (at least one)
    pub fn part_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size).max(1)
    }

    /// Parts of a blob, in order; an empty blob yields one empty part
    pub fn split<'a>(&self, blob: &'a [u8]) -> Vec<&'a [u8]> {
        if blob.is_empty() {
            return vec![blob];
        }
        blob.chunks(self.chunk_size).collect()
    }

    /// Concatenate parts that are already in order
    pub fn reassemble<I, B>(parts: I) -> Vec<u8>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut blob = Vec::new();
        for part in parts {
            blob.extend_from_slice(part.as_ref());
        }
        blob
    }
}

/// Compression plus password-epoch encryption, shared by all stores
#[derive(Debug)]
pub struct Pipeline {
    compression: CompressionEngine,
    config: Arc<VaultConfiguration>,
}

impl Pipeline {
    /// Pipeline encrypting with the passwords of `config`
    pub fn new(config: Arc<VaultConfiguration>, strategy: CompressionStrategy) -> Self {
        Self {
            compression: CompressionEngine::new(strategy),
            config,
        }
    }

    /// The compression engine (for statistics)
    pub fn compression(&self) -> &CompressionEngine {
        &self.compression
    }

    /// Worst-case stored size for content of `original` bytes
    pub fn max_encoded_len(&self, original: u64) -> u64 {
        let sealed = if self.config.has_password() { SEAL_OVERHEAD as u64 } else { 0 };
        1 + crate::compression::HEADER_LEN as u64 + original + sealed
    }

    /// Encode content for storage
    pub fn encode(&self, path: &Path, content: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compression.compress(path, content)?;
        let mut writer = CountingWriter::new(Vec::with_capacity(compressed.len() + 1 + SEAL_OVERHEAD));
        match self.config.current_key()? {
            Some(key) => {
                writer.write_all(&[FLAG_SEALED])?;
                writer.write_all(&crypto::seal(&key, &compressed)?)?;
            }
            None => {
                writer.write_all(&[FLAG_PLAIN])?;
                writer.write_all(&compressed)?;
            }
        }
        let (blob, stored) = writer.into_inner();
        trace!("Encoded {:?}: {} -> {} bytes", path, content.len(), stored);
        Ok(blob)
    }

    /// Read a file through a [`ProgressReader`] and encode it
    ///
    /// # Errors
    ///
    /// - [`VaultError::OperationCanceled`] if the progress callback asked to stop
    /// - [`VaultError::Io`] if the file cannot be read
    pub fn encode_file(&self, source: &Path, progress: &mut dyn TransferProgress) -> Result<Vec<u8>> {
        let file = File::open(source)?;
        let mut reader = ProgressReader::new(file, progress);
        let mut content = Vec::new();
        reader.read_to_end(&mut content).map_err(from_io_error)?;
        self.encode(source, &content)
    }

    /// Decode a stored blob backed up at `backed_up`
    ///
    /// The password current at `backed_up` is tried first, then every other
    /// epoch newest first.
    ///
    /// # Errors
    ///
    /// - [`VaultError::WrongPassword`] if the blob is sealed and no known
    ///   password opens it
    /// - [`VaultError::Decompression`] if the payload is corrupt
    pub fn decode(&self, blob: &[u8], backed_up: DateTime<Utc>) -> Result<Vec<u8>> {
        let (&flag, payload) = blob
            .split_first()
            .ok_or_else(|| VaultError::Decompression("empty blob".to_string()))?;
        let compressed = match flag {
            FLAG_PLAIN => payload.to_vec(),
            FLAG_SEALED => self.open_with_epochs(payload, backed_up)?,
            other => {
                return Err(VaultError::Decompression(format!("unknown blob flag {other}")));
            }
        };
        self.compression.decompress(&compressed)
    }

    fn open_with_epochs(&self, payload: &[u8], backed_up: DateTime<Utc>) -> Result<Vec<u8>> {
        if let Some(key) = self.config.key_as_of(backed_up)? {
            match crypto::open(&key, payload) {
                Ok(plain) => return Ok(plain),
                Err(e) => debug!("Key as of {} did not open blob: {}", backed_up, e),
            }
        }
        for key in self.config.keys_newest_first()? {
            if let Ok(plain) = crypto::open(&key, payload) {
                warn!("Blob dated {} opened with a key from another epoch", backed_up);
                return Ok(plain);
            }
        }
        Err(VaultError::WrongPassword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Unobserved;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn pipeline(password: Option<&str>) -> Pipeline {
        let config = VaultConfiguration::new(1_000).unwrap();
        if let Some(password) = password {
            config
                .add_password(password, Utc.timestamp_opt(0, 0).unwrap())
                .unwrap();
        }
        Pipeline::new(Arc::new(config), CompressionStrategy::Fast)
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 7) as u8).collect()
    }

    #[test]
    fn test_chunked_round_trip_at_boundaries() {
        let pipeline = pipeline(Some("pw"));
        let chunker = Chunker::new(1000).unwrap();
        let now = Utc::now();
        for len in [999, 1000, 1001, 5000] {
            let original = content(len);
            let blob = pipeline.encode(Path::new("f.bin"), &original).unwrap();
            for size in [blob.len() - 1, blob.len(), blob.len() + 1] {
                let chunker = Chunker::new(size).unwrap();
                let parts = chunker.split(&blob);
                assert!(parts.iter().all(|p| p.len() <= size));
                let restored = pipeline.decode(&Chunker::reassemble(parts), now).unwrap();
                assert_eq!(restored, original);
            }
            let parts = chunker.split(&blob);
            assert_eq!(parts.len(), chunker.part_count(blob.len()));
            assert_eq!(pipeline.decode(&Chunker::reassemble(parts), now).unwrap(), original);
        }
    }

    #[test]
    fn test_plain_blob_without_password() {
        let pipeline = pipeline(None);
        let blob = pipeline.encode(Path::new("a"), b"hello").unwrap();
        assert_eq!(blob[0], FLAG_PLAIN);
        assert_eq!(pipeline.decode(&blob, Utc::now()).unwrap(), b"hello");
    }

    #[test]
    fn test_old_blob_decodes_after_password_change() {
        let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
        let t0 = Utc.timestamp_opt(1_000, 0).unwrap();
        config.add_password("before", t0).unwrap();
        let pipeline = Pipeline::new(config.clone(), CompressionStrategy::Fast);

        let blob = pipeline.encode(Path::new("a"), b"old secret").unwrap();
        config
            .add_password("after", Utc.timestamp_opt(2_000, 0).unwrap())
            .unwrap();
        let newer = pipeline.encode(Path::new("b"), b"new secret").unwrap();

        assert_eq!(pipeline.decode(&blob, Utc.timestamp_opt(1_500, 0).unwrap()).unwrap(), b"old secret");
        assert_eq!(pipeline.decode(&newer, Utc.timestamp_opt(2_500, 0).unwrap()).unwrap(), b"new secret");
    }

    #[test]
    fn test_unknown_password_is_reported() {
        let writer = pipeline(Some("one"));
        let reader = pipeline(Some("two"));
        let blob = writer.encode(Path::new("a"), b"x").unwrap();
        assert!(matches!(reader.decode(&blob, Utc::now()), Err(VaultError::WrongPassword)));
        assert!(reader.decode(&[], Utc::now()).is_err());
    }

    #[test]
    fn test_progress_reader_cancels() {
        let data = vec![1u8; 10_000];
        let mut seen = 0u64;
        let mut progress = |bytes: u64| {
            seen += bytes;
            seen < 4_000
        };
        let mut reader = ProgressReader::new(Cursor::new(&data), &mut progress);
        let mut buf = [0u8; 1024];
        let mut err = None;
        for _ in 0..20 {
            match reader.read(&mut buf) {
                Ok(_) => continue,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(from_io_error(err.unwrap()), VaultError::OperationCanceled));
    }

    #[test]
    fn test_counting_writer() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"de").unwrap();
        assert_eq!(writer.count(), 5);
        let (inner, count) = writer.into_inner();
        assert_eq!((inner.len() as u64), count);
    }

    #[test]
    fn test_encode_file_reports_progress() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("f.txt");
        std::fs::write(&path, content(3000)).unwrap();
        let pipeline = pipeline(None);

        let mut total = 0u64;
        let mut progress = |bytes: u64| {
            total += bytes;
            true
        };
        let blob = pipeline.encode_file(&path, &mut progress).unwrap();
        assert_eq!(total, 3000);
        assert_eq!(pipeline.decode(&blob, Utc::now()).unwrap(), content(3000));

        let mut cancel = |_: u64| false;
        assert!(matches!(pipeline.encode_file(&path, &mut cancel), Err(VaultError::OperationCanceled)));
        assert!(pipeline.encode_file(&path, &mut Unobserved).is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(Chunker::new(0).is_err());
        assert_eq!(Chunker::new(10).unwrap().split(&[]).len(), 1);
    }
}
