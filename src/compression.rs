//! LZ4 compression stage of the transport pipeline
//!
//! Every stored blob starts with a 4-byte header that says how the rest is
//! encoded:
//!
//! - `LZ4V` (0x4C5A3456): LZ4 block with the uncompressed length prepended
//! - `\0\0\0\0`: the original bytes follow unchanged
//!
//! Content that does not shrink, is too small, or matches a skip rule of the
//! configured [`CompressionStrategy`] is stored raw.
//!
//! ## Examples
//!
//! ```rust
//! use vaultkeeper::compression::{CompressionEngine, CompressionStrategy};
//! use std::path::Path;
//!
//! let engine = CompressionEngine::new(CompressionStrategy::Fast);
//! let data = b"Hello, world! ".repeat(200);
//! let compressed = engine.compress(Path::new("hello.txt"), &data).unwrap();
//! assert!(compressed.len() < data.len());
//! assert_eq!(engine.decompress(&compressed).unwrap(), data);
//! ```

use crate::error::{Result, VaultError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::Mutex;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, trace};

/// Header of LZ4-compressed content
pub const LZ4_MAGIC: &[u8; 4] = b"LZ4V";

/// Header of content stored raw
pub const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

/// Length of either header
pub const HEADER_LEN: usize = 4;

/// Below this size compression is never attempted
const MIN_COMPRESSIBLE: usize = 64;

/// When and how content is compressed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CompressionStrategy {
    /// Store everything raw
    None,

    /// LZ4 for everything of at least 1 KB (default)
    #[default]
    Fast,

    /// LZ4 except for small files and already-compressed formats
    Adaptive {
        /// Skip compression for files smaller than this
        min_size: usize,
        /// Skip these file extensions (case-insensitive)
        skip_extensions: Vec<String>,
    },
}

impl FromStr for CompressionStrategy {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "fast" => Ok(Self::Fast),
            "adaptive" => Ok(Self::Adaptive {
                min_size: 4096,
                skip_extensions: default_skip_extensions(),
            }),
            other => Err(VaultError::InvalidConfiguration(format!(
                "unknown compression strategy '{other}'"
            ))),
        }
    }
}

/// Running compression statistics
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    /// Number of blobs compressed
    pub files_compressed: usize,
    /// Number of blobs stored raw
    pub files_stored_raw: usize,
    /// Total bytes saved by compression
    pub bytes_saved: usize,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
}

impl CompressionStats {
    /// Fraction of blobs that were compressed
    pub fn compression_ratio(&self) -> f64 {
        let total = self.files_compressed + self.files_stored_raw;
        if total == 0 {
            return 0.0;
        }
        self.files_compressed as f64 / total as f64
    }
}

/// LZ4 engine applying a [`CompressionStrategy`]
///
/// Safe to share between threads; statistics are kept behind a lock.
#[derive(Debug, Default)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    stats: Mutex<CompressionStats>,
}

impl CompressionEngine {
    /// Create an engine with the given strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    /// Strategy in use
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Snapshot of the statistics collected so far
    pub fn stats(&self) -> CompressionStats {
        self.stats.lock().clone()
    }

    /// Compress content, prepending the format header
    ///
    /// `path` is only consulted for the strategy's extension rules.
    pub fn compress(&self, path: &Path, content: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();

        if !self.should_compress(path, content.len()) {
            trace!("Storing {:?} raw (strategy)", path);
            self.stats.lock().files_stored_raw += 1;
            return Ok(with_header(RAW_MAGIC, content));
        }

        let compressed = compress_prepend_size(content);
        let mut stats = self.stats.lock();
        if compressed.len() < content.len() {
            let saved = content.len() - compressed.len();
            stats.bytes_saved += saved;
            stats.files_compressed += 1;
            stats.compression_time_ms += start.elapsed().as_millis() as u64;
            debug!(
                "Compressed {:?}: {} -> {} bytes ({:.1}% saved)",
                path,
                content.len(),
                compressed.len(),
                (saved as f64 / content.len() as f64) * 100.0
            );
            Ok(with_header(LZ4_MAGIC, &compressed))
        } else {
            trace!("Compression not beneficial for {:?}, storing raw", path);
            stats.files_stored_raw += 1;
            Ok(with_header(RAW_MAGIC, content))
        }
    }

    /// Decompress content produced by [`compress`](Self::compress)
    ///
    /// # Errors
    ///
    /// - [`VaultError::Decompression`] if the header is unknown or the LZ4
    ///   block is corrupt
    pub fn decompress(&self, content: &[u8]) -> Result<Vec<u8>> {
        if content.len() < HEADER_LEN {
            return Err(VaultError::Decompression("content too short".to_string()));
        }
        let (header, body) = content.split_at(HEADER_LEN);
        if header == LZ4_MAGIC {
            let decompressed = decompress_size_prepended(body)
                .map_err(|e| VaultError::Decompression(format!("LZ4 decompression failed: {e}")))?;
            trace!("Decompressed {} bytes to {} bytes", content.len(), decompressed.len());
            Ok(decompressed)
        } else if header == RAW_MAGIC {
            Ok(body.to_vec())
        } else {
            Err(VaultError::Decompression(format!(
                "unknown content header {}",
                hex::encode(header)
            )))
        }
    }

    fn should_compress(&self, path: &Path, size: usize) -> bool {
        if size < MIN_COMPRESSIBLE {
            return false;
        }
        match &self.strategy {
            CompressionStrategy::None => false,
            CompressionStrategy::Fast => size >= 1024,
            CompressionStrategy::Adaptive {
                min_size,
                skip_extensions,
            } => {
                if size < *min_size {
                    return false;
                }
                match path.extension().and_then(|e| e.to_str()) {
                    Some(ext) => !skip_extensions.iter().any(|s| s.eq_ignore_ascii_case(ext)),
                    None => true,
                }
            }
        }
    }
}

fn with_header(header: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(header);
    out.extend_from_slice(body);
    out
}

/// Extensions of formats that are already compressed
pub fn default_skip_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "gif", "webp", "heic", "mp3", "mp4", "m4a", "mov", "avi", "mkv",
        "zip", "gz", "bz2", "xz", "7z", "rar", "zst", "pdf", "docx", "xlsx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
