//! Content digests and the textual identifiers derived from them
//!
//! A file's content is hashed with MD5 into a 16-byte [`ContentDigest`]. The
//! digest is rendered as a 22-character URL-safe base64 string without
//! padding. That string is the revision guid: it keys deduplication in the
//! revision tree and is the lookup key on every storage backend, including
//! the subject line of webmail messages, so it must never contain spaces,
//! slashes or padding.

use crate::error::{Result, VaultError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use md5::{Digest, Md5};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::trace;

/// Length of a raw digest in bytes
pub const DIGEST_LEN: usize = 16;

/// Length of the textual identifier derived from a digest
pub const IDENTIFIER_LEN: usize = 22;

/// 16-byte MD5 content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest an in-memory buffer
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Digest everything a reader yields
    ///
    /// Fails with [`VaultError::Io`] if the stream cannot be read to the end.
    pub fn of_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Digest a file on disk
    pub fn of_file(path: &Path) -> Result<Self> {
        let digest = Self::of_reader(File::open(path)?)?;
        trace!("Digested {:?} -> {}", path, digest);
        Ok(digest)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// The 22-character URL-safe identifier for this digest
    pub fn identifier(&self) -> String {
        let id = URL_SAFE_NO_PAD.encode(self.0);
        debug_assert_eq!(id.len(), IDENTIFIER_LEN);
        debug_assert_eq!(Self::from_identifier(&id).ok(), Some(*self));
        id
    }

    /// Parse an identifier back into its digest
    pub fn from_identifier(identifier: &str) -> Result<Self> {
        if identifier.len() != IDENTIFIER_LEN {
            return Err(VaultError::internal(format!(
                "identifier {identifier:?} is not {IDENTIFIER_LEN} characters"
            )));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(identifier)
            .map_err(|e| VaultError::internal(format!("identifier {identifier:?}: {e}")))?;
        let bytes: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| VaultError::internal(format!("identifier {identifier:?} has wrong length")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", hex::encode(self.0))
    }
}

/// Identifier for the legacy scheme, where each stored blob got a random guid
pub fn legacy_identifier() -> String {
    URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes())
}

/// Whether a string has the shape of an identifier
pub fn is_identifier(candidate: &str) -> bool {
    candidate.len() == IDENTIFIER_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_known_digest() {
        let digest = ContentDigest::of_bytes(b"");
        assert_eq!(hex::encode(digest.as_bytes()), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(digest.identifier(), "1B2M2Y8AsgTpgAmY7PhCfg");
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data = vec![7u8; 200_000];
        let from_reader = ContentDigest::of_reader(Cursor::new(&data)).unwrap();
        assert_eq!(from_reader, ContentDigest::of_bytes(&data));
    }

    #[test]
    fn test_identifier_round_trip() {
        let digest = ContentDigest::of_bytes(b"hello world");
        let id = digest.identifier();
        assert_eq!(id.len(), IDENTIFIER_LEN);
        assert!(is_identifier(&id));
        assert_eq!(ContentDigest::from_identifier(&id).unwrap(), digest);
    }

    #[test]
    fn test_identifier_is_subject_safe() {
        for i in 0..500u32 {
            let id = ContentDigest::of_bytes(&i.to_le_bytes()).identifier();
            assert!(!id.contains(['/', '+', '=', ' ', '[', ']']), "{id}");
        }
    }

    #[test]
    fn test_legacy_identifier_shape() {
        let a = legacy_identifier();
        let b = legacy_identifier();
        assert!(is_identifier(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_malformed_identifier() {
        assert!(ContentDigest::from_identifier("short").is_err());
        assert!(ContentDigest::from_identifier("!!!!!!!!!!!!!!!!!!!!!!").is_err());
    }
}
