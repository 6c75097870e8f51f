//! Password-based authenticated encryption
//!
//! Keys are derived from a vault password with PBKDF2-HMAC-SHA256 over a
//! vault-wide random salt. Blobs are sealed with ChaCha20-Poly1305 under a
//! fresh random nonce, laid out as `nonce || ciphertext || tag`.
//!
//! Deriving a key is deliberately slow, so [`KeyRing`] caches one derived
//! key per distinct password.

use crate::error::{Result, VaultError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use ring::aead::{Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use tracing::trace;

/// Length of the KDF salt
pub const SALT_LEN: usize = 16;

/// Length of the per-blob nonce
pub const NONCE_LEN: usize = 12;

/// Length of the Poly1305 tag appended to ciphertext
pub const TAG_LEN: usize = 16;

/// Bytes added by [`seal`] on top of the plaintext
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 32;

struct NonceSeq([u8; NONCE_LEN]);

impl NonceSequence for NonceSeq {
    fn advance(&mut self) -> std::result::Result<Nonce, Unspecified> {
        Nonce::try_assume_unique_for_key(&self.0)
    }
}

/// Key derivation parameters stored with the vault configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Base64-encoded random salt
    pub salt: String,
    /// PBKDF2 iteration count
    pub iterations: u32,
}

impl KdfParams {
    /// Fresh parameters with a random salt
    pub fn generate(iterations: u32) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| VaultError::internal("system random source unavailable"))?;
        Ok(Self {
            salt: STANDARD.encode(salt),
            iterations,
        })
    }

    fn salt_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.salt)
            .map_err(|e| VaultError::InvalidConfiguration(format!("bad KDF salt: {e}")))
    }
}

/// A derived 256-bit key
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Derive a key from a password
pub fn derive_key(password: &str, params: &KdfParams) -> Result<EncryptionKey> {
    let iterations = NonZeroU32::new(params.iterations)
        .ok_or_else(|| VaultError::InvalidConfiguration("KDF iterations must be non-zero".to_string()))?;
    let mut key = [0u8; KEY_LEN];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &params.salt_bytes()?,
        password.as_bytes(),
        &mut key,
    );
    Ok(EncryptionKey(key))
}

/// Encrypt and authenticate a buffer
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| VaultError::internal("system random source unavailable"))?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key.0)
        .map_err(|_| VaultError::internal("could not create sealing key"))?;
    let mut sealing_key = SealingKey::new(unbound, NonceSeq(nonce));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::internal("could not seal buffer"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Verify and decrypt a buffer produced by [`seal`]
///
/// # Errors
///
/// - [`VaultError::Decryption`] if the buffer is truncated, was tampered
///   with, or was sealed under a different key
pub fn open(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(VaultError::Decryption("sealed buffer too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| VaultError::Decryption("could not read nonce".to_string()))?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key.0)
        .map_err(|_| VaultError::internal("could not create opening key"))?;
    let mut opening_key = OpeningKey::new(unbound, NonceSeq(nonce));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::Decryption("authentication failed".to_string()))?;
    Ok(plaintext.to_vec())
}

/// Derived keys cached per password
#[derive(Debug)]
pub struct KeyRing {
    params: KdfParams,
    cache: DashMap<[u8; 32], EncryptionKey>,
}

impl KeyRing {
    /// Key ring over the given derivation parameters
    pub fn new(params: KdfParams) -> Self {
        Self {
            params,
            cache: DashMap::new(),
        }
    }

    /// Derivation parameters in use
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Key for a password, deriving it on first use
    pub fn key_for(&self, password: &str) -> Result<EncryptionKey> {
        let fingerprint: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        if let Some(key) = self.cache.get(&fingerprint) {
            return Ok(key.clone());
        }
        let key = derive_key(password, &self.params)?;
        trace!("Derived key for password epoch {}", hex::encode(&fingerprint[..4]));
        self.cache.insert(fingerprint, key.clone());
        Ok(key)
    }

    /// Number of cached keys
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
