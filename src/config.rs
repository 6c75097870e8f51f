//! Vault configuration: password history, parameters and store settings
//!
//! The configuration is a pretty-printed JSON document so it stays easy to
//! diff. Everything sensitive (the password history and the secret
//! parameters, such as webmail credentials) lives in one section sealed with
//! the newest password. A vault without any password keeps that section in
//! plain text.
//!
//! ```text
//! {
//!   "format_version": 1,
//!   "kdf": { "salt": "...", "iterations": 100000 },
//!   "parameters": { "last_index": "..." },
//!   "secrets": { "protection": "sealed", "blob": "base64(nonce||ciphertext||tag)" },
//!   "stores": [ { "kind": "local_disk", "name": "disk", ... } ]
//! }
//! ```
//!
//! Passwords form an ordered list of epochs. Content is always encrypted
//! with the newest password, and decrypted with whichever password was
//! current as of the revision's backup date, so old backups stay readable
//! after a password change.

use crate::crypto::{self, EncryptionKey, KdfParams, KeyRing, DEFAULT_ITERATIONS};
use crate::error::{Result, VaultError};
use crate::revision::RevisionIdentifier;
use crate::store::StoreSettings;
use crate::utils::atomic_write;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Current configuration document version
pub const CONFIG_FORMAT_VERSION: u32 = 1;

/// Parameter key holding the most recent self-backed-up index
pub const LAST_INDEX_PARAMETER: &str = "last_index";

/// A password and the moment it took effect
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordEpoch {
    /// The password
    pub password: String,
    /// When it became the current password
    pub effective: DateTime<Utc>,
}

impl std::fmt::Debug for PasswordEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordEpoch")
            .field("password", &"<redacted>")
            .field("effective", &self.effective)
            .finish()
    }
}

/// Where the self-backed-up index lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Identifier the index was stored under
    pub identifier: RevisionIdentifier,
    /// Backup date, selects the password epoch for decryption
    pub date: DateTime<Utc>,
    /// Bytes charged to the store
    pub stored_size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigDocument {
    format_version: u32,
    kdf: KdfParams,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
    secrets: SecretSection,
    #[serde(default)]
    stores: Vec<StoreSettings>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "protection", rename_all = "snake_case")]
enum SecretSection {
    Plain {
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
    Sealed {
        blob: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretDocument {
    passwords: Vec<PasswordEpoch>,
    parameters: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ConfigState {
    path: Option<PathBuf>,
    passwords: Vec<PasswordEpoch>,
    parameters: BTreeMap<String, String>,
    secret_parameters: BTreeMap<String, String>,
    stores: Vec<StoreSettings>,
}

/// The vault's configuration, guarded by a single lock
#[derive(Debug)]
pub struct VaultConfiguration {
    keys: KeyRing,
    state: Mutex<ConfigState>,
}

impl VaultConfiguration {
    /// In-memory configuration with a fresh KDF salt
    pub fn new(kdf_iterations: u32) -> Result<Self> {
        Ok(Self {
            keys: KeyRing::new(KdfParams::generate(kdf_iterations)?),
            state: Mutex::new(ConfigState::default()),
        })
    }

    /// Create a configuration file at `path`
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if a file already exists there
    pub fn create(path: &Path, kdf_iterations: u32) -> Result<Self> {
        if path.exists() {
            return Err(VaultError::InvalidConfiguration(format!(
                "configuration already exists at {path:?}"
            )));
        }
        let config = Self::new(kdf_iterations)?;
        config.state.lock().path = Some(path.to_path_buf());
        config.save()?;
        info!("Created vault configuration at {:?}", path);
        Ok(config)
    }

    /// Create with the default iteration count
    pub fn create_default(path: &Path) -> Result<Self> {
        Self::create(path, DEFAULT_ITERATIONS)
    }

    /// Load a configuration file, unlocking it with the newest password
    ///
    /// # Errors
    ///
    /// - [`VaultError::WrongPassword`] if the secrets are sealed and the
    ///   password is missing or wrong
    /// - [`VaultError::Json`] if the document is malformed
    pub fn load(path: &Path, password: Option<&str>) -> Result<Self> {
        let document: ConfigDocument = serde_json::from_slice(&fs::read(path)?)?;
        if document.format_version > CONFIG_FORMAT_VERSION {
            return Err(VaultError::InvalidConfiguration(format!(
                "configuration format {} is newer than supported {}",
                document.format_version, CONFIG_FORMAT_VERSION
            )));
        }

        let keys = KeyRing::new(document.kdf);
        let secrets = match document.secrets {
            SecretSection::Plain { parameters } => SecretDocument {
                passwords: Vec::new(),
                parameters,
            },
            SecretSection::Sealed { blob } => {
                let password = password.ok_or(VaultError::WrongPassword)?;
                let sealed = STANDARD
                    .decode(blob)
                    .map_err(|e| VaultError::InvalidConfiguration(format!("bad secrets blob: {e}")))?;
                let plain = crypto::open(&keys.key_for(password)?, &sealed)
                    .map_err(|_| VaultError::WrongPassword)?;
                serde_json::from_slice(&plain)?
            }
        };

        debug!(
            "Loaded configuration {:?}: {} password epoch(s), {} store(s)",
            path,
            secrets.passwords.len(),
            document.stores.len()
        );
        Ok(Self {
            keys,
            state: Mutex::new(ConfigState {
                path: Some(path.to_path_buf()),
                passwords: secrets.passwords,
                parameters: document.parameters,
                secret_parameters: secrets.parameters,
                stores: document.stores,
            }),
        })
    }

    /// Path the configuration is saved to, if any
    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().path.clone()
    }

    /// Serialize to the JSON document
    pub fn to_json(&self) -> Result<String> {
        let state = self.state.lock();
        let secrets = SecretDocument {
            passwords: state.passwords.clone(),
            parameters: state.secret_parameters.clone(),
        };
        let secrets = match state.passwords.last() {
            None => SecretSection::Plain {
                parameters: secrets.parameters,
            },
            Some(newest) => {
                let key = self.keys.key_for(&newest.password)?;
                let sealed = crypto::seal(&key, &serde_json::to_vec(&secrets)?)?;
                SecretSection::Sealed {
                    blob: STANDARD.encode(sealed),
                }
            }
        };
        let document = ConfigDocument {
            format_version: CONFIG_FORMAT_VERSION,
            kdf: self.keys.params().clone(),
            parameters: state.parameters.clone(),
            secrets,
            stores: state.stores.clone(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Persist to the configuration path (no-op for in-memory configurations)
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        let json = self.to_json()?;
        atomic_write(&path, json.as_bytes())?;
        debug!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Append a password epoch
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if `effective` is not after the
    ///   newest epoch, or the password is empty
    pub fn add_password(&self, password: &str, effective: DateTime<Utc>) -> Result<()> {
        if password.is_empty() {
            return Err(VaultError::InvalidConfiguration("password must not be empty".to_string()));
        }
        let mut state = self.state.lock();
        if let Some(newest) = state.passwords.last() {
            if effective <= newest.effective {
                return Err(VaultError::InvalidConfiguration(format!(
                    "password effective date {effective} is not after {}",
                    newest.effective
                )));
            }
        }
        state.passwords.push(PasswordEpoch {
            password: password.to_string(),
            effective,
        });
        info!("Added password epoch effective {}", effective);
        Ok(())
    }

    /// Make `password` current from now on and persist the change
    pub fn change_password(&self, password: &str) -> Result<()> {
        self.add_password(password, Utc::now())?;
        self.save()
    }

    /// Whether content is encrypted
    pub fn has_password(&self) -> bool {
        !self.state.lock().passwords.is_empty()
    }

    /// Number of password epochs
    pub fn password_count(&self) -> usize {
        self.state.lock().passwords.len()
    }

    /// The newest password
    pub fn current_password(&self) -> Option<String> {
        self.state.lock().passwords.last().map(|e| e.password.clone())
    }

    /// The password that was current at `date`
    ///
    /// `None` if no password had taken effect yet.
    pub fn password_as_of(&self, date: DateTime<Utc>) -> Option<String> {
        self.state
            .lock()
            .passwords
            .iter()
            .rev()
            .find(|e| e.effective <= date)
            .map(|e| e.password.clone())
    }

    /// Key for new content
    pub fn current_key(&self) -> Result<Option<EncryptionKey>> {
        self.current_password()
            .map(|p| self.keys.key_for(&p))
            .transpose()
    }

    /// Key for content backed up at `date`
    pub fn key_as_of(&self, date: DateTime<Utc>) -> Result<Option<EncryptionKey>> {
        self.password_as_of(date)
            .map(|p| self.keys.key_for(&p))
            .transpose()
    }

    /// Keys of every epoch, newest first
    pub fn keys_newest_first(&self) -> Result<Vec<EncryptionKey>> {
        let passwords: Vec<String> = self
            .state
            .lock()
            .passwords
            .iter()
            .rev()
            .map(|e| e.password.clone())
            .collect();
        passwords.iter().map(|p| self.keys.key_for(p)).collect()
    }

    /// Plain parameter
    pub fn parameter(&self, key: &str) -> Option<String> {
        self.state.lock().parameters.get(key).cloned()
    }

    /// Set a plain parameter
    pub fn set_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().parameters.insert(key.into(), value.into());
    }

    /// Remove a plain parameter
    pub fn remove_parameter(&self, key: &str) -> Option<String> {
        self.state.lock().parameters.remove(key)
    }

    /// Parameter kept in the sealed section
    pub fn secret_parameter(&self, key: &str) -> Option<String> {
        self.state.lock().secret_parameters.get(key).cloned()
    }

    /// Set a parameter kept in the sealed section
    pub fn set_secret_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .secret_parameters
            .insert(key.into(), value.into());
    }

    /// Settings of every configured store, in admission order
    pub fn stores(&self) -> Vec<StoreSettings> {
        self.state.lock().stores.clone()
    }

    /// Add a store's settings
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if the name is already taken
    pub fn add_store(&self, settings: StoreSettings) -> Result<()> {
        let mut state = self.state.lock();
        if state.stores.iter().any(|s| s.name() == settings.name()) {
            return Err(VaultError::InvalidConfiguration(format!(
                "a store named '{}' already exists",
                settings.name()
            )));
        }
        state.stores.push(settings);
        Ok(())
    }

    /// Remove a store's settings by name
    pub fn remove_store(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.stores.len();
        state.stores.retain(|s| s.name() != name);
        state.stores.len() != before
    }

    /// The most recent self-backed-up index
    pub fn last_index(&self) -> Result<Option<IndexRecord>> {
        self.parameter(LAST_INDEX_PARAMETER)
            .map(|json| serde_json::from_str(&json).map_err(VaultError::from))
            .transpose()
    }

    /// Record the most recent self-backed-up index
    pub fn set_last_index(&self, record: &IndexRecord) -> Result<()> {
        self.set_parameter(LAST_INDEX_PARAMETER, serde_json::to_string(record)?);
        Ok(())
    }
}
