//! Store construction from persisted settings
//!
//! Each backend kind has a stable name that appears in configuration files
//! and CLI arguments. A [`StoreRegistry`] maps kinds to factories and turns
//! [`StoreSettings`] back into live stores.
//!
//! Local disk and noop stores need nothing beyond their settings and are
//! registered by [`StoreRegistry::with_defaults`]. Webmail stores need a
//! mail transport, which the caller supplies through
//! [`StoreRegistry::register_gmail`].

use super::{
    CoordinatingFileStore, FileStore, GMailFileStore, LocalDiskFileStore, LocalDiskSettings,
    MailTransport, NoopFileStore, NoopSettings, WebMailSettings,
};
use crate::collections::{HashMap, HashMapExt};
use crate::config::VaultConfiguration;
use crate::error::{Result, VaultError};
use crate::transport::Pipeline;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// [`LocalDiskFileStore`]
    LocalDisk,
    /// [`GMailFileStore`]
    Gmail,
    /// [`NoopFileStore`]
    Noop,
}

impl StoreKind {
    /// Every kind
    pub const ALL: [StoreKind; 3] = [StoreKind::LocalDisk, StoreKind::Gmail, StoreKind::Noop];

    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::LocalDisk => "local_disk",
            StoreKind::Gmail => "gmail",
            StoreKind::Noop => "noop",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        StoreKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| VaultError::UnknownStore(s.to_string()))
    }
}

/// Persisted settings of one store, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreSettings {
    /// Local disk store
    LocalDisk(LocalDiskSettings),
    /// Gmail store
    Gmail(WebMailSettings),
    /// Noop store
    Noop(NoopSettings),
}

impl StoreSettings {
    /// Store name
    pub fn name(&self) -> &str {
        match self {
            StoreSettings::LocalDisk(s) => &s.name,
            StoreSettings::Gmail(s) => &s.name,
            StoreSettings::Noop(s) => &s.name,
        }
    }

    /// Store kind
    pub fn kind(&self) -> StoreKind {
        match self {
            StoreSettings::LocalDisk(_) => StoreKind::LocalDisk,
            StoreSettings::Gmail(_) => StoreKind::Gmail,
            StoreSettings::Noop(_) => StoreKind::Noop,
        }
    }
}

/// What a factory gets besides the settings
#[derive(Debug, Clone)]
pub struct StoreContext {
    /// Shared transport pipeline
    pub pipeline: Arc<Pipeline>,
    /// Vault configuration (for secret parameters)
    pub config: Arc<VaultConfiguration>,
}

type StoreFactory =
    Box<dyn Fn(&StoreSettings, &StoreContext) -> Result<Arc<dyn FileStore>> + Send + Sync>;

/// Factories keyed by [`StoreKind`]
pub struct StoreRegistry {
    factories: HashMap<StoreKind, StoreFactory>,
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.factories.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("StoreRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StoreRegistry {
    /// Registry with no factories
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the local disk and noop factories
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(StoreKind::LocalDisk, |settings, context| match settings {
            StoreSettings::LocalDisk(local) => Ok(Arc::new(LocalDiskFileStore::open(
                local.clone(),
                context.pipeline.clone(),
            )?) as Arc<dyn FileStore>),
            other => Err(mismatch(StoreKind::LocalDisk, other)),
        });
        registry.register(StoreKind::Noop, |settings, _| match settings {
            StoreSettings::Noop(noop) => {
                Ok(Arc::new(NoopFileStore::new(noop.clone())) as Arc<dyn FileStore>)
            }
            other => Err(mismatch(StoreKind::Noop, other)),
        });
        registry
    }

    /// Register (or replace) the factory for `kind`
    pub fn register<F>(&mut self, kind: StoreKind, factory: F)
    where
        F: Fn(&StoreSettings, &StoreContext) -> Result<Arc<dyn FileStore>> + Send + Sync + 'static,
    {
        if self.factories.insert(kind, Box::new(factory)).is_some() {
            debug!("Replaced factory for {}", kind);
        }
    }

    /// Register the Gmail factory over `transport`
    ///
    /// The account password is read from the secret parameter named by
    /// [`WebMailSettings::password_parameter`].
    pub fn register_gmail<T>(&mut self, transport: Arc<T>)
    where
        T: MailTransport + 'static,
    {
        self.register(StoreKind::Gmail, move |settings, context| match settings {
            StoreSettings::Gmail(mail) => {
                let password = context
                    .config
                    .secret_parameter(&WebMailSettings::password_parameter(&mail.name));
                if password.is_none() {
                    warn!("No password stored for '{}'", mail.name);
                }
                Ok(Arc::new(GMailFileStore::new(
                    mail.clone(),
                    password,
                    transport.clone(),
                    context.pipeline.clone(),
                )) as Arc<dyn FileStore>)
            }
            other => Err(mismatch(StoreKind::Gmail, other)),
        });
    }

    /// Whether a factory exists for `kind`
    pub fn supports(&self, kind: StoreKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Build one store
    ///
    /// # Errors
    ///
    /// - [`VaultError::UnknownStore`] if no factory handles the settings' kind
    /// - whatever the factory fails with
    pub fn build(&self, settings: &StoreSettings, context: &StoreContext) -> Result<Arc<dyn FileStore>> {
        let factory = self
            .factories
            .get(&settings.kind())
            .ok_or_else(|| VaultError::UnknownStore(settings.kind().to_string()))?;
        factory(settings, context)
    }

    /// Build every store and coordinate them in the given order
    pub fn build_all(
        &self,
        name: &str,
        settings: &[StoreSettings],
        context: &StoreContext,
    ) -> Result<CoordinatingFileStore> {
        let stores = settings
            .iter()
            .map(|s| self.build(s, context))
            .collect::<Result<Vec<_>>>()?;
        Ok(CoordinatingFileStore::new(name, stores)?.with_pipeline(context.pipeline.clone()))
    }
}

fn mismatch(expected: StoreKind, settings: &StoreSettings) -> VaultError {
    VaultError::internal(format!(
        "{} factory received settings of kind {}",
        expected,
        settings.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionStrategy;
    use crate::store::MemoryMailbox;
    use tempfile::TempDir;

    fn context() -> StoreContext {
        let config = Arc::new(VaultConfiguration::new(1_000).unwrap());
        StoreContext {
            pipeline: Arc::new(Pipeline::new(config.clone(), CompressionStrategy::Fast)),
            config,
        }
    }

    #[test]
    fn test_kind_names_are_stable() {
        for kind in StoreKind::ALL {
            assert_eq!(kind.as_str().parse::<StoreKind>().unwrap(), kind);
        }
        assert_eq!(StoreKind::LocalDisk.to_string(), "local_disk");
        assert!("ftp".parse::<StoreKind>().is_err());
    }

    #[test]
    fn test_settings_are_tagged_by_kind() {
        let settings = StoreSettings::Gmail(WebMailSettings {
            name: "mail".to_string(),
            account: "me@example.com".to_string(),
            outgoing_limit: None,
            capacity: Some(1000),
        });
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["kind"], "gmail");
        assert_eq!(json["account"], "me@example.com");
        let back: StoreSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_build_all() {
        let temp_dir = TempDir::new().unwrap();
        let settings = vec![
            StoreSettings::LocalDisk(LocalDiskSettings {
                name: "disk".to_string(),
                root: temp_dir.path().join("blobs"),
                capacity: 1000,
                fan_out: 1,
            }),
            StoreSettings::Noop(NoopSettings {
                name: "null".to_string(),
                capacity: 24,
            }),
        ];
        let coordinator = StoreRegistry::with_defaults()
            .build_all("vault", &settings, &context())
            .unwrap();
        assert_eq!(coordinator.stores().len(), 2);
        assert_eq!(coordinator.available_bytes().unwrap(), 1024);
    }

    #[test]
    fn test_gmail_needs_registration() {
        let settings = StoreSettings::Gmail(WebMailSettings {
            name: "mail".to_string(),
            account: "me@example.com".to_string(),
            outgoing_limit: None,
            capacity: None,
        });
        let context = context();
        let mut registry = StoreRegistry::with_defaults();
        assert!(matches!(registry.build(&settings, &context), Err(VaultError::UnknownStore(_))));

        context.config.set_secret_parameter("mail.password", "pw");
        registry.register_gmail(Arc::new(MemoryMailbox::new("me@example.com", "pw", 1 << 16, 1 << 20)));
        let store = registry.build(&settings, &context).unwrap();
        assert_eq!(store.kind(), StoreKind::Gmail);
        assert!(store.is_configured());
    }
}
