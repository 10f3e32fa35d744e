//! Command implementations for the AML CLI.

pub mod agents;
pub mod backup;
pub mod global;
pub mod health;
pub mod init;
pub mod keygen;
pub mod migrate;
pub mod patterns;
pub mod prune;

use std::path::PathBuf;
use std::sync::Arc;

use aml_core::config::AmlConfig;
use aml_core::memory::MemoryStore;
use aml_core::security::{EncryptionEngine, MasterKey};
use anyhow::{Context, Result, anyhow};

pub use backup::BackupCommand;
pub use global::GlobalCommand;
pub use prune::StrategyArg;

/// Environment variable holding the base64 master key.
pub const MASTER_KEY_ENV: &str = "AML_MASTER_KEY";

/// Global options that select and open the store.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Root override from `--root`.
    pub root: Option<PathBuf>,
    /// Explicit config file from `--config`.
    pub config: Option<PathBuf>,
}

impl StoreOptions {
    /// Resolves the effective configuration.
    pub fn load_config(&self) -> Result<AmlConfig> {
        let mut config = match self.config {
            Some(ref path) => {
                let mut config = AmlConfig::load_from_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                config.apply_env(|name| std::env::var(name).ok())?;
                config
            }
            None => AmlConfig::discover_and_load().context("Failed to load configuration")?,
        };

        if let Some(ref root) = self.root {
            config.storage.path.clone_from(root);
        }
        config.validate()?;
        Ok(config)
    }

    /// Opens the store, loading the master key when encryption is enabled.
    pub fn open_store(&self) -> Result<MemoryStore> {
        self.open_store_with_config().map(|(store, _)| store)
    }

    /// Opens the store and also returns the configuration it was opened
    /// with, for commands that need the prune or backup sections.
    pub fn open_store_with_config(&self) -> Result<(MemoryStore, AmlConfig)> {
        let config = self.load_config()?;

        let engine = if config.storage.encryption {
            let encoded = std::env::var(MASTER_KEY_ENV).map_err(|_| {
                anyhow!(
                    "Encryption is enabled but {} is not set. Generate a key with 'aml keygen'.",
                    MASTER_KEY_ENV
                )
            })?;
            let key = MasterKey::from_base64(encoded.trim())
                .with_context(|| format!("{} is not a valid master key", MASTER_KEY_ENV))?;
            Some(Arc::new(EncryptionEngine::with_master_key(key)))
        } else {
            None
        };

        let root = config.storage.path.display().to_string();
        let store = MemoryStore::open(config.storage.clone(), engine)
            .with_context(|| format!("Failed to open memory store at {}", root))?;
        Ok((store, config))
    }
}
