//! AML Core - encrypted, agent-namespaced memory for multi-agent automation.
//!
//! This crate provides:
//! - An encryption engine with authenticated envelopes, context-scoped key
//!   derivation, key caching and master key rotation
//! - A file-backed memory store for patterns, solutions, decisions and
//!   metrics, with global key/value data and point-in-time backups
//! - Pruning, schema migration and health checks over the stored memory
//! - Configuration loading and an append-only audit log
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use aml_core::{AmlConfig, EncryptionEngine, MemoryStore};
//!
//! fn main() -> aml_core::Result<()> {
//!     let config = AmlConfig::discover_and_load()?;
//!     let engine = Arc::new(EncryptionEngine::generate());
//!     let store = MemoryStore::open(config.storage, Some(engine))?;
//!     println!("agents: {:?}", store.list_agents()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod security;

pub use config::{AmlConfig, BackupConfig, ConfigError, PruneConfig, StorageConfig};
pub use error::{AmlError, Result};
pub use memory::{
    BackupInfo, BackupManifest, Decision, ErrorKind, HealthReport, HealthStatus, MemoryError,
    MemoryRecord, MemoryStore, Pattern, PruneReport, PruneStrategy, Solution,
};
pub use security::{
    AuditLogger, EncryptedEnvelope, EncryptionEngine, MasterKey, SecurityError, StoredEnvelope,
};
