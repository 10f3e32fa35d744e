//! Agent-namespaced memory: patterns, solutions, decisions and metrics.
//!
//! Besides record storage the store prunes stale or failing records,
//! migrates records between schema versions and reports on its own health.
//!
//! Each agent owns a directory of whole-file JSON collections. When the
//! store is opened with encryption enabled, every file is sealed by the
//! [`EncryptionEngine`](crate::security::EncryptionEngine) under the agent's
//! name as key-derivation context.
//!
//! # Example
//!
//! ```rust,no_run
//! use aml_core::config::StorageConfig;
//! use aml_core::memory::{MemoryStore, Pattern};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::open(StorageConfig::at(".aml/memory"), None)?;
//!
//! store.add("frontend-developer", Pattern::new("p1", "frontend-developer", json!({
//!     "type": "component-structure",
//! })))?;
//! store.record_pattern_outcome("frontend-developer", "p1", true, 1500.0)?;
//!
//! let backup_id = store.backup_agent_memory("frontend-developer")?;
//! store.restore_agent_memory("frontend-developer", &backup_id)?;
//! # Ok(())
//! # }
//! ```

mod backup;
mod codec;
mod error;
mod health;
mod migration;
mod prune;
mod records;
mod store;

pub use backup::{BackupFile, BackupInfo, BackupManifest};
pub use error::{ErrorKind, MemoryError, Result};
pub use health::{HealthReport, HealthStatus, MemoryStats};
pub use migration::{MigrationReport, SCHEMA_VERSION, SchemaMarker};
pub use prune::{PruneArchive, PruneReason, PruneReport, PruneStrategy, PrunedRecord};
pub use records::{
    AgentMetrics, Collection, Decision, DecisionOutcome, INITIAL_CONFIDENCE, MemoryRecord,
    MemorySummary, Pattern, PatternEvolution, PatternMetrics, Solution, SolutionEffectiveness,
};
pub use store::{MemoryStore, RESERVED_NAMES};
