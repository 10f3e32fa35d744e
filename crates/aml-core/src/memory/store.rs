//! Agent-namespaced memory store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/config.json
//! <root>/schema.json
//! <root>/<agent>/{patterns,solutions,decisions,metrics}.json
//! <root>/global/<namespace>.json
//! <root>/audit/memory-audit.log
//! <root>/backup/<agent>/<backup_id>.tar.gz
//! <root>/backup/<agent>/archive/<strategy>-<time>-<suffix>.json.gz
//! ```
//!
//! Every file is rewritten whole through a temp file and an atomic rename.
//! Writes to one agent are serialized by an in-process lock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::codec::Codec;
use super::error::{MemoryError, Result};
use super::migration;
use super::records::{
    AgentMetrics, Collection, Decision, MemoryRecord, MemorySummary, Pattern, Solution,
};
use crate::config::StorageConfig;
use crate::security::{AuditEntry, AuditLogger, AuditOperation, EncryptionEngine};

/// Top-level directory names that can never be agent names.
pub const RESERVED_NAMES: [&str; 3] = ["global", "audit", "backup"];

pub(super) const CONFIG_FILE: &str = "config.json";
const AUDIT_LOG_FILE: &str = "memory-audit.log";

/// Lock key for the global namespace; reserved, so no agent can share it.
const GLOBAL_LOCK: &str = "global";

/// Lock map size above which idle entries are dropped.
const LOCK_MAP_PRUNE_THRESHOLD: usize = 256;

/// File-backed memory store for all agents under one root.
pub struct MemoryStore {
    /// Store root.
    root: PathBuf,

    /// Effective configuration.
    config: StorageConfig,

    /// Plain or encrypted file encoding.
    codec: Codec,

    /// Audit log; `None` if it could not be opened.
    audit: Option<AuditLogger>,

    /// Per-agent write locks.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    /// Opens (and initializes if needed) the store described by `config`.
    ///
    /// # Arguments
    /// * `config` - Storage configuration
    /// * `engine` - Encryption engine, required when `config.encryption` is set
    ///
    /// # Errors
    /// Returns `Configuration` if the config is invalid or encryption is
    /// enabled without an engine, and `Io` if the root cannot be created.
    pub fn open(config: StorageConfig, engine: Option<Arc<EncryptionEngine>>) -> Result<Self> {
        config.validate().map_err(|e| MemoryError::Configuration(e.to_string()))?;

        let codec = match (config.encryption, engine) {
            (true, Some(engine)) => Codec::encrypted(engine),
            (true, None) => {
                return Err(MemoryError::Configuration(
                    "storage.encryption is enabled but no encryption engine was supplied".to_string(),
                ));
            }
            (false, _) => Codec::plain(),
        };

        let root = config.path.clone();
        let audit = match AuditLogger::new(root.join("audit").join(AUDIT_LOG_FILE)) {
            Ok(logger) => Some(logger),
            Err(e) => {
                warn!(error = %e, "Audit log unavailable; continuing without it");
                None
            }
        };

        let store = Self { root, config, codec, audit, locks: Mutex::new(HashMap::new()) };
        store.initialize()?;
        Ok(store)
    }

    /// Creates the reserved directories and the configuration artifact.
    ///
    /// Idempotent; an existing `config.json` is left untouched.
    ///
    /// # Errors
    /// Returns error if a directory or the config file cannot be written
    pub fn initialize(&self) -> Result<()> {
        for dir in RESERVED_NAMES {
            fs::create_dir_all(self.root.join(dir))?;
        }

        let config_path = self.root.join(CONFIG_FILE);
        if !config_path.exists() {
            let json = serde_json::to_vec_pretty(&self.config)?;
            write_atomic(&config_path, &json)?;
            // A fresh store starts at the current schema.
            migration::write_schema_marker(&self.root, migration::SCHEMA_VERSION)?;
            info!(root = %self.root.display(), encrypted = self.codec.is_encrypted(), "Initialized memory store");
            self.audit(&AuditEntry::new(AuditOperation::Initialize));
        }

        Ok(())
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Effective storage configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Whether record files are encrypted at rest.
    pub fn is_encrypted(&self) -> bool {
        self.codec.is_encrypted()
    }

    /// The audit logger, if it could be opened.
    pub fn audit_log(&self) -> Option<&AuditLogger> {
        self.audit.as_ref()
    }

    /// Creates the agent directory and its four files if missing.
    ///
    /// # Errors
    /// Returns `InvalidAgentName` for reserved or unsafe names
    pub fn ensure_agent_directory(&self, agent: &str) -> Result<PathBuf> {
        validate_agent_name(agent)?;
        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().map_err(|_| MemoryError::LockPoisoned)?;
        self.ensure_agent_directory_locked(agent)
    }

    /// Lists agents with a directory under the root, sorted by name.
    ///
    /// # Errors
    /// Returns error if the root cannot be read
    pub fn list_agents(&self) -> Result<Vec<String>> {
        let mut agents = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_agent_name(name).is_ok() {
                    agents.push(name.to_string());
                }
            }
        }
        agents.sort();
        Ok(agents)
    }

    /// Adds a record to its collection.
    ///
    /// # Errors
    /// Returns `Duplicate` if a record with the same id exists, and
    /// `WrongOwner` if the record belongs to another agent
    pub fn add<R: MemoryRecord>(&self, agent: &str, record: R) -> Result<()> {
        let entry = record_entry::<R>(AuditOperation::Add, agent, record.id());
        let result = self.add_inner(agent, record);
        self.audited(entry, result)
    }

    /// Returns all records of a kind; empty for an agent with no data.
    ///
    /// # Errors
    /// Returns error if the collection cannot be read or decrypted
    pub fn get<R: MemoryRecord>(&self, agent: &str) -> Result<Vec<R>> {
        validate_agent_name(agent)?;
        self.read_collection(agent)
    }

    /// Returns one record by id.
    ///
    /// # Errors
    /// Returns `NotFound` if no record has that id
    pub fn find<R: MemoryRecord>(&self, agent: &str, id: &str) -> Result<R> {
        self.get::<R>(agent)?
            .into_iter()
            .find(|record| record.id() == id)
            .ok_or_else(|| not_found::<R>(agent, id))
    }

    /// Replaces the mutable fields of an existing record, matched by id.
    ///
    /// The stored creation time is kept.
    ///
    /// # Errors
    /// Returns `NotFound` if no record has that id, and `WrongOwner` if the
    /// record belongs to another agent
    pub fn update<R: MemoryRecord>(&self, agent: &str, mut record: R) -> Result<()> {
        let entry = record_entry::<R>(AuditOperation::Update, agent, record.id());
        let id = record.id().to_string();
        let result = check_owner(agent, &record).and_then(|()| {
            self.modify::<R, _>(agent, &id, |existing| {
                record.set_created_at(existing.created_at());
                *existing = record;
            })
        });
        self.audited(entry, result.map(|_| ()))
    }

    /// Removes a record and returns it.
    ///
    /// # Errors
    /// Returns `NotFound` if no record has that id
    pub fn delete<R: MemoryRecord>(&self, agent: &str, id: &str) -> Result<R> {
        let entry = record_entry::<R>(AuditOperation::Delete, agent, id);
        let result = self.delete_inner::<R>(agent, id);
        self.audited(entry, result)
    }

    /// Folds one execution of a pattern into its metrics.
    ///
    /// # Errors
    /// Returns `NotFound` if the pattern does not exist
    pub fn record_pattern_outcome(
        &self,
        agent: &str,
        id: &str,
        success: bool,
        time_saved_ms: f64,
    ) -> Result<Pattern> {
        let entry = record_entry::<Pattern>(AuditOperation::RecordOutcome, agent, id);
        let result = self.modify::<Pattern, _>(agent, id, |pattern| {
            pattern.record_outcome(success, time_saved_ms);
        });
        self.audited(entry, result)
    }

    /// Replaces a pattern body and counts the refinement.
    ///
    /// # Errors
    /// Returns `NotFound` if the pattern does not exist
    pub fn refine_pattern(&self, agent: &str, id: &str, body: Value) -> Result<Pattern> {
        let entry = record_entry::<Pattern>(AuditOperation::Update, agent, id);
        let result = self.modify::<Pattern, _>(agent, id, |pattern| pattern.refine(body));
        self.audited(entry, result)
    }

    /// Records one application of a solution.
    ///
    /// # Errors
    /// Returns `NotFound` if the solution does not exist
    pub fn record_solution_outcome(&self, agent: &str, id: &str, worked: bool) -> Result<Solution> {
        let entry = record_entry::<Solution>(AuditOperation::RecordOutcome, agent, id);
        let result =
            self.modify::<Solution, _>(agent, id, |solution| solution.record_outcome(worked));
        self.audited(entry, result)
    }

    /// Sets the outcome of a decision.
    ///
    /// # Errors
    /// Returns `NotFound` if the decision does not exist
    pub fn record_decision_outcome(
        &self,
        agent: &str,
        id: &str,
        would_repeat: bool,
        success_metrics: BTreeMap<String, f64>,
    ) -> Result<Decision> {
        let entry = record_entry::<Decision>(AuditOperation::RecordOutcome, agent, id);
        let result = self.modify::<Decision, _>(agent, id, |decision| {
            decision.record_outcome(would_repeat, success_metrics);
        });
        self.audited(entry, result)
    }

    /// Reads the agent's metrics counters.
    ///
    /// # Errors
    /// Returns error if the metrics file cannot be read or decrypted
    pub fn get_metrics(&self, agent: &str) -> Result<AgentMetrics> {
        validate_agent_name(agent)?;
        let path = self.collection_path(agent, Collection::Metrics);
        if !path.exists() {
            return Ok(AgentMetrics::new());
        }
        self.read_file(&path, agent)
    }

    /// Applies `f` to the agent's metrics and writes them back.
    ///
    /// # Errors
    /// Returns error if the metrics cannot be read or written
    pub fn update_metrics<F>(&self, agent: &str, f: F) -> Result<AgentMetrics>
    where
        F: FnOnce(&mut AgentMetrics),
    {
        let entry = AuditEntry::new(AuditOperation::UpdateMetrics)
            .with_agent(agent)
            .with_collection(Collection::Metrics.name());
        let result = self.with_agent_locked(agent, || {
            let path = self.collection_path(agent, Collection::Metrics);
            let mut metrics: AgentMetrics = self.read_file(&path, agent)?;
            f(&mut metrics);
            self.write_file(&path, agent, &metrics)?;
            Ok(metrics)
        });
        self.audited(entry, result)
    }

    /// Counts records per kind for an agent.
    ///
    /// # Errors
    /// Returns error if a collection cannot be read
    pub fn summarize(&self, agent: &str) -> Result<MemorySummary> {
        let patterns = self.get::<Pattern>(agent)?;
        Ok(MemorySummary {
            agent: agent.to_string(),
            active_patterns: patterns.iter().filter(|p| p.active).count(),
            patterns: patterns.len(),
            solutions: self.get::<Solution>(agent)?.len(),
            decisions: self.get::<Decision>(agent)?.len(),
            size_bytes: dir_size(&self.root.join(agent)),
        })
    }

    /// Writes a global namespace value, replacing any previous one.
    ///
    /// # Errors
    /// Returns `InvalidAgentName` for an unsafe namespace name, or
    /// `Capacity` if the store is full
    pub fn set_global_data(&self, namespace: &str, value: &Value) -> Result<()> {
        let entry = AuditEntry::new(AuditOperation::SetGlobal).with_target(namespace);
        let result = validate_path_component(namespace).and_then(|()| {
            let lock = self.agent_lock(GLOBAL_LOCK)?;
            let _guard = lock.lock().map_err(|_| MemoryError::LockPoisoned)?;
            let path = self.global_path(namespace);
            self.write_file(&path, &global_context(namespace), value)
        });
        self.audited(entry, result)
    }

    /// Reads a global namespace value, if it was ever written.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or decrypted
    pub fn get_global_data(&self, namespace: &str) -> Result<Option<Value>> {
        validate_path_component(namespace)?;
        let path = self.global_path(namespace);
        if !path.exists() {
            return Ok(None);
        }
        self.read_file(&path, &global_context(namespace)).map(Some)
    }

    /// Lists written global namespaces, sorted.
    ///
    /// # Errors
    /// Returns error if the global directory cannot be read
    pub fn list_global_namespaces(&self) -> Result<Vec<String>> {
        let mut namespaces = Vec::new();
        for entry in fs::read_dir(self.root.join("global"))? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                namespaces.push(stem.to_string());
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }

    /// Total bytes under the store root.
    pub fn size_bytes(&self) -> u64 {
        dir_size(&self.root)
    }

    fn add_inner<R: MemoryRecord>(&self, agent: &str, record: R) -> Result<()> {
        check_owner(agent, &record)?;

        self.with_agent_locked(agent, || {
            let mut records: Vec<R> = self.read_collection(agent)?;
            if records.iter().any(|existing| existing.id() == record.id()) {
                return Err(MemoryError::Duplicate(format!(
                    "{}/{}/{}",
                    agent,
                    R::COLLECTION.name(),
                    record.id()
                )));
            }
            debug!(agent, collection = R::COLLECTION.name(), id = record.id(), "Adding record");
            records.push(record);
            self.write_file(&self.collection_path(agent, R::COLLECTION), agent, &records)
        })
    }

    fn delete_inner<R: MemoryRecord>(&self, agent: &str, id: &str) -> Result<R> {
        self.with_agent_locked(agent, || {
            let mut records: Vec<R> = self.read_collection(agent)?;
            let index = records
                .iter()
                .position(|record| record.id() == id)
                .ok_or_else(|| not_found::<R>(agent, id))?;
            let removed = records.remove(index);
            self.write_file(&self.collection_path(agent, R::COLLECTION), agent, &records)?;
            Ok(removed)
        })
    }

    /// Read-modify-write of one record under the agent lock.
    fn modify<R, F>(&self, agent: &str, id: &str, f: F) -> Result<R>
    where
        R: MemoryRecord,
        F: FnOnce(&mut R),
    {
        self.with_agent_locked(agent, || {
            let mut records: Vec<R> = self.read_collection(agent)?;
            let record = records
                .iter_mut()
                .find(|record| record.id() == id)
                .ok_or_else(|| not_found::<R>(agent, id))?;
            f(record);
            let updated = record.clone();
            self.write_file(&self.collection_path(agent, R::COLLECTION), agent, &records)?;
            Ok(updated)
        })
    }

    /// Runs `f` holding the agent's lock, with the agent directory present.
    fn with_agent_locked<T, F>(&self, agent: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        validate_agent_name(agent)?;
        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().map_err(|_| MemoryError::LockPoisoned)?;
        self.ensure_agent_directory_locked(agent)?;
        f()
    }

    pub(super) fn ensure_agent_directory_locked(&self, agent: &str) -> Result<PathBuf> {
        let dir = self.root.join(agent);
        let created = !dir.exists();
        fs::create_dir_all(&dir)?;

        for collection in Collection::ALL {
            let path = dir.join(collection.file_name());
            if !path.exists() {
                self.write_file(&path, agent, &collection.empty())?;
            }
        }

        if created {
            info!(agent, "Created agent memory directory");
            self.audit(&AuditEntry::new(AuditOperation::CreateAgent).with_agent(agent));
        }

        Ok(dir)
    }

    /// Lock serializing writes to one agent (or the global namespace).
    ///
    /// Entries nobody holds are dropped once the map grows past
    /// `LOCK_MAP_PRUNE_THRESHOLD`; a dropped entry is recreated on next use.
    pub(super) fn agent_lock(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| MemoryError::LockPoisoned)?;
        if locks.len() >= LOCK_MAP_PRUNE_THRESHOLD && !locks.contains_key(key) {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Ok(locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone())
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub(super) fn codec(&self) -> &Codec {
        &self.codec
    }

    pub(super) fn read_collection<R: MemoryRecord>(&self, agent: &str) -> Result<Vec<R>> {
        let path = self.collection_path(agent, R::COLLECTION);
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.read_file(&path, agent)
    }

    pub(super) fn read_file<T: DeserializeOwned>(&self, path: &Path, context: &str) -> Result<T> {
        let bytes = fs::read(path)?;
        self.codec.decode(&bytes, context)
    }

    pub(super) fn write_file<T: serde::Serialize + ?Sized>(
        &self,
        path: &Path,
        context: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = self.codec.encode(value, context)?;
        self.check_capacity(path, bytes.len() as u64)?;
        write_atomic(path, &bytes)
    }

    /// Rejects a write that would grow the root past the configured cap.
    pub(super) fn check_capacity(&self, path: &Path, new_len: u64) -> Result<()> {
        let existing = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.check_capacity_replacing(existing, new_len)
    }

    /// Rejects a change that removes `replaced` bytes and adds `added` bytes
    /// if the root would end up past the configured cap.
    ///
    /// A change that does not grow the store is always accepted, so a store
    /// already over its cap can still shrink.
    pub(super) fn check_capacity_replacing(&self, replaced: u64, added: u64) -> Result<()> {
        let Some(limit) = self.config.max_size_bytes() else {
            return Ok(());
        };
        if added <= replaced {
            return Ok(());
        }

        let used = dir_size(&self.root).saturating_sub(replaced) + added;
        if used > limit {
            warn!(used, limit, "Memory store capacity exceeded");
            return Err(MemoryError::Capacity { used, limit });
        }
        Ok(())
    }

    pub(super) fn collection_path(&self, agent: &str, collection: Collection) -> PathBuf {
        self.root.join(agent).join(collection.file_name())
    }

    pub(super) fn global_path(&self, namespace: &str) -> PathBuf {
        self.root.join("global").join(format!("{}.json", namespace))
    }

    /// Logs `entry`, marked failed if `result` is an error, and passes
    /// `result` through.
    pub(super) fn audited<T>(&self, entry: AuditEntry, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.audit(&entry);
                Ok(value)
            }
            Err(e) => {
                self.audit(&entry.failed(e.kind().as_str()));
                Err(e)
            }
        }
    }

    pub(super) fn audit(&self, entry: &AuditEntry) {
        if let Some(ref logger) = self.audit {
            if let Err(e) = logger.log(entry) {
                warn!(error = %e, "Failed to write audit entry");
            }
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("root", &self.root)
            .field("encrypted", &self.codec.is_encrypted())
            .finish_non_exhaustive()
    }
}

/// Writes `bytes` to a temp file beside `path` and renames it into place.
pub(super) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;
    let file = stage_file(dir, bytes)?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes `bytes` to a temp file in `dir`; the file is removed on drop
/// unless persisted.
pub(super) fn stage_file(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

/// Sum of file sizes below `path`; unreadable entries are skipped.
pub(super) fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

pub(super) fn validate_agent_name(agent: &str) -> Result<()> {
    validate_path_component(agent)?;
    if RESERVED_NAMES.contains(&agent) {
        return Err(MemoryError::InvalidAgentName(format!("{} is reserved", agent)));
    }
    Ok(())
}

/// Accepts names that stay a single directory entry below the root.
fn validate_path_component(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MemoryError::InvalidAgentName("name must not be empty".to_string()));
    }
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(MemoryError::InvalidAgentName(format!("{:?} is not a safe name", name)));
    }
    Ok(())
}

fn check_owner<R: MemoryRecord>(agent: &str, record: &R) -> Result<()> {
    if record.agent() != agent {
        return Err(MemoryError::WrongOwner {
            id: record.id().to_string(),
            owner: record.agent().to_string(),
            agent: agent.to_string(),
        });
    }
    Ok(())
}

pub(super) fn global_context(namespace: &str) -> String {
    format!("global/{}", namespace)
}

fn record_entry<R: MemoryRecord>(operation: AuditOperation, agent: &str, id: &str) -> AuditEntry {
    AuditEntry::new(operation).with_agent(agent).with_collection(R::COLLECTION.name()).with_target(id)
}

fn not_found<R: MemoryRecord>(agent: &str, id: &str) -> MemoryError {
    MemoryError::NotFound(format!("{}/{}/{}", agent, R::COLLECTION.name(), id))
}
