//! Record schema versions and the steps between them.
//!
//! The store root carries `schema.json` with the version its records follow.
//! A store written before the marker existed is inspected instead: naive
//! timestamps or patterns without an `active` flag mean version 1.
//!
//! Each step rewrites records as raw JSON objects, so fields this version
//! does not model survive, and then checks the result against the typed
//! record before writing it back.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::error::{MemoryError, Result};
use super::records::{Collection, Decision, MemoryRecord, Pattern, Solution};
use super::store::{MemoryStore, validate_agent_name, write_atomic};
use crate::security::{AuditEntry, AuditOperation};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

const SCHEMA_FILE: &str = "schema.json";

/// Upgrades one record object in place; returns whether it changed.
type Step = fn(Collection, &mut Map<String, Value>) -> bool;

/// `(from_version, step)`, applied in order.
const STEPS: [(u32, Step); 1] = [(1, upgrade_v1_record)];

/// Contents of `schema.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMarker {
    /// Schema version of the records under the root.
    pub version: u32,
    /// When the marker was last written.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Version found before migrating.
    pub from_version: u32,
    /// Version after migrating.
    pub to_version: u32,
    /// Records rewritten.
    pub records_migrated: usize,
    /// Collection files rewritten.
    pub files_updated: usize,
    /// Backups taken before migrating, as `(agent, backup_id)`.
    pub backups: Vec<(String, String)>,
}

impl MigrationReport {
    /// Whether any step ran.
    pub fn migrated(&self) -> bool {
        self.from_version != self.to_version
    }
}

pub(super) fn write_schema_marker(root: &Path, version: u32) -> Result<()> {
    let marker = SchemaMarker { version, updated_at: Utc::now() };
    write_atomic(&root.join(SCHEMA_FILE), &serde_json::to_vec_pretty(&marker)?)
}

fn read_schema_marker(root: &Path) -> Result<Option<SchemaMarker>> {
    let path = root.join(SCHEMA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
}

impl MemoryStore {
    /// Schema version of the records under the root.
    ///
    /// # Errors
    /// Returns error if the marker is unreadable, or, without a marker, if a
    /// collection cannot be read
    pub fn schema_version(&self) -> Result<u32> {
        if let Some(marker) = read_schema_marker(self.root())? {
            return Ok(marker.version);
        }

        for agent in self.list_agents()? {
            for collection in [Collection::Patterns, Collection::Solutions, Collection::Decisions] {
                let records = self.read_raw_collection(&agent, collection)?;
                let outdated = records.iter().any(|record| {
                    record.as_object().is_some_and(|object| {
                        let mut copy = object.clone();
                        upgrade_v1_record(collection, &mut copy)
                    })
                });
                if outdated {
                    return Ok(1);
                }
            }
        }
        Ok(SCHEMA_VERSION)
    }

    /// Brings every agent's records to [`SCHEMA_VERSION`].
    ///
    /// With `backup` set, each agent is backed up before its records are
    /// touched. A store already at the current version only gets its marker
    /// written.
    ///
    /// # Errors
    /// Returns `Configuration` if the store was written by a newer schema,
    /// and error if a record cannot be upgraded or written
    pub fn migrate_to_latest(&self, backup: bool) -> Result<MigrationReport> {
        let result = self.migrate_inner(backup);
        let target = result
            .as_ref()
            .map(|report| format!("v{}->v{}", report.from_version, report.to_version))
            .unwrap_or_default();
        let entry = AuditEntry::new(AuditOperation::Migrate).with_target(&target);
        self.audited(entry, result)
    }

    fn migrate_inner(&self, backup: bool) -> Result<MigrationReport> {
        let from_version = self.schema_version()?;
        if from_version > SCHEMA_VERSION {
            return Err(MemoryError::Configuration(format!(
                "store schema version {} is newer than supported version {}",
                from_version, SCHEMA_VERSION
            )));
        }

        let mut report = MigrationReport {
            from_version,
            to_version: SCHEMA_VERSION,
            records_migrated: 0,
            files_updated: 0,
            backups: Vec::new(),
        };
        if !report.migrated() {
            write_schema_marker(self.root(), SCHEMA_VERSION)?;
            return Ok(report);
        }

        let agents = self.list_agents()?;
        if backup {
            for agent in &agents {
                let backup_id = self.backup_agent_memory(agent)?;
                report.backups.push((agent.clone(), backup_id));
            }
        }

        for (version, step) in STEPS {
            if version < from_version {
                continue;
            }
            debug!(from = version, to = version + 1, "Running schema step");
            for agent in &agents {
                self.migrate_agent(agent, step, &mut report)?;
            }
        }

        write_schema_marker(self.root(), SCHEMA_VERSION)?;
        info!(
            from = from_version,
            to = SCHEMA_VERSION,
            records = report.records_migrated,
            files = report.files_updated,
            "Migrated memory schema"
        );
        Ok(report)
    }

    fn migrate_agent(&self, agent: &str, step: Step, report: &mut MigrationReport) -> Result<()> {
        validate_agent_name(agent)?;
        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().map_err(|_| MemoryError::LockPoisoned)?;

        self.migrate_collection::<Pattern>(agent, step, report)?;
        self.migrate_collection::<Solution>(agent, step, report)?;
        self.migrate_collection::<Decision>(agent, step, report)
    }

    fn migrate_collection<R: MemoryRecord>(
        &self,
        agent: &str,
        step: Step,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let mut records = self.read_raw_collection(agent, R::COLLECTION)?;
        let mut changed = 0;
        for record in &mut records {
            if let Some(object) = record.as_object_mut() {
                if step(R::COLLECTION, object) {
                    changed += 1;
                }
            }
        }
        if changed == 0 {
            return Ok(());
        }

        let value = Value::Array(records);
        validate_records::<R>(agent, &value)?;
        self.write_file(&self.collection_path(agent, R::COLLECTION), agent, &value)?;

        report.records_migrated += changed;
        report.files_updated += 1;
        Ok(())
    }

    fn read_raw_collection(&self, agent: &str, collection: Collection) -> Result<Vec<Value>> {
        let path = self.collection_path(agent, collection);
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.read_file(&path, agent)
    }
}

fn validate_records<R: MemoryRecord>(agent: &str, value: &Value) -> Result<()> {
    serde_json::from_value::<Vec<R>>(value.clone()).map(|_| ()).map_err(|e| {
        MemoryError::Configuration(format!(
            "{}/{} cannot be migrated: {}",
            agent,
            R::COLLECTION.name(),
            e
        ))
    })
}

/// Version 1 wrote timestamps without an offset and had no `active` flag on
/// patterns.
fn upgrade_v1_record(collection: Collection, record: &mut Map<String, Value>) -> bool {
    let timestamps: &[&str] = match collection {
        Collection::Patterns => &["/timestamp", "/evolution/lastUsed"],
        Collection::Solutions => &["/timestamp", "/effectiveness/lastUsed"],
        Collection::Decisions => &["/timestamp", "/outcome/recorded_at"],
        Collection::Metrics => &[],
    };

    let mut changed = false;
    for pointer in timestamps {
        let Some(field) = pointer_mut(record, pointer) else {
            continue;
        };
        if let Some(normalized) = field.as_str().and_then(normalize_timestamp) {
            *field = Value::String(normalized);
            changed = true;
        }
    }

    if collection == Collection::Patterns && !record.contains_key("active") {
        record.insert("active".to_string(), Value::Bool(true));
        changed = true;
    }
    changed
}

fn pointer_mut<'a>(record: &'a mut Map<String, Value>, pointer: &str) -> Option<&'a mut Value> {
    let mut parts = pointer.trim_start_matches('/').splitn(2, '/');
    let first = record.get_mut(parts.next()?)?;
    match parts.next() {
        Some(rest) => first.pointer_mut(&format!("/{}", rest)),
        None => Some(first),
    }
}

/// Rewrites a naive timestamp as UTC; `None` if it already has an offset or
/// is not a timestamp.
fn normalize_timestamp(text: &str) -> Option<String> {
    if DateTime::parse_from_rfc3339(text).is_ok() {
        return None;
    }
    let naive = text.parse::<NaiveDateTime>().ok()?;
    Some(naive.and_utc().to_rfc3339())
}
