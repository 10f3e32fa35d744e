//! Store statistics and health checks.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::error::Result;
use super::migration::SCHEMA_VERSION;
use super::records::Collection;
use super::store::{CONFIG_FILE, MemoryStore, RESERVED_NAMES, dir_size, global_context};

/// Age after which the newest backup no longer counts as recent.
const RECENT_BACKUP_HOURS: i64 = 24;

/// Share of the size cap above which a warning is raised.
const CAPACITY_WARNING_RATIO: f64 = 0.9;

/// Overall verdict of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All checks passed.
    Healthy,
    /// Something needs attention soon.
    Warning,
    /// Data is unreadable or the store is over its cap.
    Critical,
}

impl HealthStatus {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Size and record counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Bytes under the store root.
    pub total_size_bytes: u64,
    /// Agents with a directory.
    pub agent_count: usize,
    /// Patterns across all agents.
    pub patterns: usize,
    /// Solutions across all agents.
    pub solutions: usize,
    /// Decisions across all agents.
    pub decisions: usize,
    /// Agent with the largest directory.
    pub largest_agent: Option<String>,
    /// Size of that directory.
    pub largest_agent_size_bytes: u64,
}

/// Result of [`MemoryStore::health_check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Overall verdict.
    pub status: HealthStatus,
    /// Pass or fail per named check.
    pub checks: BTreeMap<String, bool>,
    /// Conditions that need attention.
    pub warnings: Vec<String>,
    /// Conditions that break the store.
    pub errors: Vec<String>,
    /// Store statistics.
    pub stats: MemoryStats,
    /// Usage as a share of the cap, when one is configured.
    pub capacity_ratio: Option<f64>,
}

impl MemoryStore {
    /// Counts records and sizes across all agents.
    ///
    /// Agents whose collections cannot be read still count towards size.
    ///
    /// # Errors
    /// Returns error if the agents cannot be listed
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        let mut stats = MemoryStats { total_size_bytes: self.size_bytes(), ..MemoryStats::default() };

        for agent in self.list_agents()? {
            stats.agent_count += 1;
            match self.summarize(&agent) {
                Ok(summary) => {
                    stats.patterns += summary.patterns;
                    stats.solutions += summary.solutions;
                    stats.decisions += summary.decisions;
                }
                Err(e) => warn!(agent = %agent, error = %e, "Agent memory unreadable"),
            }

            let size = dir_size(&self.root().join(&agent));
            if stats.largest_agent.is_none() || size > stats.largest_agent_size_bytes {
                stats.largest_agent = Some(agent);
                stats.largest_agent_size_bytes = size;
            }
        }
        Ok(stats)
    }

    /// Checks layout, capacity, file integrity, backups and schema version.
    ///
    /// # Errors
    /// Returns error if the store root cannot be listed
    pub fn health_check(&self) -> Result<HealthReport> {
        let mut report = HealthReport {
            timestamp: Utc::now(),
            status: HealthStatus::Healthy,
            checks: BTreeMap::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            stats: self.memory_stats()?,
            capacity_ratio: None,
        };

        self.check_layout(&mut report);
        self.check_usage(&mut report);
        self.check_files(&mut report)?;
        self.check_backups(&mut report)?;
        self.check_schema(&mut report);

        report.status = if !report.errors.is_empty() {
            HealthStatus::Critical
        } else if !report.warnings.is_empty() {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        Ok(report)
    }

    fn check_layout(&self, report: &mut HealthReport) {
        let mut missing: Vec<&str> =
            RESERVED_NAMES.into_iter().filter(|dir| !self.root().join(dir).is_dir()).collect();
        if !self.root().join(CONFIG_FILE).is_file() {
            missing.push(CONFIG_FILE);
        }

        if !missing.is_empty() {
            report.errors.push(format!("missing from store root: {}", missing.join(", ")));
        }
        report.checks.insert("directoryStructure".to_string(), missing.is_empty());
    }

    fn check_usage(&self, report: &mut HealthReport) {
        let Some(limit) = self.config().max_size_bytes() else {
            report.checks.insert("capacity".to_string(), true);
            return;
        };

        let ratio = report.stats.total_size_bytes as f64 / limit as f64;
        report.capacity_ratio = Some(ratio);
        if ratio > 1.0 {
            report.errors.push(format!("store is over its size cap ({:.0}%)", ratio * 100.0));
        } else if ratio > CAPACITY_WARNING_RATIO {
            report.warnings.push(format!("store is near its size cap ({:.0}%)", ratio * 100.0));
        }
        report.checks.insert("capacity".to_string(), ratio <= 1.0);
    }

    fn check_files(&self, report: &mut HealthReport) -> Result<()> {
        let mut damaged = Vec::new();

        for agent in self.list_agents()? {
            for collection in Collection::ALL {
                let path = self.collection_path(&agent, collection);
                if !path.exists() {
                    continue;
                }
                if let Err(e) = self.read_file::<Value>(&path, &agent) {
                    damaged.push(format!("{}/{}: {}", agent, collection.file_name(), e));
                }
            }
        }

        for namespace in self.list_global_namespaces()? {
            let path = self.global_path(&namespace);
            if let Err(e) = self.read_file::<Value>(&path, &global_context(&namespace)) {
                damaged.push(format!("global/{}.json: {}", namespace, e));
            }
        }

        report.checks.insert("fileIntegrity".to_string(), damaged.is_empty());
        report.errors.extend(damaged);
        Ok(())
    }

    fn check_backups(&self, report: &mut HealthReport) -> Result<()> {
        let cutoff = Utc::now() - Duration::hours(RECENT_BACKUP_HOURS);
        let mut stale = Vec::new();

        for agent in self.list_agents()? {
            let newest = self.list_backups(&agent)?.into_iter().next();
            if !newest.is_some_and(|backup| backup.manifest.timestamp >= cutoff) {
                stale.push(agent);
            }
        }

        if !stale.is_empty() {
            report.warnings.push(format!(
                "no backup in the last {} hours for: {}",
                RECENT_BACKUP_HOURS,
                stale.join(", ")
            ));
        }
        report.checks.insert("recentBackup".to_string(), stale.is_empty());
        Ok(())
    }

    fn check_schema(&self, report: &mut HealthReport) {
        let current = match self.schema_version() {
            Ok(version) if version == SCHEMA_VERSION => true,
            Ok(version) => {
                report.warnings.push(format!(
                    "records use schema version {}, current is {}; run a migration",
                    version, SCHEMA_VERSION
                ));
                false
            }
            Err(e) => {
                report.errors.push(format!("schema version unreadable: {}", e));
                false
            }
        };
        report.checks.insert("schemaCurrent".to_string(), current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::memory::{Decision, Pattern};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir) -> MemoryStore {
        MemoryStore::open(StorageConfig::at(temp_dir.path().join("memory")), None).unwrap()
    }

    #[test]
    fn test_memory_stats() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        store.add("a", Pattern::new("p1", "a", json!({"body": "x".repeat(2048)}))).unwrap();
        store.add("b", Pattern::new("p1", "b", json!({}))).unwrap();
        store.add("b", Decision::new("d1", "b", json!({}))).unwrap();

        let stats = store.memory_stats().unwrap();
        assert_eq!(stats.agent_count, 2);
        assert_eq!(stats.patterns, 2);
        assert_eq!(stats.decisions, 1);
        assert_eq!(stats.solutions, 0);
        assert_eq!(stats.largest_agent.as_deref(), Some("a"));
        assert!(stats.total_size_bytes >= stats.largest_agent_size_bytes);
    }

    #[test]
    fn test_empty_store_is_healthy() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let report = store.health_check().unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.checks.values().all(|passed| *passed));
        assert_eq!(report.capacity_ratio, None);
    }

    #[test]
    fn test_missing_backup_is_a_warning() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        store.add("a", Pattern::new("p1", "a", json!({}))).unwrap();

        let report = store.health_check().unwrap();
        assert_eq!(report.status, HealthStatus::Warning);
        assert!(!report.checks["recentBackup"]);

        store.backup_agent_memory("a").unwrap();
        assert_eq!(store.health_check().unwrap().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_damaged_file_is_critical() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        store.add("a", Pattern::new("p1", "a", json!({}))).unwrap();
        store.backup_agent_memory("a").unwrap();
        fs::write(store.root().join("a").join("patterns.json"), b"{not json").unwrap();

        let report = store.health_check().unwrap();
        assert_eq!(report.status, HealthStatus::Critical);
        assert!(!report.checks["fileIntegrity"]);
        assert!(report.errors.iter().any(|e| e.contains("a/patterns.json")));
    }

    #[test]
    fn test_near_capacity_is_a_warning() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("memory");
        let store = MemoryStore::open(StorageConfig::at(&root), None).unwrap();
        let used = store.size_bytes();

        // Reopen with a cap just above current usage.
        let cap_gb = (used as f64 * 1.05) / (1024.0 * 1024.0 * 1024.0);
        let store = MemoryStore::open(StorageConfig::at(&root).with_max_size_gb(cap_gb), None).unwrap();

        let report = store.health_check().unwrap();
        assert_eq!(report.status, HealthStatus::Warning);
        assert!(report.checks["capacity"]);
        assert!(report.capacity_ratio.unwrap() > CAPACITY_WARNING_RATIO);
    }

    #[test]
    fn test_outdated_schema_is_a_warning() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        fs::write(store.root().join("schema.json"), br#"{"version": 1, "updatedAt": "2025-01-01T00:00:00Z"}"#)
            .unwrap();

        let report = store.health_check().unwrap();
        assert!(!report.checks["schemaCurrent"]);
        assert_eq!(report.status, HealthStatus::Warning);
    }
}
