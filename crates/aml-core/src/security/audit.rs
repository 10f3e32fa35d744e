//! Audit logging for memory operations.
//!
//! Records every mutating memory operation with a timestamp, the owning
//! agent and the target identifier, enabling security monitoring. Record
//! payloads and key material are never written to the log.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::SecurityResult;

/// Maximum audit log file size before rotation (10MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep.
const MAX_ROTATED_LOGS: usize = 5;

/// Types of audited memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    /// Store root initialized.
    Initialize,
    /// Agent directory created.
    CreateAgent,
    /// Record added.
    Add,
    /// Record replaced.
    Update,
    /// Record removed.
    Delete,
    /// Reuse outcome recorded against a record.
    RecordOutcome,
    /// Agent metrics rewritten.
    UpdateMetrics,
    /// Global namespace written.
    SetGlobal,
    /// Backup created.
    Backup,
    /// Backup restored.
    Restore,
    /// Backup deleted.
    DeleteBackup,
    /// Records pruned from an agent.
    Prune,
    /// Record schema migrated.
    Migrate,
}

/// Audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Timestamp of the operation.
    pub timestamp: String,
    /// Type of operation.
    pub operation: AuditOperation,
    /// Owning agent, when the operation is agent-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Record collection (patterns, solutions, ...), when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Record id, namespace or backup id (never a value).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Failure class if the operation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl AuditEntry {
    /// Creates a successful entry for `operation`.
    pub fn new(operation: AuditOperation) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            operation,
            agent: None,
            collection: None,
            target: None,
            success: true,
            error_kind: None,
        }
    }

    /// Sets the owning agent.
    #[must_use]
    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    /// Sets the record collection.
    #[must_use]
    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }

    /// Sets the target identifier.
    #[must_use]
    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Marks the entry failed with the given failure class.
    #[must_use]
    pub fn failed(mut self, error_kind: &str) -> Self {
        self.success = false;
        self.error_kind = Some(error_kind.to_string());
        self
    }
}

/// Filter for querying audit log entries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by operation type (if Some).
    pub operation: Option<AuditOperation>,
    /// Filter by agent (if Some).
    pub agent: Option<String>,
    /// Only failed operations.
    pub failures_only: bool,
    /// Start time for time range filter (if Some).
    pub start_time: Option<chrono::DateTime<Utc>>,
    /// End time for time range filter (if Some).
    pub end_time: Option<chrono::DateTime<Utc>>,
}

/// Append-only JSON-lines audit logger.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    /// Path to the audit log file.
    log_path: PathBuf,
}

impl AuditLogger {
    /// Creates a new audit logger.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be created or accessed.
    pub fn new(log_path: PathBuf) -> SecurityResult<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        OpenOptions::new().create(true).append(true).open(&log_path)?;

        // Set file permissions to 0600 (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&log_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self { log_path })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &std::path::Path {
        &self.log_path
    }

    /// Appends an entry to the log.
    pub fn log(&self, entry: &AuditEntry) -> SecurityResult<()> {
        self.rotate_if_needed()?;

        let json = serde_json::to_string(entry)?;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    /// Queries audit log entries matching the filter.
    ///
    /// Only the current log file is read; rotated files are left alone.
    pub fn query_log(&self, filter: &AuditFilter) -> SecurityResult<Vec<AuditEntry>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.log_path)?);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: AuditEntry = serde_json::from_str(&line)?;

            if filter.operation.is_some_and(|op| entry.operation != op) {
                continue;
            }

            if let Some(ref agent) = filter.agent {
                if entry.agent.as_deref() != Some(agent.as_str()) {
                    continue;
                }
            }

            if filter.failures_only && entry.success {
                continue;
            }

            if filter.start_time.is_some() || filter.end_time.is_some() {
                if let Ok(entry_time) = chrono::DateTime::parse_from_rfc3339(&entry.timestamp) {
                    if filter.start_time.is_some_and(|start| entry_time < start) {
                        continue;
                    }
                    if filter.end_time.is_some_and(|end| entry_time > end) {
                        continue;
                    }
                }
            }

            entries.push(entry);
        }

        Ok(entries)
    }

    /// Rotates the log file if it exceeds the maximum size.
    fn rotate_if_needed(&self) -> SecurityResult<()> {
        if !self.log_path.exists() {
            return Ok(());
        }

        if std::fs::metadata(&self.log_path)?.len() < MAX_LOG_SIZE {
            return Ok(());
        }

        for i in (1..MAX_ROTATED_LOGS).rev() {
            let old_path = self.log_path.with_extension(format!("log.{}", i));
            let new_path = self.log_path.with_extension(format!("log.{}", i + 1));

            if old_path.exists() {
                if new_path.exists() {
                    std::fs::remove_file(&new_path)?;
                }
                std::fs::rename(&old_path, &new_path)?;
            }
        }

        std::fs::rename(&self.log_path, self.log_path.with_extension("log.1"))?;

        Ok(())
    }
}
