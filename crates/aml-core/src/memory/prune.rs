//! Pruning of stale, failing or oversized agent memory.
//!
//! Three strategies pick records to drop:
//!
//! - time based: records unused past their configured age
//! - performance based: patterns that keep failing, solutions that stopped
//!   working and decisions with a negative outcome
//! - space based: the lowest-value patterns of an agent that outgrew its
//!   share of the store
//!
//! Pruned records are written to a gzip'd archive under
//! `backup/<agent>/archive/` before the collections are rewritten. The
//! archive is encoded like any other memory file, so it stays encrypted in
//! encrypted stores.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{MemoryError, Result};
use super::records::{Decision, MemoryRecord, Pattern, Solution};
use super::store::{MemoryStore, dir_size, validate_agent_name, write_atomic};
use crate::config::PruneConfig;
use crate::security::{AuditEntry, AuditOperation};

const ARCHIVE_DIR: &str = "archive";
const ARCHIVE_EXTENSION: &str = ".json.gz";

/// Success rate under which an old, well-exercised pattern counts as failed.
const FAILING_SUCCESS_RATE: f64 = 0.3;

/// Share of the agent limit space-based pruning brings an agent down to.
const AGENT_TARGET_RATIO: f64 = 0.7;

/// Store usage, as a share of the cap, that triggers space-based pruning.
const STORE_PRESSURE_RATIO: f64 = 0.8;

/// Share of an agent's size freed when the whole store is under pressure.
const STORE_PRESSURE_FREE_RATIO: f64 = 0.2;

/// How records are selected for pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneStrategy {
    /// Records unused for longer than their configured age.
    TimeBased,
    /// Records whose outcomes show they do not help.
    PerformanceBased,
    /// Lowest-value patterns of an agent over its size limit.
    SpaceBased,
}

impl PruneStrategy {
    /// All strategies, in the order `prune_all` applies them.
    pub const ALL: [Self; 3] = [Self::TimeBased, Self::PerformanceBased, Self::SpaceBased];

    /// Name used in archive file names and audit entries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TimeBased => "time_based",
            Self::PerformanceBased => "performance_based",
            Self::SpaceBased => "space_based",
        }
    }
}

impl fmt::Display for PruneStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PruneStrategy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").as_str() {
            "time_based" | "time" => Ok(Self::TimeBased),
            "performance_based" | "performance" => Ok(Self::PerformanceBased),
            "space_based" | "space" => Ok(Self::SpaceBased),
            _ => Err(MemoryError::Configuration(format!("unknown prune strategy: {}", s))),
        }
    }
}

/// Why a record was pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    /// Not used within its maximum age.
    UnusedTooLong,
    /// Success rate too low after enough executions.
    LowSuccessRate,
    /// Confidence too low after enough executions.
    LowConfidence,
    /// Last application of the solution failed.
    NotWorking,
    /// The decision's outcome was negative.
    NegativeOutcome,
    /// The decision is older than its maximum age.
    Expired,
    /// Dropped to bring the agent under its size limit.
    MemoryLimitExceeded,
}

/// One record selected for pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedRecord {
    /// Collection name (`patterns`, `solutions` or `decisions`).
    pub collection: String,
    /// Record id.
    pub id: String,
    /// Why it was selected.
    pub reason: PruneReason,
}

/// Outcome of pruning one agent with one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Agent that was pruned.
    pub agent: String,
    /// Strategy applied.
    pub strategy: PruneStrategy,
    /// When set, nothing was removed.
    pub dry_run: bool,
    /// Selected records.
    pub pruned: Vec<PrunedRecord>,
    /// Agent directory size before pruning.
    pub bytes_before: u64,
    /// Agent directory size after pruning; equal to `bytes_before` on a dry run.
    pub bytes_after: u64,
    /// Archive holding the removed records, if one was written.
    pub archive: Option<String>,
}

impl PruneReport {
    /// Number of selected records.
    pub fn count(&self) -> usize {
        self.pruned.len()
    }

    /// Selected records per reason.
    pub fn count_by_reason(&self) -> BTreeMap<PruneReason, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.pruned {
            *counts.entry(record.reason).or_insert(0) += 1;
        }
        counts
    }

    /// Bytes freed in the agent directory.
    pub fn bytes_freed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Records removed by one prune run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneArchive {
    /// Agent the records came from.
    pub agent: String,
    /// Strategy that removed them.
    pub strategy: PruneStrategy,
    /// When they were removed.
    pub timestamp: DateTime<Utc>,
    /// Why each record was removed.
    pub reasons: Vec<PrunedRecord>,
    /// Removed patterns.
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    /// Removed solutions.
    #[serde(default)]
    pub solutions: Vec<Solution>,
    /// Removed decisions.
    #[serde(default)]
    pub decisions: Vec<Decision>,
}

/// An agent's records, loaded once per prune run.
struct AgentRecords {
    patterns: Vec<Pattern>,
    solutions: Vec<Solution>,
    decisions: Vec<Decision>,
}

impl MemoryStore {
    /// Prunes one agent with one strategy.
    ///
    /// With `dry_run` set the report lists what would be removed and the
    /// agent is left untouched.
    ///
    /// # Errors
    /// Returns `NotFound` if the agent has no directory, `Configuration` for
    /// invalid thresholds, and error if a collection cannot be read or
    /// written
    pub fn prune_agent(
        &self,
        agent: &str,
        strategy: PruneStrategy,
        config: &PruneConfig,
        dry_run: bool,
    ) -> Result<PruneReport> {
        let entry = AuditEntry::new(AuditOperation::Prune)
            .with_agent(agent)
            .with_target(strategy.as_str());
        let result = self.prune_inner(agent, strategy, config, dry_run);
        if dry_run && result.is_ok() {
            return result;
        }
        self.audited(entry, result)
    }

    /// Applies each strategy in turn to every agent.
    ///
    /// An agent that fails to prune is logged and skipped.
    ///
    /// # Errors
    /// Returns error if the agents cannot be listed
    pub fn prune_all(
        &self,
        strategies: &[PruneStrategy],
        config: &PruneConfig,
        dry_run: bool,
    ) -> Result<Vec<PruneReport>> {
        let mut reports = Vec::new();
        for agent in self.list_agents()? {
            for &strategy in strategies {
                match self.prune_agent(&agent, strategy, config, dry_run) {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!(agent = %agent, strategy = %strategy, error = %e, "Pruning failed"),
                }
            }
        }
        Ok(reports)
    }

    /// Lists an agent's prune archives, oldest first.
    ///
    /// # Errors
    /// Returns error if the archive directory cannot be read
    pub fn list_prune_archives(&self, agent: &str) -> Result<Vec<String>> {
        validate_agent_name(agent)?;
        let dir = self.archive_dir(agent);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<(DateTime<Utc>, String)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(ARCHIVE_EXTENSION) {
                continue;
            }
            let modified = entry.metadata()?.modified().map(DateTime::<Utc>::from)?;
            names.push((modified, name));
        }
        names.sort();
        Ok(names.into_iter().map(|(_, name)| name).collect())
    }

    /// Reads the records stored in a prune archive.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown archive, and error if it cannot be
    /// decompressed or decoded
    pub fn read_prune_archive(&self, agent: &str, name: &str) -> Result<PruneArchive> {
        validate_agent_name(agent)?;
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(MemoryError::NotFound(format!("prune archive {}", name)));
        }
        let path = self.archive_dir(agent).join(name);
        if !path.is_file() {
            return Err(MemoryError::NotFound(format!("prune archive {} for agent {}", name, agent)));
        }

        let mut bytes = Vec::new();
        GzDecoder::new(fs::File::open(&path)?).read_to_end(&mut bytes)?;
        self.codec().decode(&bytes, agent)
    }

    fn prune_inner(
        &self,
        agent: &str,
        strategy: PruneStrategy,
        config: &PruneConfig,
        dry_run: bool,
    ) -> Result<PruneReport> {
        config.validate().map_err(|e| MemoryError::Configuration(e.to_string()))?;
        validate_agent_name(agent)?;
        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().map_err(|_| MemoryError::LockPoisoned)?;

        let agent_dir = self.root().join(agent);
        if !agent_dir.is_dir() {
            return Err(MemoryError::NotFound(format!("agent {}", agent)));
        }

        let records = AgentRecords {
            patterns: self.read_collection(agent)?,
            solutions: self.read_collection(agent)?,
            decisions: self.read_collection(agent)?,
        };
        let bytes_before = dir_size(&agent_dir);
        let now = Utc::now();

        let pruned = match strategy {
            PruneStrategy::TimeBased => select_time_based(&records, config, now),
            PruneStrategy::PerformanceBased => select_performance_based(&records, config),
            PruneStrategy::SpaceBased => {
                let store_over = self.config().max_size_bytes().is_some_and(|limit| {
                    self.size_bytes() as f64 > limit as f64 * STORE_PRESSURE_RATIO
                });
                select_space_based(&records, config, bytes_before, store_over)
            }
        };

        let mut report = PruneReport {
            agent: agent.to_string(),
            strategy,
            dry_run,
            pruned,
            bytes_before,
            bytes_after: bytes_before,
            archive: None,
        };
        if dry_run || report.pruned.is_empty() {
            debug!(agent, strategy = %strategy, selected = report.count(), dry_run, "Prune finished");
            return Ok(report);
        }

        let split = split_records(agent, strategy, now, records, &report.pruned);
        if config.archive {
            report.archive = Some(self.write_prune_archive(agent, &split.removed)?);
        }
        self.write_remaining(agent, &split)?;
        report.bytes_after = dir_size(&agent_dir);

        info!(
            agent,
            strategy = %strategy,
            pruned = report.count(),
            bytes_freed = report.bytes_freed(),
            "Pruned agent memory"
        );
        Ok(report)
    }

    /// Rewrites only the collections that lost records.
    fn write_remaining(&self, agent: &str, split: &Split) -> Result<()> {
        if !split.removed.patterns.is_empty() {
            self.write_collection(agent, &split.kept.patterns)?;
        }
        if !split.removed.solutions.is_empty() {
            self.write_collection(agent, &split.kept.solutions)?;
        }
        if !split.removed.decisions.is_empty() {
            self.write_collection(agent, &split.kept.decisions)?;
        }
        Ok(())
    }

    fn write_collection<R: MemoryRecord>(&self, agent: &str, records: &[R]) -> Result<()> {
        self.write_file(&self.collection_path(agent, R::COLLECTION), agent, records)
    }

    /// Archives are written outside the size cap so pruning a full store
    /// cannot fail on its own archive.
    fn write_prune_archive(&self, agent: &str, archive: &PruneArchive) -> Result<String> {
        let encoded = self.codec().encode(archive, agent)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encoded)?;
        let compressed = encoder.finish()?;

        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}{}",
            archive.strategy,
            archive.timestamp.format("%Y%m%dT%H%M%S%3fZ"),
            &suffix[..8],
            ARCHIVE_EXTENSION
        );
        let dir = self.archive_dir(agent);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(&name), &compressed)?;
        Ok(name)
    }

    fn archive_dir(&self, agent: &str) -> PathBuf {
        self.root().join("backup").join(agent).join(ARCHIVE_DIR)
    }
}

/// Records kept and removed by one prune run.
struct Split {
    kept: AgentRecords,
    removed: PruneArchive,
}

fn split_records(
    agent: &str,
    strategy: PruneStrategy,
    now: DateTime<Utc>,
    records: AgentRecords,
    pruned: &[PrunedRecord],
) -> Split {
    let (patterns, removed_patterns) = partition(records.patterns, pruned);
    let (solutions, removed_solutions) = partition(records.solutions, pruned);
    let (decisions, removed_decisions) = partition(records.decisions, pruned);
    Split {
        kept: AgentRecords { patterns, solutions, decisions },
        removed: PruneArchive {
            agent: agent.to_string(),
            strategy,
            timestamp: now,
            reasons: pruned.to_vec(),
            patterns: removed_patterns,
            solutions: removed_solutions,
            decisions: removed_decisions,
        },
    }
}

fn partition<R: MemoryRecord>(records: Vec<R>, pruned: &[PrunedRecord]) -> (Vec<R>, Vec<R>) {
    let collection = R::COLLECTION.name();
    records.into_iter().partition(|record| {
        !pruned.iter().any(|p| p.collection == collection && p.id == record.id())
    })
}

fn selected<R: MemoryRecord>(record: &R, reason: PruneReason) -> PrunedRecord {
    PrunedRecord {
        collection: R::COLLECTION.name().to_string(),
        id: record.id().to_string(),
        reason,
    }
}

fn select_time_based(
    records: &AgentRecords,
    config: &PruneConfig,
    now: DateTime<Utc>,
) -> Vec<PrunedRecord> {
    let older_than = |at: DateTime<Utc>, days: i64| now - at > Duration::days(days);
    let mut pruned = Vec::new();

    for pattern in &records.patterns {
        if older_than(pattern.last_activity(), config.pattern_max_age_days) {
            pruned.push(selected(pattern, PruneReason::UnusedTooLong));
        } else if pattern.metrics.execution_count >= config.min_execution_count
            && pattern.metrics.success_rate < FAILING_SUCCESS_RATE
            && older_than(pattern.timestamp, config.failed_pattern_max_age_days)
        {
            pruned.push(selected(pattern, PruneReason::LowSuccessRate));
        }
    }

    for solution in &records.solutions {
        if older_than(solution.last_activity(), config.solution_max_age_days) {
            pruned.push(selected(solution, PruneReason::UnusedTooLong));
        }
    }

    for decision in &records.decisions {
        if older_than(decision.timestamp, config.decision_max_age_days) {
            pruned.push(selected(decision, PruneReason::Expired));
        }
    }

    pruned
}

fn select_performance_based(records: &AgentRecords, config: &PruneConfig) -> Vec<PrunedRecord> {
    let mut pruned = Vec::new();

    for pattern in &records.patterns {
        if pattern.metrics.execution_count < config.min_execution_count {
            continue;
        }
        if pattern.metrics.success_rate < config.min_success_rate {
            pruned.push(selected(pattern, PruneReason::LowSuccessRate));
        } else if pattern.evolution.confidence_score < config.min_confidence_score {
            pruned.push(selected(pattern, PruneReason::LowConfidence));
        }
    }

    for solution in &records.solutions {
        if !solution.effectiveness.worked {
            pruned.push(selected(solution, PruneReason::NotWorking));
        }
    }

    for decision in &records.decisions {
        if decision.has_negative_outcome() {
            pruned.push(selected(decision, PruneReason::NegativeOutcome));
        }
    }

    pruned
}

/// Drops the lowest-value patterns until enough bytes are freed.
///
/// Sizes are estimated from each pattern's plain JSON encoding.
fn select_space_based(
    records: &AgentRecords,
    config: &PruneConfig,
    agent_bytes: u64,
    store_over: bool,
) -> Vec<PrunedRecord> {
    let limit = config.agent_memory_limit_bytes();
    let target = if agent_bytes > limit {
        agent_bytes - (limit as f64 * AGENT_TARGET_RATIO) as u64
    } else if store_over {
        (agent_bytes as f64 * STORE_PRESSURE_FREE_RATIO) as u64
    } else {
        return Vec::new();
    };

    let mut candidates: Vec<(&Pattern, f64)> = records
        .patterns
        .iter()
        .map(|pattern| (pattern, pattern.value_score()))
        .filter(|(_, score)| !(config.preserve_high_value && *score >= config.high_value_threshold))
        .collect();
    candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));

    let mut freed = 0;
    let mut pruned = Vec::new();
    for (pattern, _) in candidates {
        if freed >= target {
            break;
        }
        freed += serde_json::to_vec(pattern).map(|bytes| bytes.len() as u64).unwrap_or(0);
        pruned.push(selected(pattern, PruneReason::MemoryLimitExceeded));
    }
    pruned
}
