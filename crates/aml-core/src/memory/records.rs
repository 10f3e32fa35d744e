//! Agent record types.
//!
//! Patterns, solutions and decisions share an identity (`id`, `agent`,
//! `timestamp`) and carry their own effectiveness data, which the store
//! mutates in place when a record is reused.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Confidence assigned to a record that has never been reused.
pub const INITIAL_CONFIDENCE: f64 = 0.5;

/// Executions after which confidence tracks the success rate fully.
const CONFIDENCE_RAMP: u64 = 10;

/// Executions at which usage stops adding to a pattern's value.
const VALUE_USAGE_CAP: f64 = 50.0;

/// Mean time saved, in ms, at which it stops adding to a pattern's value.
const VALUE_TIME_SAVED_CAP: f64 = 1000.0;

/// Mean decision score below which an outcome counts as negative.
const NEGATIVE_OUTCOME_SCORE: f64 = 0.5;

/// Files inside an agent directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// `patterns.json`
    Patterns,
    /// `solutions.json`
    Solutions,
    /// `decisions.json`
    Decisions,
    /// `metrics.json`
    Metrics,
}

impl Collection {
    /// All collections, in on-disk order.
    pub const ALL: [Self; 4] = [Self::Patterns, Self::Solutions, Self::Decisions, Self::Metrics];

    /// Collection name used in logs and audit entries.
    pub fn name(self) -> &'static str {
        match self {
            Self::Patterns => "patterns",
            Self::Solutions => "solutions",
            Self::Decisions => "decisions",
            Self::Metrics => "metrics",
        }
    }

    /// File name within the agent directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Patterns => "patterns.json",
            Self::Solutions => "solutions.json",
            Self::Decisions => "decisions.json",
            Self::Metrics => "metrics.json",
        }
    }

    /// Content of a freshly created file.
    pub(crate) fn empty(self) -> Value {
        match self {
            Self::Metrics => Value::Object(serde_json::Map::new()),
            _ => Value::Array(Vec::new()),
        }
    }
}

/// A record kind stored as a JSON array in one collection file.
pub trait MemoryRecord: Serialize + DeserializeOwned + Clone {
    /// Collection holding records of this kind.
    const COLLECTION: Collection;

    /// Identifier, unique within the agent and kind.
    fn id(&self) -> &str;

    /// Owning agent.
    fn agent(&self) -> &str;

    /// Creation time.
    fn created_at(&self) -> DateTime<Utc>;

    /// Overwrites the creation time.
    fn set_created_at(&mut self, at: DateTime<Utc>);
}

/// Reuse metrics of a pattern.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatternMetrics {
    /// Fraction of successful executions.
    pub success_rate: f64,
    /// Number of recorded executions.
    pub execution_count: u64,
    /// Mean time saved per execution.
    pub avg_time_saved_ms: f64,
}

/// How a pattern has evolved through reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatternEvolution {
    /// Last time an outcome was recorded.
    pub last_used: Option<DateTime<Utc>>,
    /// Confidence in the pattern, in `[0, 1]`.
    pub confidence_score: f64,
    /// Number of times the body was refined.
    pub refinements: u32,
}

impl Default for PatternEvolution {
    fn default() -> Self {
        Self { last_used: None, confidence_score: INITIAL_CONFIDENCE, refinements: 0 }
    }
}

/// A reusable pattern learned by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    /// Pattern identifier.
    pub id: String,
    /// Owning agent.
    pub agent: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Free-form pattern body.
    pub pattern: Value,
    /// Reuse metrics.
    #[serde(default)]
    pub metrics: PatternMetrics,
    /// Evolution data.
    #[serde(default)]
    pub evolution: PatternEvolution,
    /// Inactive patterns are kept but not offered for reuse.
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Pattern {
    /// Creates a pattern with fresh metrics.
    pub fn new(id: impl Into<String>, agent: impl Into<String>, pattern: Value) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            timestamp: Utc::now(),
            pattern,
            metrics: PatternMetrics::default(),
            evolution: PatternEvolution::default(),
            active: true,
        }
    }

    /// Folds one execution into the running metrics.
    pub fn record_outcome(&mut self, success: bool, time_saved_ms: f64) {
        let previous = self.metrics.execution_count as f64;
        let count = self.metrics.execution_count + 1;
        let hit = if success { 1.0 } else { 0.0 };

        self.metrics.success_rate = self.metrics.success_rate.mul_add(previous, hit) / count as f64;
        self.metrics.avg_time_saved_ms =
            self.metrics.avg_time_saved_ms.mul_add(previous, time_saved_ms) / count as f64;
        self.metrics.execution_count = count;

        // Starts at the initial confidence and moves towards the success rate
        // as executions accumulate.
        let weight = count.min(CONFIDENCE_RAMP) as f64 / CONFIDENCE_RAMP as f64;
        self.evolution.confidence_score =
            (self.metrics.success_rate - INITIAL_CONFIDENCE).mul_add(weight, INITIAL_CONFIDENCE);
        self.evolution.last_used = Some(Utc::now());
    }

    /// Replaces the body and counts the refinement.
    pub fn refine(&mut self, pattern: Value) {
        self.pattern = pattern;
        self.evolution.refinements += 1;
        self.evolution.last_used = Some(Utc::now());
    }

    /// Last time the pattern was used, or its creation time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.evolution.last_used.unwrap_or(self.timestamp)
    }

    /// Weighted worth of the pattern in `[0, 1]`.
    ///
    /// Success rate weighs 0.4, confidence 0.3, usage 0.2 and time saved 0.1.
    pub fn value_score(&self) -> f64 {
        let usage = (self.metrics.execution_count as f64 / VALUE_USAGE_CAP).min(1.0);
        let time_saved = (self.metrics.avg_time_saved_ms / VALUE_TIME_SAVED_CAP).clamp(0.0, 1.0);
        self.metrics.success_rate * 0.4
            + self.evolution.confidence_score * 0.3
            + usage * 0.2
            + time_saved * 0.1
    }
}

impl MemoryRecord for Pattern {
    const COLLECTION: Collection = Collection::Patterns;

    fn id(&self) -> &str {
        &self.id
    }

    fn agent(&self) -> &str {
        &self.agent
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.timestamp = at;
    }
}

/// Effectiveness of a solution across reuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolutionEffectiveness {
    /// Whether the solution worked the last time it was applied.
    pub worked: bool,
    /// Number of recorded applications.
    pub reuse_count: u64,
    /// Last time an outcome was recorded.
    pub last_used: Option<DateTime<Utc>>,
}

impl Default for SolutionEffectiveness {
    fn default() -> Self {
        Self { worked: true, reuse_count: 0, last_used: None }
    }
}

/// A problem together with the solution that resolved it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    /// Solution identifier.
    pub id: String,
    /// Owning agent.
    pub agent: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Problem description.
    pub problem: Value,
    /// Applied solution.
    pub solution: Value,
    /// Effectiveness data.
    #[serde(default)]
    pub effectiveness: SolutionEffectiveness,
}

impl Solution {
    /// Creates a solution that has not been reused yet.
    pub fn new(
        id: impl Into<String>,
        agent: impl Into<String>,
        problem: Value,
        solution: Value,
    ) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            timestamp: Utc::now(),
            problem,
            solution,
            effectiveness: SolutionEffectiveness::default(),
        }
    }

    /// Records one application of the solution.
    pub fn record_outcome(&mut self, worked: bool) {
        self.effectiveness.worked = worked;
        self.effectiveness.reuse_count += 1;
        self.effectiveness.last_used = Some(Utc::now());
    }

    /// Last time the solution was applied, or its creation time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.effectiveness.last_used.unwrap_or(self.timestamp)
    }
}

impl MemoryRecord for Solution {
    const COLLECTION: Collection = Collection::Solutions;

    fn id(&self) -> &str {
        &self.id
    }

    fn agent(&self) -> &str {
        &self.agent
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.timestamp = at;
    }
}

/// Observed outcome of a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    /// Whether the agent would take the same decision again.
    pub would_repeat: bool,
    /// Named scores in `[0, 1]`.
    #[serde(default)]
    pub success_metrics: BTreeMap<String, f64>,
    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl DecisionOutcome {
    /// Mean of the success metrics, if any were recorded.
    pub fn average_metric(&self) -> Option<f64> {
        if self.success_metrics.is_empty() {
            return None;
        }
        let total: f64 = self.success_metrics.values().sum();
        Some(total / self.success_metrics.len() as f64)
    }
}

/// A past decision with its rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Decision identifier.
    pub id: String,
    /// Owning agent.
    pub agent: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Context, options and choice.
    pub decision: Value,
    /// Outcome, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DecisionOutcome>,
}

impl Decision {
    /// Creates a decision without an outcome.
    pub fn new(id: impl Into<String>, agent: impl Into<String>, decision: Value) -> Self {
        Self { id: id.into(), agent: agent.into(), timestamp: Utc::now(), decision, outcome: None }
    }

    /// Sets the outcome, replacing any earlier one.
    pub fn record_outcome(&mut self, would_repeat: bool, success_metrics: BTreeMap<String, f64>) {
        self.outcome = Some(DecisionOutcome { would_repeat, success_metrics, recorded_at: Utc::now() });
    }

    /// Whether the recorded outcome says the decision went badly.
    ///
    /// A decision without an outcome is not negative.
    pub fn has_negative_outcome(&self) -> bool {
        self.outcome.as_ref().is_some_and(|outcome| {
            !outcome.would_repeat
                || outcome.average_metric().is_some_and(|score| score < NEGATIVE_OUTCOME_SCORE)
        })
    }
}

impl MemoryRecord for Decision {
    const COLLECTION: Collection = Collection::Decisions;

    fn id(&self) -> &str {
        &self.id
    }

    fn agent(&self) -> &str {
        &self.agent
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.timestamp = at;
    }
}

/// Free-form counters in `metrics.json`.
pub type AgentMetrics = serde_json::Map<String, Value>;

/// Record counts for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummary {
    /// Agent name.
    pub agent: String,
    /// Number of patterns.
    pub patterns: usize,
    /// Patterns still offered for reuse.
    pub active_patterns: usize,
    /// Number of solutions.
    pub solutions: usize,
    /// Number of decisions.
    pub decisions: usize,
    /// Bytes used by the agent directory.
    pub size_bytes: u64,
}

fn default_true() -> bool {
    true
}
