//! Core types for the Formlab pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: ingested repetitions, flattened feature rows, benchmark profiles,
//! and the run report that summarises what was produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Named metric values captured for one phase (or the range of motion) of a rep
pub type MetricMap = BTreeMap<String, f64>;

/// A timestamp as it appeared in the session file, before normalization
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Milliseconds since the Unix epoch
    EpochMillis(f64),
    /// A date/time string, usually ISO-8601
    Text(String),
    /// Any other JSON value; never parseable
    Unsupported(String),
}

/// One repetition by one subject in one session
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RepRecord {
    /// File name of the session the rep was read from
    #[serde(skip)]
    pub source_file: String,
    /// Ordinal of the rep within its session
    #[serde(default, deserialize_with = "lenient::integer")]
    pub rep_number: Option<i64>,
    /// Rep duration (seconds)
    #[serde(default, deserialize_with = "lenient::number")]
    pub duration_sec: Option<f64>,
    /// Ground-truth validity label, when the collector recorded one
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub valid_rep: Option<bool>,
    /// Metrics at the bottom of the movement
    #[serde(default, deserialize_with = "lenient::metrics")]
    pub down: MetricMap,
    /// Metrics at the top of the movement
    #[serde(default, deserialize_with = "lenient::metrics")]
    pub up: MetricMap,
    /// Range-of-motion metrics
    #[serde(default, deserialize_with = "lenient::metrics")]
    pub range_of_motion: MetricMap,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub timestamp_start: Option<RawTimestamp>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub timestamp_end: Option<RawTimestamp>,
}

/// Field decoders that degrade malformed values to "absent" instead of failing the rep
mod lenient {
    use super::{MetricMap, RawTimestamp};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn integer<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(match value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            }),
            _ => None,
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value.as_f64())
    }

    pub fn boolean<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value.as_bool())
    }

    pub fn metrics<'de, D: Deserializer<'de>>(d: D) -> Result<MetricMap, D::Error> {
        let value = Value::deserialize(d)?;
        let mut metrics = MetricMap::new();
        if let Value::Object(map) = value {
            for (key, v) in map {
                match v.as_f64() {
                    Some(number) => {
                        metrics.insert(key, number);
                    }
                    None => tracing::debug!("Ignoring non-numeric metric {}: {}", key, v),
                }
            }
        }
        Ok(metrics)
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<RawTimestamp>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(match value {
            Value::Null => None,
            Value::Number(n) => n.as_f64().map(RawTimestamp::EpochMillis),
            Value::String(s) => Some(RawTimestamp::Text(s)),
            other => Some(RawTimestamp::Unsupported(other.to_string())),
        })
    }
}

/// One flattened, engineered row per repetition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRow {
    pub source_file: String,
    pub rep_number: Option<i64>,
    pub duration_sec: Option<f64>,
    /// Never defaulted: absent stays absent
    pub valid_rep: Option<bool>,
    /// Numeric columns: phase metrics, range of motion, derived features
    pub values: HashMap<String, f64>,
    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl FeatureRow {
    /// Value of a numeric column, if this row has it
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied()
    }

    pub fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Values of `features` in order, or `None` if any is missing
    pub fn complete_vector(&self, features: &[String]) -> Option<Vec<f64>> {
        features.iter().map(|f| self.get(f)).collect()
    }

    /// Values of `features` in order, with missing values replaced by `fill`
    pub fn filled_vector(&self, features: &[String], fill: f64) -> Vec<f64> {
        features
            .iter()
            .map(|f| self.get(f).unwrap_or(fill))
            .collect()
    }

    /// Rows with a true or absent validity flag feed the benchmark clusterer
    pub fn is_benchmark_candidate(&self) -> bool {
        self.valid_rep.unwrap_or(true)
    }
}

/// The batch of feature rows plus the ordered set of numeric columns they use
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    /// Numeric column names in first-seen order
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a numeric column, keeping first-seen order
    pub fn register_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows that have every one of `features`, as (row index, values) pairs
    pub fn complete_rows(&self, features: &[String]) -> Vec<(usize, Vec<f64>)> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.complete_vector(features).map(|v| (i, v)))
            .collect()
    }

    /// A table holding only the rows accepted by `keep`, with the same columns
    pub fn filter<F>(&self, keep: F) -> FeatureTable
    where
        F: Fn(&FeatureRow) -> bool,
    {
        FeatureTable {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }
}

/// Representative center of one group of valid repetitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkProfile {
    /// Stable within one training run
    pub cluster_id: usize,
    /// Number of repetitions assigned to this group
    pub size: usize,
    /// Center in original (unstandardized) feature units, ordered like the feature names
    pub center: Vec<f64>,
}

/// Per-class fit-quality metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: bool,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// In-sample training report of the validity classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub accuracy: f64,
    pub classes: Vec<ClassMetrics>,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub samples: usize,
}

/// Non-fatal ingestion problem for one file or one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestWarning {
    pub file: String,
    pub reason: String,
}

/// Result of a sub-pipeline that is allowed to be unavailable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed { summary: String },
    Unavailable { reason: String },
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed { .. })
    }
}

/// Outcome of persisting one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Written,
    Skipped { reason: String },
    Failed { error: String },
}

/// One entry per artifact the run could have produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: ArtifactStatus,
}

/// Structured summary returned by one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub producer: String,
    pub version: String,
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub reps_ingested: usize,
    pub warnings: Vec<IngestWarning>,
    pub feature_columns: Vec<String>,
    pub clustering: StageOutcome,
    pub classifier: StageOutcome,
    pub training_report: Option<TrainingReport>,
    pub artifacts: Vec<ArtifactRecord>,
}

impl RunReport {
    pub fn artifacts_written(&self) -> usize {
        self.artifacts
            .iter()
            .filter(|a| a.status == ArtifactStatus::Written)
            .count()
    }

    pub fn has_failed_artifacts(&self) -> bool {
        self.artifacts
            .iter()
            .any(|a| matches!(a.status, ArtifactStatus::Failed { .. }))
    }
}
