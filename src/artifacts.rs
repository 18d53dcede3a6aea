//! Artifact persistence
//!
//! Fitted models and standardizers are wrapped in a JSON envelope carrying the
//! producer, a run id shared by every artifact of one run, and the feature
//! names the payload was fit on. Tables are written as CSV.
//!
//! Every write yields an [`ArtifactRecord`]; a failed write is recorded and
//! does not stop the remaining writes.

use crate::error::PipelineError;
use crate::types::{ArtifactRecord, ArtifactStatus, BenchmarkProfile, FeatureTable, RunReport};
use crate::{FORMLAB_VERSION, PRODUCER_NAME};
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Standardizer fit for benchmark clustering
pub const SCALER_CLUSTERING_FILE: &str = "scaler_clustering.json";
pub const KMEANS_MODEL_FILE: &str = "kmeans_model.json";
/// Standardizer fit for the validity classifier
pub const SCALER_CLASSIFIER_FILE: &str = "scaler_classifier.json";
pub const VALIDITY_CLASSIFIER_FILE: &str = "validity_classifier.json";
pub const RUN_REPORT_FILE: &str = "run_report.json";

/// Envelope kinds
pub const KIND_SCALER_CLUSTERING: &str = "scaler_clustering";
pub const KIND_KMEANS_MODEL: &str = "kmeans_model";
pub const KIND_SCALER_CLASSIFIER: &str = "scaler_classifier";
pub const KIND_VALIDITY_CLASSIFIER: &str = "validity_classifier";

/// Column holding the group id in the benchmark table
pub const CLUSTER_ID_COLUMN: &str = "cluster_id";
pub const CLUSTER_SIZE_COLUMN: &str = "cluster_size";

/// Leading non-feature columns of the flattened table
pub const FLATTENED_ID_COLUMNS: [&str; 4] = ["source_file", "rep_number", "duration_sec", "valid_rep"];
pub const FLATTENED_TIME_COLUMNS: [&str; 2] = ["timestamp_start", "timestamp_end"];

pub fn benchmarks_file(dataset_name: &str) -> String {
    format!("{}_cluster_benchmarks.csv", dataset_name)
}

pub fn flattened_file(dataset_name: &str) -> String {
    format!("{}_flattened_data.csv", dataset_name)
}

/// A persisted model or standardizer with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedArtifact<T> {
    pub kind: String,
    /// Shared by every artifact written in the same run
    pub run_id: String,
    pub producer: String,
    pub version: String,
    pub created_at_utc: String,
    /// Feature order the payload expects
    pub feature_names: Vec<String>,
    pub payload: T,
}

/// Read an envelope and check its kind
pub fn read_artifact<T: DeserializeOwned>(
    path: &Path,
    expected_kind: &str,
) -> Result<FittedArtifact<T>, PipelineError> {
    let contents = fs::read_to_string(path)?;
    let artifact: FittedArtifact<T> = serde_json::from_str(&contents)?;
    if artifact.kind != expected_kind {
        return Err(PipelineError::ArtifactError(format!(
            "{} holds a {} artifact, expected {}",
            path.display(),
            artifact.kind,
            expected_kind
        )));
    }
    Ok(artifact)
}

/// Read a benchmark table back into feature names and profiles
pub fn read_benchmarks(path: &Path) -> Result<(Vec<String>, Vec<BenchmarkProfile>), PipelineError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let id_index = headers
        .iter()
        .position(|h| h == CLUSTER_ID_COLUMN)
        .ok_or_else(|| {
            PipelineError::ArtifactError(format!("{} has no {} column", path.display(), CLUSTER_ID_COLUMN))
        })?;
    let size_index = headers.iter().position(|h| h == CLUSTER_SIZE_COLUMN);
    let feature_names: Vec<String> = headers.iter().take(id_index).map(String::from).collect();

    let mut profiles = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or_default();

        let center = (0..id_index)
            .map(|i| parse_cell::<f64>(field(i), path))
            .collect::<Result<Vec<_>, _>>()?;
        let cluster_id = parse_cell::<usize>(field(id_index), path)?;
        let size = match size_index {
            Some(i) => parse_cell::<usize>(field(i), path)?,
            None => 0,
        };

        profiles.push(BenchmarkProfile {
            cluster_id,
            size,
            center,
        });
    }

    Ok((feature_names, profiles))
}

fn parse_cell<T: std::str::FromStr>(cell: &str, path: &Path) -> Result<T, PipelineError> {
    cell.trim().parse().map_err(|_| {
        PipelineError::ArtifactError(format!("{}: cannot parse cell {:?}", path.display(), cell))
    })
}

/// What was found for one expected artifact file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactSummary {
    pub name: String,
    pub present: bool,
    pub run_id: Option<String>,
    pub error: Option<String>,
}

/// Contents of an artifact directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactInventory {
    pub dir: PathBuf,
    pub artifacts: Vec<ArtifactSummary>,
    /// Distinct run ids across the readable artifacts
    pub run_ids: Vec<String>,
}

impl ArtifactInventory {
    /// Everything present parses and comes from a single run
    pub fn is_consistent(&self) -> bool {
        self.run_ids.len() <= 1 && self.artifacts.iter().all(|a| a.error.is_none())
    }
}

/// Check which artifacts exist in `dir`, whether they parse, and their run ids
pub fn inspect_directory(dir: &Path) -> Result<ArtifactInventory, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::InputNotFound(dir.to_path_buf()));
    }

    let envelopes = [
        (SCALER_CLUSTERING_FILE, KIND_SCALER_CLUSTERING),
        (KMEANS_MODEL_FILE, KIND_KMEANS_MODEL),
        (SCALER_CLASSIFIER_FILE, KIND_SCALER_CLASSIFIER),
        (VALIDITY_CLASSIFIER_FILE, KIND_VALIDITY_CLASSIFIER),
    ];

    let mut artifacts: Vec<ArtifactSummary> = envelopes
        .iter()
        .map(|(name, kind)| {
            summarize(dir, name, |path| {
                read_artifact::<serde_json::Value>(path, kind).map(|a| a.run_id)
            })
        })
        .collect();

    artifacts.push(summarize(dir, RUN_REPORT_FILE, |path| {
        let report: RunReport = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(report.run_id)
    }));

    let mut run_ids: Vec<String> = Vec::new();
    for id in artifacts.iter().filter_map(|a| a.run_id.as_ref()) {
        if !run_ids.contains(id) {
            run_ids.push(id.clone());
        }
    }

    Ok(ArtifactInventory {
        dir: dir.to_path_buf(),
        artifacts,
        run_ids,
    })
}

fn summarize<F>(dir: &Path, name: &str, read_run_id: F) -> ArtifactSummary
where
    F: FnOnce(&Path) -> Result<String, PipelineError>,
{
    let path = dir.join(name);
    if !path.is_file() {
        return ArtifactSummary {
            name: name.to_string(),
            present: false,
            run_id: None,
            error: None,
        };
    }

    let (run_id, error) = match read_run_id(&path) {
        Ok(id) => (Some(id), None),
        Err(e) => (None, Some(e.to_string())),
    };
    ArtifactSummary {
        name: name.to_string(),
        present: true,
        run_id,
        error,
    }
}

/// Writes the artifacts of one run into an output directory
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
    run_id: String,
}

impl ArtifactWriter {
    /// Writer with a fresh run id
    pub fn new(dir: &Path) -> Self {
        Self::with_run_id(dir, Uuid::new_v4().to_string())
    }

    pub fn with_run_id(dir: &Path, run_id: String) -> Self {
        Self {
            dir: dir.to_path_buf(),
            run_id,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Record for an artifact this run did not produce
    pub fn skipped(&self, file_name: &str, reason: &str) -> ArtifactRecord {
        tracing::info!("Skipping {}: {}", file_name, reason);
        ArtifactRecord {
            name: file_name.to_string(),
            path: self.path_for(file_name),
            status: ArtifactStatus::Skipped {
                reason: reason.to_string(),
            },
        }
    }

    /// Wrap `payload` in an envelope and write it as pretty JSON
    pub fn write_json<T: Serialize>(
        &self,
        file_name: &str,
        kind: &str,
        feature_names: &[String],
        payload: &T,
    ) -> ArtifactRecord {
        let envelope = FittedArtifact {
            kind: kind.to_string(),
            run_id: self.run_id.clone(),
            producer: PRODUCER_NAME.to_string(),
            version: FORMLAB_VERSION.to_string(),
            created_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            feature_names: feature_names.to_vec(),
            payload,
        };

        self.record(file_name, |path| {
            let json = serde_json::to_string_pretty(&envelope)?;
            fs::write(path, json)?;
            Ok(())
        })
    }

    /// Benchmark centers in original units, one row per group
    pub fn write_benchmarks(
        &self,
        file_name: &str,
        feature_names: &[String],
        profiles: &[BenchmarkProfile],
    ) -> ArtifactRecord {
        self.record(file_name, |path| {
            let mut writer = csv::Writer::from_path(path)?;

            let mut header: Vec<&str> = feature_names.iter().map(String::as_str).collect();
            header.push(CLUSTER_ID_COLUMN);
            header.push(CLUSTER_SIZE_COLUMN);
            writer.write_record(&header)?;

            for profile in profiles {
                let mut row: Vec<String> = profile.center.iter().map(|v| v.to_string()).collect();
                row.push(profile.cluster_id.to_string());
                row.push(profile.size.to_string());
                writer.write_record(&row)?;
            }

            writer.flush()?;
            Ok(())
        })
    }

    /// Every ingested repetition with all of its columns; missing values are empty
    pub fn write_feature_table(&self, file_name: &str, table: &FeatureTable) -> ArtifactRecord {
        self.record(file_name, |path| {
            let mut writer = csv::Writer::from_path(path)?;

            let header: Vec<&str> = FLATTENED_ID_COLUMNS
                .iter()
                .copied()
                .chain(table.columns.iter().map(String::as_str))
                .chain(FLATTENED_TIME_COLUMNS.iter().copied())
                .collect();
            writer.write_record(&header)?;

            for row in &table.rows {
                let mut record = vec![
                    row.source_file.clone(),
                    cell(row.rep_number),
                    cell(row.duration_sec),
                    cell(row.valid_rep),
                ];
                record.extend(table.columns.iter().map(|c| cell(row.get(c))));
                record.push(cell(row.timestamp_start.map(|t| t.to_rfc3339())));
                record.push(cell(row.timestamp_end.map(|t| t.to_rfc3339())));
                writer.write_record(&record)?;
            }

            writer.flush()?;
            Ok(())
        })
    }

    pub fn write_report(&self, report: &RunReport) -> ArtifactRecord {
        self.record(RUN_REPORT_FILE, |path| {
            fs::write(path, serde_json::to_string_pretty(report)?)?;
            Ok(())
        })
    }

    fn record<F>(&self, file_name: &str, write: F) -> ArtifactRecord
    where
        F: FnOnce(&Path) -> Result<(), PipelineError>,
    {
        let path = self.path_for(file_name);
        let status = match write(&path) {
            Ok(()) => {
                tracing::info!("Wrote {}", path.display());
                ArtifactStatus::Written
            }
            Err(e) => {
                tracing::warn!("Failed to write {}: {}", path.display(), e);
                ArtifactStatus::Failed {
                    error: e.to_string(),
                }
            }
        };

        ArtifactRecord {
            name: file_name.to_string(),
            path,
            status,
        }
    }
}

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
