//! Pipeline orchestration
//!
//! This module provides the public entry point for a training run. It takes an
//! input directory of session files and an output directory, and returns a
//! [`RunReport`] describing what was ingested and which artifacts were written.

use crate::artifacts::{
    benchmarks_file, flattened_file, ArtifactWriter, KIND_KMEANS_MODEL, KIND_SCALER_CLASSIFIER,
    KIND_SCALER_CLUSTERING, KIND_VALIDITY_CLASSIFIER, KMEANS_MODEL_FILE, RUN_REPORT_FILE,
    SCALER_CLASSIFIER_FILE, SCALER_CLUSTERING_FILE, VALIDITY_CLASSIFIER_FILE,
};
use crate::classifier::{ClassifierOutcome, ValidityClassifier};
use crate::cluster::{BenchmarkClusterer, ClusteringOutcome};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::features::{FeatureEngineer, FeatureSelector};
use crate::flatten::Flattener;
use crate::ingest::{IngestResult, Ingestor};
use crate::types::{ArtifactRecord, FeatureTable, RunReport, StageOutcome, TrainingReport};
use crate::{FORMLAB_VERSION, PRODUCER_NAME};
use std::fs;
use std::path::Path;

/// Run the full training pipeline.
///
/// # Arguments
/// * `input` - Directory of session JSON files
/// * `output` - Directory for artifacts; created if missing
/// * `config` - Clustering and classifier settings
///
/// # Returns
/// The run report. Fails before writing anything when the input is missing,
/// yields no repetitions, or has no usable feature columns.
///
/// # Example
/// ```ignore
/// let report = run_pipeline(
///     Path::new("data/sessions"),
///     Path::new("models"),
///     &PipelineConfig::default(),
/// )?;
/// println!("{} artifacts written", report.artifacts_written());
/// ```
pub fn run_pipeline(
    input: &Path,
    output: &Path,
    config: &PipelineConfig,
) -> Result<RunReport, PipelineError> {
    TrainingPipeline::new(config.clone())?.run(input, output)
}

/// Ingested, flattened and engineered data plus the chosen feature columns
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub ingest: IngestResult,
    pub table: FeatureTable,
    pub features: Vec<String>,
}

/// Configured training pipeline.
///
/// Use this when the feature registry or column rules differ from the defaults.
#[derive(Debug, Clone)]
pub struct TrainingPipeline {
    config: PipelineConfig,
    engineer: FeatureEngineer,
    selector: FeatureSelector,
}

impl TrainingPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            engineer: FeatureEngineer::default(),
            selector: FeatureSelector::default(),
        })
    }

    pub fn with_engineer(mut self, engineer: FeatureEngineer) -> Self {
        self.engineer = engineer;
        self
    }

    pub fn with_selector(mut self, selector: FeatureSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingest, flatten, engineer and select features; writes nothing.
    ///
    /// Pipeline stages:
    /// 1. Ingestor - Read session files, skipping malformed ones
    /// 2. Flattener - One row per repetition
    /// 3. FeatureEngineer - Registry-driven derived features
    /// 4. FeatureSelector - Model input columns
    pub fn prepare(&self, input: &Path) -> Result<PreparedData, PipelineError> {
        let mut ingest = Ingestor::ingest_directory(input)?;
        if ingest.records.is_empty() {
            return Err(PipelineError::EmptyInput(input.to_path_buf()));
        }

        let mut table = Flattener::flatten(&ingest.records);
        self.engineer.engineer(&mut table);
        // Records are fully represented by the table from here on
        ingest.records = Vec::new();

        let features = self.selector.select(&table);
        if features.is_empty() {
            return Err(PipelineError::NoUsableFeatures);
        }

        tracing::info!(
            "Prepared {} rows with {} feature columns",
            table.len(),
            features.len()
        );

        Ok(PreparedData {
            ingest,
            table,
            features,
        })
    }

    /// Run every stage and persist the artifacts into `output`
    pub fn run(&self, input: &Path, output: &Path) -> Result<RunReport, PipelineError> {
        let prepared = self.prepare(input)?;
        let reps_ingested = prepared.table.len();

        fs::create_dir_all(output)?;
        let writer = ArtifactWriter::new(output);
        tracing::info!("Run {} writing to {}", writer.run_id(), output.display());

        let mut artifacts = Vec::new();

        let clustering = self.run_clustering(&prepared, &writer, &mut artifacts);
        let (classifier, training_report) =
            self.run_classifier(&prepared, &writer, &mut artifacts);

        artifacts.push(writer.write_feature_table(
            &flattened_file(&self.config.dataset_name),
            &prepared.table,
        ));

        let mut report = RunReport {
            run_id: writer.run_id().to_string(),
            producer: PRODUCER_NAME.to_string(),
            version: FORMLAB_VERSION.to_string(),
            files_scanned: prepared.ingest.files_scanned,
            files_skipped: prepared.ingest.files_skipped,
            reps_ingested,
            warnings: prepared.ingest.warnings,
            feature_columns: prepared.features,
            clustering,
            classifier,
            training_report,
            artifacts,
        };

        // The report on disk lists every artifact except itself
        let record = writer.write_report(&report);
        report.artifacts.push(record);

        tracing::info!(
            "Run {} finished: {} of {} artifacts written",
            report.run_id,
            report.artifacts_written(),
            report.artifacts.len()
        );

        Ok(report)
    }

    fn run_clustering(
        &self,
        prepared: &PreparedData,
        writer: &ArtifactWriter,
        artifacts: &mut Vec<ArtifactRecord>,
    ) -> StageOutcome {
        let benchmarks = benchmarks_file(&self.config.dataset_name);
        let valid = prepared.table.filter(|row| row.is_benchmark_candidate());
        tracing::info!("Clustering {} valid rows", valid.len());

        let outcome = BenchmarkClusterer::from_config(&self.config).fit(&valid, &prepared.features);

        let reason = match outcome {
            Ok(ClusteringOutcome::Fitted(model)) => {
                let features = &model.feature_names;
                artifacts.push(writer.write_json(
                    SCALER_CLUSTERING_FILE,
                    KIND_SCALER_CLUSTERING,
                    features,
                    &model.standardizer,
                ));
                artifacts.push(writer.write_json(
                    KMEANS_MODEL_FILE,
                    KIND_KMEANS_MODEL,
                    features,
                    &model.kmeans,
                ));
                artifacts.push(writer.write_benchmarks(&benchmarks, features, &model.profiles));

                return StageOutcome::Completed {
                    summary: format!(
                        "k={}, silhouette={:.3}, {} rows clustered, {} dropped",
                        model.kmeans.k(),
                        model.silhouette,
                        model.assignments.len(),
                        model.rows_dropped
                    ),
                };
            }
            Ok(ClusteringOutcome::Unavailable { reason, .. }) => reason,
            Err(e) => {
                tracing::warn!("Clustering failed: {}", e);
                e.to_string()
            }
        };

        tracing::info!("Benchmark clustering unavailable: {}", reason);
        for file in [SCALER_CLUSTERING_FILE, KMEANS_MODEL_FILE, benchmarks.as_str()] {
            artifacts.push(writer.skipped(file, &reason));
        }
        StageOutcome::Unavailable { reason }
    }

    fn run_classifier(
        &self,
        prepared: &PreparedData,
        writer: &ArtifactWriter,
        artifacts: &mut Vec<ArtifactRecord>,
    ) -> (StageOutcome, Option<TrainingReport>) {
        let outcome =
            ValidityClassifier::from_config(&self.config).fit(&prepared.table, &prepared.features);

        let reason = match outcome {
            Ok(ClassifierOutcome::Trained(model)) => {
                let features = &model.feature_names;
                artifacts.push(writer.write_json(
                    SCALER_CLASSIFIER_FILE,
                    KIND_SCALER_CLASSIFIER,
                    features,
                    &model.standardizer,
                ));
                artifacts.push(writer.write_json(
                    VALIDITY_CLASSIFIER_FILE,
                    KIND_VALIDITY_CLASSIFIER,
                    features,
                    &model.model,
                ));

                let summary = format!(
                    "{} labeled rows, accuracy={:.3}, macro F1={:.3}",
                    model.report.samples, model.report.accuracy, model.report.macro_f1
                );
                return (StageOutcome::Completed { summary }, Some(model.report));
            }
            Ok(ClassifierOutcome::Unavailable { reason }) => reason,
            Err(e) => {
                tracing::warn!("Classifier training failed: {}", e);
                e.to_string()
            }
        };

        tracing::info!("Validity classifier unavailable: {}", reason);
        for file in [SCALER_CLASSIFIER_FILE, VALIDITY_CLASSIFIER_FILE] {
            artifacts.push(writer.skipped(file, &reason));
        }
        (StageOutcome::Unavailable { reason }, None)
    }
}

/// File name of the run report inside an output directory
pub fn run_report_path(output: &Path) -> std::path::PathBuf {
    output.join(RUN_REPORT_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::read_benchmarks;
    use crate::scoring::RepScorer;
    use crate::types::{ArtifactStatus, RepRecord};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rep(n: usize, down_elbow: f64, up_elbow: f64, hip: f64, valid: Option<bool>) -> serde_json::Value {
        let wobble = (n as f64 * 0.7).sin() * 2.0;
        let mut rep = json!({
            "rep_number": n,
            "duration_sec": 2.0,
            "down": {"elbow_angle": down_elbow + wobble, "hip_angle": hip - wobble, "frame": n * 10},
            "up": {"elbow_angle": up_elbow - wobble, "hip_angle": hip + 5.0 + wobble, "frame": n * 10 + 5},
            "range_of_motion": {},
            "timestamp_start": 1_700_000_000_000_u64 + n as u64 * 2000,
            "timestamp_end": "2023-11-14T22:13:22Z"
        });
        if let Some(valid) = valid {
            rep["valid_rep"] = json!(valid);
        }
        rep
    }

    /// Two styles of valid rep plus shallow invalid ones
    fn write_sessions(dir: &Path, with_invalid: bool) {
        let mut first = Vec::new();
        let mut second = Vec::new();
        for n in 0..12 {
            first.push(rep(n, 70.0, 165.0, 172.0, Some(true)));
            second.push(rep(n, 100.0, 150.0, 150.0, Some(true)));
            if with_invalid {
                second.push(rep(n + 100, 135.0, 160.0, 140.0, Some(false)));
            }
        }
        first.push(rep(50, 72.0, 166.0, 171.0, None));

        fs::write(dir.join("session_a.json"), json!({"reps": first}).to_string()).unwrap();
        fs::write(dir.join("session_b.json"), json!({"reps": second}).to_string()).unwrap();
        fs::write(dir.join("broken.json"), "{\"reps\": [").unwrap();
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig::default().with_classifier_trees(20)
    }

    fn status_of<'a>(report: &'a RunReport, name: &str) -> &'a ArtifactStatus {
        &report
            .artifacts
            .iter()
            .find(|a| a.name == name)
            .unwrap_or_else(|| panic!("no record for {}", name))
            .status
    }

    #[test]
    fn test_full_run() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_sessions(input.path(), true);

        let report = run_pipeline(input.path(), output.path(), &fast_config()).unwrap();

        assert_eq!(report.files_scanned, 3);
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].file, "broken.json");
        assert_eq!(report.reps_ingested, 37);
        assert!(report.clustering.is_completed(), "{:?}", report.clustering);
        assert!(report.classifier.is_completed(), "{:?}", report.classifier);
        assert!(report.training_report.is_some());
        assert!(!report.has_failed_artifacts());
        assert_eq!(report.artifacts_written(), 7);

        assert!(report.feature_columns.contains(&"rom_elbow_delta".to_string()));
        assert!(report.feature_columns.contains(&"rom_elbow_delta_rate".to_string()));
        assert!(!report.feature_columns.iter().any(|c| c.ends_with("_frame")));

        for name in [
            SCALER_CLUSTERING_FILE,
            KMEANS_MODEL_FILE,
            "pushup_cluster_benchmarks.csv",
            SCALER_CLASSIFIER_FILE,
            VALIDITY_CLASSIFIER_FILE,
            "pushup_flattened_data.csv",
            RUN_REPORT_FILE,
        ] {
            assert_eq!(status_of(&report, name), &ArtifactStatus::Written, "{}", name);
            assert!(output.path().join(name).is_file(), "{}", name);
        }

        let saved: RunReport =
            serde_json::from_str(&fs::read_to_string(run_report_path(output.path())).unwrap())
                .unwrap();
        assert_eq!(saved.run_id, report.run_id);
        assert_eq!(saved.artifacts.len(), report.artifacts.len() - 1);

        let flattened = fs::read_to_string(output.path().join("pushup_flattened_data.csv")).unwrap();
        assert_eq!(flattened.lines().count(), 38);

        let (features, profiles) =
            read_benchmarks(&output.path().join("pushup_cluster_benchmarks.csv")).unwrap();
        assert_eq!(features, report.feature_columns);
        assert!(profiles.len() >= 2);
    }

    #[test]
    fn test_artifacts_score_new_reps() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_sessions(input.path(), true);
        let report = run_pipeline(input.path(), output.path(), &fast_config()).unwrap();

        let scorer = RepScorer::load(output.path()).unwrap();
        assert_eq!(scorer.run_id(), report.run_id);

        let live: RepRecord = serde_json::from_value(rep(3, 70.0, 165.0, 172.0, None)).unwrap();
        let score = scorer.score(&live).unwrap();
        assert!(score.nearest_cluster.is_some());
        assert_eq!(score.deviations.len(), report.feature_columns.len());
        assert_eq!(score.predicted_valid, Some(true));
    }

    #[test]
    fn test_single_class_skips_classifier() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_sessions(input.path(), false);

        let report = run_pipeline(input.path(), output.path(), &fast_config()).unwrap();

        assert!(report.clustering.is_completed());
        assert!(!report.classifier.is_completed());
        assert_eq!(report.training_report, None);
        assert!(matches!(
            status_of(&report, VALIDITY_CLASSIFIER_FILE),
            ArtifactStatus::Skipped { .. }
        ));
        assert!(!output.path().join(VALIDITY_CLASSIFIER_FILE).exists());
        assert!(output.path().join("pushup_flattened_data.csv").is_file());
    }

    #[test]
    fn test_dataset_name_prefixes_tables() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_sessions(input.path(), false);

        let config = fast_config().with_dataset_name("vsit");
        run_pipeline(input.path(), output.path(), &config).unwrap();

        assert!(output.path().join("vsit_flattened_data.csv").is_file());
        assert!(output.path().join("vsit_cluster_benchmarks.csv").is_file());
    }

    #[test]
    fn test_missing_input_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("out");

        let result = run_pipeline(&root.path().join("nope"), &output, &fast_config());
        assert!(matches!(result, Err(PipelineError::InputNotFound(_))));
        assert!(!output.exists());
    }

    #[test]
    fn test_empty_input_is_fatal() {
        let input = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("out");
        fs::write(input.path().join("broken.json"), "not json").unwrap();
        fs::write(input.path().join("empty.json"), r#"{"reps": []}"#).unwrap();

        let result = run_pipeline(input.path(), &output, &fast_config());
        assert!(matches!(result, Err(PipelineError::EmptyInput(_))));
        assert!(!output.exists());
    }

    #[test]
    fn test_no_usable_features_is_fatal() {
        let input = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("out");
        let session = json!({"reps": [
            {"rep_number": 1, "down": {"hip_y": 0.5, "frame": 3}, "up": {"hip_y": 0.4}},
            {"rep_number": 2, "down": {"hip_y": 0.6}, "up": {"hip_y": 0.3}}
        ]});
        fs::write(input.path().join("s.json"), session.to_string()).unwrap();

        let result = run_pipeline(input.path(), &output, &fast_config());
        assert!(matches!(result, Err(PipelineError::NoUsableFeatures)));
        assert!(!output.exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PipelineConfig::default().with_k_range(5, 2);
        assert!(matches!(
            TrainingPipeline::new(config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
