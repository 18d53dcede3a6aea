//! Scoring new repetitions against persisted artifacts
//!
//! A repetition is flattened and engineered with the same rules used in
//! training, then compared to the nearest benchmark profile and run through
//! the validity classifier. Either half is optional: only the standardizer +
//! model pairs present in the artifact directory are loaded.

use crate::artifacts::{
    read_artifact, FittedArtifact, KIND_KMEANS_MODEL, KIND_SCALER_CLASSIFIER,
    KIND_SCALER_CLUSTERING, KIND_VALIDITY_CLASSIFIER, KMEANS_MODEL_FILE, SCALER_CLASSIFIER_FILE,
    SCALER_CLUSTERING_FILE, VALIDITY_CLASSIFIER_FILE,
};
use crate::classifier::{predict_with, DECISION_THRESHOLD, MISSING_FEATURE_FILL};
use crate::cluster::KMeansModel;
use crate::error::PipelineError;
use crate::features::FeatureEngineer;
use crate::flatten::Flattener;
use crate::standardize::Standardizer;
use crate::types::{FeatureRow, RepRecord};
use gbdt::gradient_boost::GBDT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Benchmark stage loaded from disk
#[derive(Debug, Clone)]
pub struct BenchmarkScorer {
    pub feature_names: Vec<String>,
    pub standardizer: Standardizer,
    pub kmeans: KMeansModel,
    /// Group centers in original units
    pub centers: Vec<Vec<f64>>,
}

/// Classifier stage loaded from disk
pub struct ClassifierScorer {
    pub feature_names: Vec<String>,
    pub standardizer: Standardizer,
    pub model: GBDT,
}

/// How far one feature sits from the matched benchmark center
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDeviation {
    pub feature: String,
    pub value: f64,
    pub benchmark: f64,
    /// `value - benchmark`, original units
    pub deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepScore {
    pub source_file: String,
    pub rep_number: Option<i64>,
    pub nearest_cluster: Option<usize>,
    /// Euclidean distance to the nearest center in standardized space
    pub distance: Option<f64>,
    pub deviations: Vec<FeatureDeviation>,
    pub valid_probability: Option<f64>,
    pub predicted_valid: Option<bool>,
}

/// Scores repetitions with the artifacts of one training run
pub struct RepScorer {
    run_id: String,
    engineer: FeatureEngineer,
    benchmarks: Option<BenchmarkScorer>,
    classifier: Option<ClassifierScorer>,
}

impl RepScorer {
    /// Load every complete standardizer + model pair in `dir`.
    ///
    /// Fails when neither pair exists, when a pair is incomplete, or when the
    /// two halves of a pair come from different runs.
    pub fn load(dir: &Path) -> Result<Self, PipelineError> {
        let benchmark_pair = load_pair::<KMeansModel>(
            dir,
            (SCALER_CLUSTERING_FILE, KIND_SCALER_CLUSTERING),
            (KMEANS_MODEL_FILE, KIND_KMEANS_MODEL),
        )?;
        let classifier_pair = load_pair::<GBDT>(
            dir,
            (SCALER_CLASSIFIER_FILE, KIND_SCALER_CLASSIFIER),
            (VALIDITY_CLASSIFIER_FILE, KIND_VALIDITY_CLASSIFIER),
        )?;

        let run_id = match (&benchmark_pair, &classifier_pair) {
            (Some((a, _)), Some((b, _))) => {
                if a.run_id != b.run_id {
                    tracing::warn!(
                        "Benchmark artifacts ({}) and classifier artifacts ({}) come from different runs",
                        a.run_id,
                        b.run_id
                    );
                }
                a.run_id.clone()
            }
            (Some((a, _)), None) => a.run_id.clone(),
            (None, Some((b, _))) => b.run_id.clone(),
            (None, None) => {
                return Err(PipelineError::ArtifactError(format!(
                    "no benchmark or classifier artifacts in {}",
                    dir.display()
                )))
            }
        };

        let benchmarks = benchmark_pair
            .map(|(scaler, model)| {
                let centers = model
                    .payload
                    .centroids
                    .iter()
                    .map(|c| scaler.payload.inverse_transform_row(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, PipelineError>(BenchmarkScorer {
                    feature_names: scaler.feature_names,
                    standardizer: scaler.payload,
                    kmeans: model.payload,
                    centers,
                })
            })
            .transpose()?;

        let classifier = classifier_pair.map(|(scaler, model)| ClassifierScorer {
            feature_names: scaler.feature_names,
            standardizer: scaler.payload,
            model: model.payload,
        });

        tracing::info!(
            "Loaded artifacts of run {} (benchmarks: {}, classifier: {})",
            run_id,
            benchmarks.is_some(),
            classifier.is_some()
        );

        Ok(Self {
            run_id,
            engineer: FeatureEngineer::default(),
            benchmarks,
            classifier,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn benchmarks(&self) -> Option<&BenchmarkScorer> {
        self.benchmarks.as_ref()
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Flatten and engineer one repetition the way training did
    pub fn prepare(&self, record: &RepRecord) -> FeatureRow {
        let mut row = Flattener::flatten_one(record);
        self.engineer.engineer_row(&mut row);
        row
    }

    pub fn score(&self, record: &RepRecord) -> Result<RepScore, PipelineError> {
        let row = self.prepare(record);

        let mut score = RepScore {
            source_file: row.source_file.clone(),
            rep_number: row.rep_number,
            nearest_cluster: None,
            distance: None,
            deviations: Vec::new(),
            valid_probability: None,
            predicted_valid: None,
        };

        if let Some(bench) = &self.benchmarks {
            match row.complete_vector(&bench.feature_names) {
                Some(raw) => {
                    let scaled = bench.standardizer.transform_row(&raw)?;
                    let (cluster, distance) = bench.kmeans.nearest(&scaled);
                    score.nearest_cluster = Some(cluster);
                    score.distance = Some(distance);

                    if let Some(center) = bench.centers.get(cluster) {
                        score.deviations = bench
                            .feature_names
                            .iter()
                            .zip(raw.iter().zip(center))
                            .map(|(feature, (&value, &benchmark))| FeatureDeviation {
                                feature: feature.clone(),
                                value,
                                benchmark,
                                deviation: value - benchmark,
                            })
                            .collect();
                    }
                }
                None => tracing::debug!(
                    "Rep {:?} of {} lacks benchmark features",
                    row.rep_number,
                    row.source_file
                ),
            }
        }

        if let Some(clf) = &self.classifier {
            let raw = row.filled_vector(&clf.feature_names, MISSING_FEATURE_FILL);
            let probability = predict_with(&clf.standardizer, &clf.model, &[raw])?
                .first()
                .copied();
            score.valid_probability = probability;
            score.predicted_valid = probability.map(|p| p >= DECISION_THRESHOLD);
        }

        Ok(score)
    }
}

type Pair<M> = (FittedArtifact<Standardizer>, FittedArtifact<M>);

fn load_pair<M: DeserializeOwned>(
    dir: &Path,
    (scaler_file, scaler_kind): (&str, &str),
    (model_file, model_kind): (&str, &str),
) -> Result<Option<Pair<M>>, PipelineError> {
    let scaler_path = dir.join(scaler_file);
    let model_path = dir.join(model_file);

    match (scaler_path.is_file(), model_path.is_file()) {
        (false, false) => return Ok(None),
        (true, false) | (false, true) => {
            return Err(PipelineError::ArtifactError(format!(
                "{} and {} must be present together",
                scaler_file, model_file
            )))
        }
        (true, true) => {}
    }

    let scaler: FittedArtifact<Standardizer> = read_artifact(&scaler_path, scaler_kind)?;
    let model: FittedArtifact<M> = read_artifact(&model_path, model_kind)?;

    if scaler.run_id != model.run_id {
        return Err(PipelineError::ArtifactError(format!(
            "{} (run {}) and {} (run {}) belong to different runs",
            scaler_file, scaler.run_id, model_file, model.run_id
        )));
    }
    if scaler.feature_names != model.feature_names {
        return Err(PipelineError::ArtifactError(format!(
            "{} and {} disagree on feature names",
            scaler_file, model_file
        )));
    }

    Ok(Some((scaler, model)))
}
