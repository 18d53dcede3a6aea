//! Validity classifier
//!
//! Trains a gradient-boosted tree ensemble that predicts whether a repetition
//! has valid form. Only rows carrying a validity label are used; missing
//! feature values are filled with zero rather than dropped.
//!
//! Note: the gbdt crate works in `f32`, while feature rows are `f64`. Values
//! are narrowed at the boundary and probabilities widened back.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::standardize::Standardizer;
use crate::types::{ClassMetrics, FeatureTable, TrainingReport};
use gbdt::config::Config;
use gbdt::decision_tree::Data;
use gbdt::gradient_boost::GBDT;
use std::fmt;

/// Value substituted for a feature a labeled row lacks
pub const MISSING_FEATURE_FILL: f64 = 0.0;

/// Probability at or above which a repetition is classified as valid
pub const DECISION_THRESHOLD: f64 = 0.5;

fn to_f32(row: &[f64]) -> Vec<f32> {
    row.iter().map(|&v| v as f32).collect()
}

/// Fitted standardizer + tree ensemble pair
pub struct ValidityModel {
    pub feature_names: Vec<String>,
    pub standardizer: Standardizer,
    pub model: GBDT,
    pub report: TrainingReport,
}

impl fmt::Debug for ValidityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidityModel")
            .field("feature_names", &self.feature_names)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl ValidityModel {
    /// Probability that a row of raw (unstandardized) feature values is valid
    pub fn predict_proba(&self, raw: &[f64]) -> Result<f64, PipelineError> {
        let probabilities = predict_with(&self.standardizer, &self.model, &[raw.to_vec()])?;
        Ok(probabilities.first().copied().unwrap_or(DECISION_THRESHOLD))
    }
}

/// Standardize raw rows and run them through a trained ensemble
pub fn predict_with(
    standardizer: &Standardizer,
    model: &GBDT,
    raw: &[Vec<f64>],
) -> Result<Vec<f64>, PipelineError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let data: Vec<Data> = standardizer
        .transform(raw)?
        .iter()
        .map(|row| Data::new_test_data(to_f32(row), None))
        .collect();

    Ok(model.predict(&data).into_iter().map(|p| p as f64).collect())
}

/// Outcome of classifier training
#[derive(Debug)]
pub enum ClassifierOutcome {
    Trained(Box<ValidityModel>),
    Unavailable { reason: String },
}

/// Trains the validity classifier over a feature table
#[derive(Debug, Clone, PartialEq)]
pub struct ValidityClassifier {
    pub trees: usize,
    pub max_depth: u32,
    pub learning_rate: f64,
}

impl Default for ValidityClassifier {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl ValidityClassifier {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            trees: config.classifier_trees,
            max_depth: config.classifier_max_depth,
            learning_rate: config.classifier_learning_rate,
        }
    }

    /// Train on every labeled row of `table`.
    ///
    /// Returns `Unavailable` when fewer than two distinct labels are present.
    pub fn fit(
        &self,
        table: &FeatureTable,
        features: &[String],
    ) -> Result<ClassifierOutcome, PipelineError> {
        let labeled: Vec<(Vec<f64>, bool)> = table
            .rows
            .iter()
            .filter_map(|row| {
                row.valid_rep
                    .map(|label| (row.filled_vector(features, MISSING_FEATURE_FILL), label))
            })
            .collect();

        let unlabeled = table.len() - labeled.len();
        if unlabeled > 0 {
            tracing::debug!("Classifier: ignoring {} rows without a validity label", unlabeled);
        }

        let positives = labeled.iter().filter(|(_, label)| *label).count();
        if labeled.is_empty() {
            tracing::info!("Classifier: no validity labels, skipping training");
            return Ok(ClassifierOutcome::Unavailable {
                reason: "no rows carry a validity label".to_string(),
            });
        }
        if positives == 0 || positives == labeled.len() {
            tracing::info!("Classifier: only one validity class present, skipping training");
            return Ok(ClassifierOutcome::Unavailable {
                reason: format!(
                    "all {} labeled rows share the same validity value",
                    labeled.len()
                ),
            });
        }

        let (raw, labels): (Vec<Vec<f64>>, Vec<bool>) = labeled.into_iter().unzip();
        let standardizer = Standardizer::fit(features, &raw)?;
        let scaled = standardizer.transform(&raw)?;
        let model = self.train(&scaled, &labels)?;

        let probabilities = predict_with(&standardizer, &model, &raw)?;
        let predicted: Vec<bool> = probabilities
            .iter()
            .map(|&p| p >= DECISION_THRESHOLD)
            .collect();
        let report = training_report(&labels, &predicted);

        tracing::info!(
            "Classifier: trained on {} rows, accuracy={:.3}, macro F1={:.3}",
            report.samples,
            report.accuracy,
            report.macro_f1
        );

        Ok(ClassifierOutcome::Trained(Box::new(ValidityModel {
            feature_names: features.to_vec(),
            standardizer,
            model,
            report,
        })))
    }

    fn train(&self, scaled: &[Vec<f64>], labels: &[bool]) -> Result<GBDT, PipelineError> {
        let feature_size = scaled.first().map_or(0, Vec::len);
        if feature_size == 0 {
            return Err(PipelineError::ModelError(
                "classifier needs at least one feature".to_string(),
            ));
        }

        let mut cfg = Config::new();
        cfg.set_feature_size(feature_size);
        cfg.set_max_depth(self.max_depth);
        cfg.set_iterations(self.trees);
        cfg.set_shrinkage(self.learning_rate as f32);
        cfg.set_loss("LogLikelyhood");
        cfg.set_debug(false);
        cfg.set_training_optimization_level(2);
        cfg.set_min_leaf_size(1);

        let mut gbdt = GBDT::new(&cfg);

        // LogLikelyhood expects labels of +1 / -1
        let mut training_data: Vec<Data> = scaled
            .iter()
            .zip(labels)
            .map(|(row, &valid)| {
                let label = if valid { 1.0_f32 } else { -1.0_f32 };
                Data::new_training_data(to_f32(row), 1.0_f32, label, None)
            })
            .collect();

        gbdt.fit(&mut training_data);
        Ok(gbdt)
    }
}

/// Per-class precision, recall and F1 plus accuracy and macro averages.
///
/// Classes are reported in the order `false`, `true`. A class never predicted
/// has precision 0.
pub fn training_report(truth: &[bool], predicted: &[bool]) -> TrainingReport {
    let samples = truth.len().min(predicted.len());
    let pairs: Vec<(bool, bool)> = truth
        .iter()
        .copied()
        .zip(predicted.iter().copied())
        .collect();

    let classes: Vec<ClassMetrics> = [false, true]
        .iter()
        .map(|&label| {
            let tp = pairs.iter().filter(|&&(t, p)| t == label && p == label).count();
            let fp = pairs.iter().filter(|&&(t, p)| t != label && p == label).count();
            let support = pairs.iter().filter(|&&(t, _)| t == label).count();

            let precision = ratio(tp, tp + fp);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };

            ClassMetrics {
                label,
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect();

    let correct = pairs.iter().filter(|(t, p)| t == p).count();
    let n_classes = classes.len() as f64;

    TrainingReport {
        accuracy: ratio(correct, samples),
        macro_precision: classes.iter().map(|c| c.precision).sum::<f64>() / n_classes,
        macro_recall: classes.iter().map(|c| c.recall).sum::<f64>() / n_classes,
        macro_f1: classes.iter().map(|c| c.f1).sum::<f64>() / n_classes,
        classes,
        samples,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
