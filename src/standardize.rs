//! Feature standardization
//!
//! Rescales each feature to zero mean and unit variance using parameters fit
//! once on a training matrix. The same parameters transform every row of a
//! run and are persisted next to the model that consumed them.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// Per-feature mean and scale fit on a training matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    feature_names: Vec<String>,
    mean: Vec<f64>,
    /// Population standard deviation; 1.0 for constant features
    scale: Vec<f64>,
    n_samples: usize,
}

impl Standardizer {
    /// Fit mean and scale per column of `rows`
    pub fn fit(feature_names: &[String], rows: &[Vec<f64>]) -> Result<Self, PipelineError> {
        if rows.is_empty() {
            return Err(PipelineError::ModelError(
                "cannot fit a standardizer on zero rows".to_string(),
            ));
        }

        let width = feature_names.len();
        for row in rows {
            check_width(width, row)?;
        }

        let n = rows.len() as f64;
        let mut mean = vec![0.0; width];
        for row in rows {
            for (m, value) in mean.iter_mut().zip(row) {
                *m += value;
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut variance = vec![0.0; width];
        for row in rows {
            for ((v, value), m) in variance.iter_mut().zip(row).zip(&mean) {
                *v += (value - m).powi(2);
            }
        }

        let scale = variance
            .into_iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std > f64::EPSILON * 10.0 {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        Ok(Self {
            feature_names: feature_names.to_vec(),
            mean,
            scale,
            n_samples: rows.len(),
        })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>, PipelineError> {
        check_width(self.feature_names.len(), row)?;
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(value, (m, s))| (value - m) / s)
            .collect())
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, PipelineError> {
        rows.iter().map(|row| self.transform_row(row)).collect()
    }

    /// Map a standardized row back to original units
    pub fn inverse_transform_row(&self, row: &[f64]) -> Result<Vec<f64>, PipelineError> {
        check_width(self.feature_names.len(), row)?;
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(value, (m, s))| value * s + m)
            .collect())
    }

    /// Load a standardizer from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the standardizer to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn check_width(expected: usize, row: &[f64]) -> Result<(), PipelineError> {
    if row.len() != expected {
        return Err(PipelineError::DimensionMismatch {
            expected,
            actual: row.len(),
        });
    }
    Ok(())
}
