//! Pipeline configuration

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default inclusive range of candidate cluster counts
pub const DEFAULT_K_MIN: usize = 2;
pub const DEFAULT_K_MAX: usize = 5;

/// Default seed for k-means initialisation
pub const DEFAULT_SEED: u64 = 42;

/// Settings for one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Smallest candidate cluster count (inclusive)
    pub k_min: usize,
    /// Largest candidate cluster count (inclusive)
    pub k_max: usize,
    /// Seed for k-means++ initialisation
    pub seed: u64,
    /// Independent k-means initialisations per candidate k; lowest inertia wins
    pub kmeans_restarts: usize,
    pub kmeans_max_iterations: usize,
    /// Convergence threshold on the largest squared centroid shift
    pub kmeans_tolerance: f64,
    /// Number of trees in the validity classifier ensemble
    pub classifier_trees: usize,
    pub classifier_max_depth: u32,
    pub classifier_learning_rate: f64,
    /// Prefix of the tabular artifact file names
    pub dataset_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            k_min: DEFAULT_K_MIN,
            k_max: DEFAULT_K_MAX,
            seed: DEFAULT_SEED,
            kmeans_restarts: 10,
            kmeans_max_iterations: 300,
            kmeans_tolerance: 1e-4,
            classifier_trees: 100,
            classifier_max_depth: 6,
            classifier_learning_rate: 0.1,
            dataset_name: "pushup".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn with_k_range(mut self, k_min: usize, k_max: usize) -> Self {
        self.k_min = k_min;
        self.k_max = k_max;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_classifier_trees(mut self, trees: usize) -> Self {
        self.classifier_trees = trees;
        self
    }

    pub fn with_dataset_name(mut self, name: &str) -> Self {
        self.dataset_name = name.to_string();
        self
    }

    /// Load a configuration from a JSON file; omitted fields take defaults
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.k_min < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "k_min must be at least 2, got {}",
                self.k_min
            )));
        }
        if self.k_max < self.k_min {
            return Err(PipelineError::InvalidConfig(format!(
                "k_max ({}) must not be below k_min ({})",
                self.k_max, self.k_min
            )));
        }
        if self.kmeans_restarts == 0 || self.kmeans_max_iterations == 0 {
            return Err(PipelineError::InvalidConfig(
                "k-means restarts and iterations must be positive".to_string(),
            ));
        }
        if self.kmeans_tolerance.is_nan() || self.kmeans_tolerance < 0.0 {
            return Err(PipelineError::InvalidConfig(
                "k-means tolerance must be non-negative".to_string(),
            ));
        }
        if self.classifier_trees == 0 || self.classifier_max_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "classifier trees and depth must be positive".to_string(),
            ));
        }
        if !(self.classifier_learning_rate > 0.0) {
            return Err(PipelineError::InvalidConfig(
                "classifier learning rate must be positive".to_string(),
            ));
        }
        if self.dataset_name.trim().is_empty()
            || self
                .dataset_name
                .contains(|c: char| c == '/' || c == '\\')
        {
            return Err(PipelineError::InvalidConfig(format!(
                "dataset name {:?} is not a valid file prefix",
                self.dataset_name
            )));
        }
        Ok(())
    }
}
