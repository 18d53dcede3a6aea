//! Error types for Formlab

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a pipeline run or an artifact operation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Input location does not exist: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("No usable repetitions found in {}", .0.display())]
    EmptyInput(PathBuf),

    #[error("Invalid session file {file}: {reason}")]
    InvalidSession { file: String, reason: String },

    #[error("No numeric range-of-motion, angle, slope or rate columns found")]
    NoUsableFeatures,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Artifact error: {0}")]
    ArtifactError(String),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}
