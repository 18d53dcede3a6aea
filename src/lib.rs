//! Formlab - Offline benchmark and form-validity training for exercise repetitions
//!
//! Formlab turns per-repetition, pose-derived exercise metrics into reusable
//! artifacts through a deterministic pipeline: ingestion → flattening → feature
//! engineering → benchmark clustering + validity classification → persistence.
//!
//! ## Modules
//!
//! - **Training**: [`run_pipeline`] reads a directory of session files and writes
//!   fitted standardizers, models and tables to an output directory
//! - **Scoring**: [`RepScorer`] loads those artifacts and scores new repetitions
//!   with the same feature rules used in training

pub mod artifacts;
pub mod classifier;
pub mod cluster;
pub mod config;
pub mod error;
pub mod features;
pub mod flatten;
pub mod ingest;
pub mod pipeline;
pub mod scoring;
pub mod standardize;
pub mod types;

pub use artifacts::{inspect_directory, ArtifactInventory, ArtifactWriter, FittedArtifact};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{run_pipeline, TrainingPipeline};
pub use scoring::{RepScore, RepScorer};
pub use types::{RepRecord, RunReport};

/// Formlab version embedded in every artifact envelope
pub const FORMLAB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for artifact envelopes and run reports
pub const PRODUCER_NAME: &str = "formlab";
