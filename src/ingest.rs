//! Session file ingestion
//!
//! Scans an input directory for JSON session files and extracts one
//! [`RepRecord`] per element of each file's `reps` array. A file that cannot be
//! read, is not valid JSON, or has no `reps` array is skipped with a warning;
//! it never aborts the scan.

use crate::error::PipelineError;
use crate::types::{IngestWarning, RepRecord};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Repetitions extracted from one session file
#[derive(Debug, Clone, Default)]
pub struct SessionReps {
    pub records: Vec<RepRecord>,
    /// Per-record problems inside an otherwise readable file
    pub warnings: Vec<IngestWarning>,
}

/// Everything read from one input directory
#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    /// Records in file-then-record order
    pub records: Vec<RepRecord>,
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub warnings: Vec<IngestWarning>,
}

/// Directory ingestor for session files
pub struct Ingestor;

impl Ingestor {
    /// Ingest every `*.json` file directly inside `dir`, in file-name order.
    ///
    /// Fails only when `dir` does not exist or cannot be listed.
    pub fn ingest_directory(dir: &Path) -> Result<IngestResult, PipelineError> {
        if !dir.is_dir() {
            return Err(PipelineError::InputNotFound(dir.to_path_buf()));
        }

        let mut result = IngestResult::default();

        for path in session_files(dir)? {
            result.files_scanned += 1;
            let source = file_identity(&path);

            let session = fs::read_to_string(&path)
                .map_err(|e| format!("read error: {}", e))
                .and_then(|contents| parse_session(&source, &contents));

            match session {
                Ok(session) => {
                    tracing::debug!("Read {} reps from {}", session.records.len(), source);
                    result.warnings.extend(session.warnings);
                    result.records.extend(session.records);
                }
                Err(reason) => {
                    tracing::warn!("Skipping {}: {}", source, reason);
                    result.files_skipped += 1;
                    result.warnings.push(IngestWarning {
                        file: source,
                        reason,
                    });
                }
            }
        }

        tracing::info!(
            "Ingested {} reps from {} files ({} skipped)",
            result.records.len(),
            result.files_scanned,
            result.files_skipped
        );

        Ok(result)
    }

    /// Read a single session file, failing on any file-level problem
    pub fn read_session(path: &Path) -> Result<SessionReps, PipelineError> {
        let source = file_identity(path);
        let contents = fs::read_to_string(path)?;
        parse_session(&source, &contents)
            .map_err(|reason| PipelineError::InvalidSession { file: source, reason })
    }

    /// Parse session JSON already in memory
    pub fn parse_session(source_file: &str, json: &str) -> Result<SessionReps, PipelineError> {
        parse_session(source_file, json).map_err(|reason| PipelineError::InvalidSession {
            file: source_file.to_string(),
            reason,
        })
    }
}

/// JSON files directly inside `dir`, sorted by path
fn session_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn file_identity(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn parse_session(source_file: &str, json: &str) -> Result<SessionReps, String> {
    let value: Value = serde_json::from_str(json).map_err(|e| format!("invalid JSON: {}", e))?;

    let reps = match value.get("reps") {
        Some(Value::Array(reps)) => reps,
        Some(_) => return Err("'reps' is not a list".to_string()),
        None => return Err("missing 'reps' field".to_string()),
    };

    let mut session = SessionReps::default();

    for (index, rep) in reps.iter().enumerate() {
        if !rep.is_object() {
            session.warnings.push(IngestWarning {
                file: source_file.to_string(),
                reason: format!("rep at index {} is not an object", index),
            });
            continue;
        }

        match serde_json::from_value::<RepRecord>(rep.clone()) {
            Ok(mut record) => {
                record.source_file = source_file.to_string();
                session.records.push(record);
            }
            Err(e) => session.warnings.push(IngestWarning {
                file: source_file.to_string(),
                reason: format!("rep at index {}: {}", index, e),
            }),
        }
    }

    for warning in &session.warnings {
        tracing::warn!("{}: {}", warning.file, warning.reason);
    }

    Ok(session)
}
