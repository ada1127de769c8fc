//! Errors shared by the streaming passes, the merge stage and publishing.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("column '{column}' declared but missing from header of {source_label}")]
    SchemaMismatch {
        column: String,
        source_label: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "zip-archives")]
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("row for entity '{entity_id}' has {found} values, table has {expected} columns")]
    RowWidth {
        entity_id: String,
        found: usize,
        expected: usize,
    },
    #[error("worker pool error: {0}")]
    WorkerPool(String),
    #[error("run cancelled before output was published")]
    Cancelled,
}
