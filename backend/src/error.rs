use std::path::PathBuf;

use thiserror::Error;

/// Failures of the storage layer (time-series reads, alert sink, loaders).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store read failed: {0}")]
    Store(#[source] StoreError),

    /// The alert set of a run was not durably recorded. Retry the same batch.
    #[error("alert sink write failed: {0}")]
    SinkWrite(#[source] StoreError),

    #[error("ingest of {path} failed: {reason}")]
    Ingest { path: PathBuf, reason: String },

    #[error("report export failed: {0}")]
    Report(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
