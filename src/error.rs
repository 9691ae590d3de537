// src/error.rs

use reqwest::Error as ReqwestError;
use serde_json::Error as SerdeError;
use std::io;
use thiserror::Error;

/// Custom error types for the application
#[derive(Error, Debug)]
pub enum AppError {
    /// No newsboat queue file in any of the searched locations
    #[error("Failed to locate newsboat queue file")]
    QueueNotFound,

    /// A queue line that could not be parsed
    #[error("Malformed queue: syntax error on line {line}")]
    QueueSyntax { line: usize },

    /// A cache.db line that could not be parsed
    #[error("Syntax error in cache.db: line {line}: {comment}")]
    LedgerSyntax { line: usize, comment: String },

    /// Ledger lookup or prune of a path with no entry
    #[error("no such entry in cache.db")]
    NoEntry,

    /// Ledger entry has been tombstoned
    #[error("entry has been marked for pruning")]
    Pruned,

    /// Ledger insert of a path that already has an entry
    #[error("entry already exists")]
    EntryExists,

    /// Attempt to insert a pruned (negative) timestamp
    #[error("invalid timestamp ({0} < 0): cannot insert pruned item")]
    InvalidTimestamp(i64),

    /// The destination directory of a download could not be created
    #[error("Failed to create download directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Error during download process
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Error talking to the media player
    #[error("Player error: {0}")]
    PlayerError(String),

    /// The player mainloop is no longer running
    #[error("Player mainloop has terminated")]
    PlayerGone,

    /// I/O related errors
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    HttpError(#[from] ReqwestError),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] SerdeError),

    /// General application errors
    #[error("Application error: {0}")]
    General(String),
}

/// Convert a string error to AppError::General
impl From<String> for AppError {
    fn from(error: String) -> Self {
        AppError::General(error)
    }
}

/// Convert a &str error to AppError::General
impl From<&str> for AppError {
    fn from(error: &str) -> Self {
        AppError::General(error.to_string())
    }
}
