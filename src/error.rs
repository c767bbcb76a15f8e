// Takeout Migrate Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("External tool not found: {0}")]
    ToolMissing(String),

    #[error("State lock held by {0}; another run is using this working directory")]
    LockHeld(String),

    #[error("State corrupted: {0} (run `takeout-migrate reset` to start over)")]
    StateCorruption(String),

    #[error("Archive error in {archive}: {reason}")]
    Archive { archive: String, reason: String },

    #[error("ExifTool error: {0}")]
    Embed(String),

    #[error("Import error: {0}")]
    Import(String),

    #[error("Destination application unavailable: {0}")]
    AppUnavailable(String),

    #[error("Hash error: {0}")]
    Hash(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl MigrateError {
    /// Errors that abort the whole run rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Configuration(_)
                | MigrateError::ConfigParse(_)
                | MigrateError::ToolMissing(_)
                | MigrateError::LockHeld(_)
                | MigrateError::StateCorruption(_)
        )
    }
}

impl From<anyhow::Error> for MigrateError {
    fn from(err: anyhow::Error) -> Self {
        MigrateError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;

/// Kind of a per-unit error kept in state and the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Archive,
    Unmatched,
    AmbiguousMatch,
    SidecarParse,
    Embed,
    Import,
    AppUnavailable,
    Io,
}

/// A per-unit failure that was recorded and did not stop the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub unit: String,
    pub message: String,
}

impl RecordedError {
    pub fn new(kind: ErrorKind, unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            unit: unit.into(),
            message: message.into(),
        }
    }
}
