//! Error types for the ingest pipeline
//!
//! [`IngestError`] covers everything that can abort a step of the run.
//! [`KeyFailure`] is the narrower per-key error: it is recorded in the run
//! summary and never stops the other keys.

use catalina_common::{CatalinaError, LocationError};
use thiserror::Error;

use crate::pipeline::RunState;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Common(#[from] CatalinaError),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error on {location}: {message}")]
    Storage { location: String, message: String },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Query '{name}' failed: {reason}")]
    QueryFailed { name: String, reason: String },

    #[error("Query '{name}' was cancelled")]
    QueryCancelled { name: String },

    #[error("Query '{name}' did not finish within {timeout_secs}s")]
    QueryTimeout { name: String, timeout_secs: u64 },

    #[error("Query engine error: {0}")]
    QueryEngine(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing column '{0}'")]
    MissingColumn(String),

    #[error("Invalid date '{value}' in column '{column}'")]
    InvalidDate { column: String, value: String },

    #[error("Rule error: {0}")]
    Rules(String),

    #[error("Table template error: {0}")]
    Template(String),

    #[error("Illegal state transition {from} -> {to}")]
    Transition { from: RunState, to: RunState },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(location: impl ToString, message: impl ToString) -> Self {
        Self::Storage {
            location: location.to_string(),
            message: message.to_string(),
        }
    }

    pub fn rules(msg: impl Into<String>) -> Self {
        Self::Rules(msg.into())
    }

    pub fn query_engine(msg: impl ToString) -> Self {
        Self::QueryEngine(msg.to_string())
    }
}

/// Why a single source key did not make it into the destination layout
#[derive(Error, Debug)]
pub enum KeyFailure {
    #[error("unexpected file extension on '{key}', expected {expected}")]
    UnexpectedExtension { key: String, expected: &'static str },

    #[error("failed to load '{key}': {source}")]
    Load {
        key: String,
        #[source]
        source: IngestError,
    },

    #[error("failed to clean '{key}': {source}")]
    Clean {
        key: String,
        #[source]
        source: IngestError,
    },

    #[error("failed to publish '{key}': {source}")]
    Publish {
        key: String,
        #[source]
        source: IngestError,
    },
}

impl KeyFailure {
    /// Short machine-friendly name for logs and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            KeyFailure::UnexpectedExtension { .. } => "unexpected_extension",
            KeyFailure::Load { .. } => "load",
            KeyFailure::Clean { .. } => "clean",
            KeyFailure::Publish { .. } => "publish",
        }
    }
}
