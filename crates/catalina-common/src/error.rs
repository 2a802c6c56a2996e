//! Error types for Catalina

use thiserror::Error;

/// Result type alias for Catalina operations
pub type Result<T> = std::result::Result<T, CatalinaError>;

/// Main error type shared by the workspace crates
#[derive(Error, Debug)]
pub enum CatalinaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CatalinaError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Reasons an object store location is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("S3 locations cannot have a port: '{0}'")]
    Port(String),

    #[error("S3 locations cannot have a username: '{0}'")]
    Username(String),

    #[error("S3 locations cannot have a password (or username): '{0}'")]
    Password(String),

    #[error("S3 locations must have a scheme or not start with a '/': '{0}'")]
    LeadingSlash(String),

    #[error("S3 location is missing a bucket: '{0}'")]
    MissingBucket(String),

    #[error("S3 locations must be s3://, http:// or https://: '{0}'")]
    UnsupportedScheme(String),

    #[error("S3 HTTP locations must look like http[s]://s3*.amazonaws.com/bucket-name/: '{0}'")]
    InvalidEndpoint(String),

    #[error("S3 locations cannot contain '//' unless double slashes are allowed: '{0}'")]
    DoubleSlash(String),
}
