//! Catalina Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Catalina ingest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Shared error type and result alias
//! - **Locations**: Object store addressing (`s3://bucket/key`)
//! - **Logging**: Tracing subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use catalina_common::{Result, S3Location};
//!
//! fn destination() -> Result<S3Location> {
//!     let root: S3Location = "s3://tv-type-test/".parse()?;
//!     Ok(root.join(["TCL-data", "day=20220512", "TV_Final.csv"])?)
//! }
//! ```

pub mod error;
pub mod location;
pub mod logging;

// Re-export commonly used types
pub use error::{CatalinaError, LocationError, Result};
pub use location::S3Location;
