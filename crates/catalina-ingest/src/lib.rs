//! Catalina Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch ingest of daily CSV deliveries into a partitioned, queryable table.
//!
//! # Stages
//!
//! - **Window**: select the source keys whose date falls in the trailing window
//! - **Cleaner**: filter to the category, split by row date, validate, stage
//! - **Publisher**: move staged files into `day=<YYYYMMDD>/` partitions
//! - **Catalog**: ensure database and table, register missing partitions
//!
//! [`pipeline::Pipeline`] ties the stages together for one run.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use catalina_common::S3Location;
//! use catalina_ingest::catalog::TableTemplate;
//! use catalina_ingest::query::MemoryCatalog;
//! use catalina_ingest::storage::MemoryStore;
//! use catalina_ingest::validation::RuleSet;
//! use catalina_ingest::{IngestConfig, Pipeline, RunContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::new(
//!         "TCL",
//!         "tcl_data",
//!         S3Location::parse("s3://tv-type-raw")?,
//!         S3Location::parse("s3://tv-type-test")?,
//!     )?;
//!     let ctx = RunContext::new(&config.tv_type, &config.table);
//!
//!     let mut pipeline = Pipeline::new(
//!         config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryCatalog::new()),
//!         RuleSet::builtin()?,
//!         TableTemplate::builtin(),
//!     )?;
//!     let report = pipeline.run(&ctx).await?;
//!     println!("{}", report.summary);
//!     Ok(())
//! }
//! ```

pub mod aws;
pub mod batch;
pub mod catalog;
pub mod cleaner;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod query;
pub mod storage;
pub mod validation;
pub mod window;

pub use config::{IngestArgs, IngestConfig};
pub use context::RunContext;
pub use error::{IngestError, KeyFailure, Result};
pub use pipeline::{KeyOutcome, Pipeline, RunReport, RunState, RunSummary};
