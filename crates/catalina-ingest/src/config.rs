//! Run configuration
//!
//! Every setting is a CLI flag with an environment fallback. [`IngestArgs`]
//! is the raw clap surface, [`IngestConfig`] the validated form the pipeline
//! consumes. Validation runs before any I/O so a bad value fails the process
//! up front, naming the offending field.

use std::path::PathBuf;
use std::time::Duration;

use catalina_common::S3Location;
use clap::Args;

use crate::error::{IngestError, Result};

// ============================================================================
// Ingest Configuration Constants
// ============================================================================

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default catalog database.
pub const DEFAULT_DATABASE: &str = "ingest";

/// Default staging root for cleaned batches.
pub const DEFAULT_STAGING_BUCKET: &str = "s3://tv-type-intermediary";

/// Default scratch location for query results.
pub const DEFAULT_QUERY_OUTPUT: &str = "s3://temp-output-query/temp";

/// Default window length in days.
pub const DEFAULT_HORIZON_DAYS: u32 = 2500;

/// Default number of keys processed at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default time a single query may take, in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 300;

/// Default delay between query status polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default column holding the category value.
pub const DEFAULT_CATEGORY_COLUMN: &str = "Brand";

/// Default column holding the `YYYYMMDD` row date.
pub const DEFAULT_DATE_COLUMN: &str = "date";

/// Extension every source object must carry.
pub const SOURCE_EXTENSION: &str = ".csv";

/// Settings shared by all subcommands
#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// AWS region
    #[arg(long, env = "REGION", default_value = DEFAULT_REGION)]
    pub region: String,

    /// Category (tv type) value rows are filtered on
    #[arg(long = "tv-type", env = "TV")]
    pub tv_type: String,

    /// Catalog database
    #[arg(long, env = "DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: String,

    /// Catalog table
    #[arg(long, env = "TABLE")]
    pub table: String,

    /// Root location of the raw deliveries
    #[arg(long, env = "SOURCE_BUCKET")]
    pub source_bucket: String,

    /// Root location of the partitioned output
    #[arg(long, env = "DEST_BUCKET")]
    pub destination_bucket: String,

    /// Root location for cleaned batches awaiting publication
    #[arg(long, env = "STAGING_BUCKET", default_value = DEFAULT_STAGING_BUCKET)]
    pub staging_bucket: String,

    /// Scratch location for query results
    #[arg(long, env = "QUERY_OUTPUT", default_value = DEFAULT_QUERY_OUTPUT)]
    pub query_output: String,

    /// AWS credentials profile
    #[arg(long, env = "AWS_PROFILE")]
    pub aws_profile: Option<String>,

    /// Number of trailing days eligible for ingest
    #[arg(long, env = "HORIZON_DAYS", default_value_t = DEFAULT_HORIZON_DAYS)]
    pub horizon_days: u32,

    /// Number of source keys processed concurrently
    #[arg(long, env = "INGEST_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Maximum time to wait for a single query
    #[arg(long, env = "QUERY_TIMEOUT_SECS", default_value_t = DEFAULT_QUERY_TIMEOUT_SECS)]
    pub query_timeout_secs: u64,

    /// Delay between query status polls
    #[arg(long, env = "QUERY_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Rule document (JSON or YAML); the built-in rules are used when absent
    #[arg(long, env = "RULES_FILE")]
    pub rules: Option<PathBuf>,

    /// CREATE TABLE template with {table} and {location} placeholders
    #[arg(long, env = "CREATE_TABLE_SQL")]
    pub create_table_sql: Option<PathBuf>,

    /// Column holding the category value
    #[arg(long, env = "CATEGORY_COLUMN", default_value = DEFAULT_CATEGORY_COLUMN)]
    pub category_column: String,

    /// Column holding the row date
    #[arg(long, env = "DATE_COLUMN", default_value = DEFAULT_DATE_COLUMN)]
    pub date_column: String,

    /// Skip keys whose destination object already exists
    #[arg(long, env = "SKIP_EXISTING")]
    pub skip_existing: bool,

    /// Exit non-zero when candidates existed but none was published
    #[arg(long, env = "FAIL_IF_NOTHING_SUCCEEDS")]
    pub fail_if_nothing_succeeds: bool,
}

/// Validated configuration for one run
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub region: String,
    pub aws_profile: Option<String>,
    pub tv_type: String,
    pub database: String,
    pub table: String,
    pub source_root: S3Location,
    pub destination_root: S3Location,
    pub staging_root: S3Location,
    pub query_output: S3Location,
    pub horizon_days: u32,
    pub concurrency: usize,
    pub query_timeout: Duration,
    pub poll_interval: Duration,
    pub rules_path: Option<PathBuf>,
    pub table_template_path: Option<PathBuf>,
    pub category_column: String,
    pub date_column: String,
    pub skip_existing: bool,
    pub fail_if_nothing_succeeds: bool,
}

impl IngestConfig {
    /// Configuration with defaults for everything but the required settings.
    pub fn new(
        tv_type: impl Into<String>,
        table: impl Into<String>,
        source_root: S3Location,
        destination_root: S3Location,
    ) -> Result<Self> {
        let config = Self {
            region: DEFAULT_REGION.to_string(),
            aws_profile: None,
            tv_type: tv_type.into(),
            database: DEFAULT_DATABASE.to_string(),
            table: table.into(),
            source_root,
            destination_root,
            staging_root: S3Location::parse(DEFAULT_STAGING_BUCKET)?,
            query_output: S3Location::parse(DEFAULT_QUERY_OUTPUT)?,
            horizon_days: DEFAULT_HORIZON_DAYS,
            concurrency: DEFAULT_CONCURRENCY,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            rules_path: None,
            table_template_path: None,
            category_column: DEFAULT_CATEGORY_COLUMN.to_string(),
            date_column: DEFAULT_DATE_COLUMN.to_string(),
            skip_existing: false,
            fail_if_nothing_succeeds: false,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tv_type.trim().is_empty() {
            return Err(IngestError::config("tv_type cannot be empty"));
        }
        if self.tv_type.contains('/') {
            return Err(IngestError::config(format!(
                "tv_type '{}' cannot contain '/'",
                self.tv_type
            )));
        }

        check_identifier("database", &self.database)?;
        check_identifier("table", &self.table)?;

        if self.horizon_days == 0 {
            return Err(IngestError::config("horizon_days must be greater than 0"));
        }

        if self.concurrency == 0 {
            return Err(IngestError::config("concurrency must be greater than 0"));
        }

        if self.query_timeout.is_zero() {
            return Err(IngestError::config("query_timeout_secs must be greater than 0"));
        }

        if self.poll_interval.is_zero() {
            return Err(IngestError::config("poll_interval_ms must be greater than 0"));
        }

        if self.category_column.is_empty() {
            return Err(IngestError::config("category_column cannot be empty"));
        }

        if self.date_column.is_empty() {
            return Err(IngestError::config("date_column cannot be empty"));
        }

        if self.poll_interval > self.query_timeout {
            tracing::warn!(
                poll_interval_ms = self.poll_interval.as_millis() as u64,
                query_timeout_secs = self.query_timeout.as_secs(),
                "Poll interval exceeds query timeout - queries will be polled once"
            );
        }

        Ok(())
    }

    /// `<destination_root>/<tv_type>-data`, the table location.
    pub fn table_root(&self) -> Result<S3Location> {
        Ok(self.destination_root.join([self.category_dir()])?)
    }

    /// `<staging_root>/<tv_type>-data`
    pub fn staging_category_root(&self) -> Result<S3Location> {
        Ok(self.staging_root.join([self.category_dir()])?)
    }

    fn category_dir(&self) -> String {
        format!("{}-data", self.tv_type)
    }
}

impl TryFrom<IngestArgs> for IngestConfig {
    type Error = IngestError;

    fn try_from(args: IngestArgs) -> Result<Self> {
        let config = Self {
            region: args.region,
            aws_profile: args.aws_profile.filter(|p| !p.is_empty()),
            tv_type: args.tv_type,
            database: args.database,
            table: args.table,
            source_root: parse_location("source_bucket", &args.source_bucket)?,
            destination_root: parse_location("destination_bucket", &args.destination_bucket)?,
            staging_root: parse_location("staging_bucket", &args.staging_bucket)?,
            query_output: parse_location("query_output", &args.query_output)?,
            horizon_days: args.horizon_days,
            concurrency: args.concurrency,
            query_timeout: Duration::from_secs(args.query_timeout_secs),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            rules_path: args.rules,
            table_template_path: args.create_table_sql,
            category_column: args.category_column,
            date_column: args.date_column,
            skip_existing: args.skip_existing,
            fail_if_nothing_succeeds: args.fail_if_nothing_succeeds,
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_location(field: &str, value: &str) -> Result<S3Location> {
    S3Location::parse(value).map_err(|e| IngestError::config(format!("{field}: {e}")))
}

/// Database and table names end up inside SQL text unquoted.
fn check_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(IngestError::config(format!("{field} cannot be empty")));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(IngestError::config(format!(
            "{field} '{value}' may only contain letters, digits and '_'"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: IngestArgs,
    }

    fn parse(extra: &[&str]) -> std::result::Result<IngestConfig, IngestError> {
        let mut argv = vec![
            "catalina-ingest",
            "--tv-type",
            "TCL",
            "--table",
            "tcl_data_test",
            "--source-bucket",
            "s3://tv-type-raw/",
            "--destination-bucket",
            "s3://tv-type-test/",
        ];
        argv.extend_from_slice(extra);
        let cli = TestCli::try_parse_from(argv).unwrap();
        IngestConfig::try_from(cli.args)
    }

    #[test]
    fn test_required_flags() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.tv_type, "TCL");
        assert_eq!(config.table, "tcl_data_test");
        assert_eq!(config.source_root.to_string(), "s3://tv-type-raw/");
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.horizon_days, DEFAULT_HORIZON_DAYS);
        assert!(!config.skip_existing);
    }

    #[test]
    fn test_missing_required_flag() {
        let result = TestCli::try_parse_from(["catalina-ingest", "--tv-type", "TCL"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--concurrency",
            "8",
            "--horizon-days",
            "30",
            "--query-timeout-secs",
            "10",
            "--poll-interval-ms",
            "250",
            "--skip-existing",
        ])
        .unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.horizon_days, 30);
        assert_eq!(config.query_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.skip_existing);
    }

    #[test]
    fn test_invalid_values_name_the_field() {
        let err = parse(&["--concurrency", "0"]).unwrap_err();
        assert!(err.to_string().contains("concurrency"));

        let err = parse(&["--horizon-days", "0"]).unwrap_err();
        assert!(err.to_string().contains("horizon_days"));

        let err = parse(&["--query-timeout-secs", "0"]).unwrap_err();
        assert!(err.to_string().contains("query_timeout_secs"));

        let err = parse(&["--staging-bucket", "s3://bucket:9000/x"]).unwrap_err();
        assert!(err.to_string().contains("staging_bucket"));

        let err = parse(&["--database", "drop table;"]).unwrap_err();
        assert!(err.to_string().contains("database"));
    }

    #[test]
    fn test_derived_locations() {
        let config = parse(&[]).unwrap();
        assert_eq!(
            config.table_root().unwrap().to_string(),
            "s3://tv-type-test/TCL-data"
        );
        assert_eq!(
            config.staging_category_root().unwrap().to_string(),
            "s3://tv-type-intermediary/TCL-data"
        );
    }

    #[test]
    fn test_new_uses_defaults() {
        let config = IngestConfig::new(
            "TCL",
            "tcl_data",
            S3Location::parse("s3://raw/").unwrap(),
            S3Location::parse("s3://out/").unwrap(),
        )
        .unwrap();
        assert_eq!(config.database, DEFAULT_DATABASE);
        assert_eq!(config.query_output.to_string(), DEFAULT_QUERY_OUTPUT);

        assert!(IngestConfig::new(
            "",
            "tcl_data",
            S3Location::parse("s3://raw/").unwrap(),
            S3Location::parse("s3://out/").unwrap(),
        )
        .is_err());
    }
}
