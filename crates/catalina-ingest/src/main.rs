//! Catalina Ingest - scheduled CSV ingest into a partitioned table

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use catalina_common::logging::{init_logging, LogConfig, LogLevel};
use catalina_ingest::aws::load_sdk_config;
use catalina_ingest::catalog::TableTemplate;
use catalina_ingest::query::AthenaEngine;
use catalina_ingest::storage::S3Store;
use catalina_ingest::validation::RuleSet;
use catalina_ingest::{IngestArgs, IngestConfig, Pipeline, RunContext};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "catalina-ingest")]
#[command(author, version, about = "Ingest daily CSV deliveries into a partitioned table")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest the trailing window and register new partitions
    Run(IngestArgs),

    /// Create the database and table if missing
    Setup(IngestArgs),

    /// Drop the table, leaving its data in place
    DropTable(IngestArgs),

    /// Drop table and database, then recreate both
    Teardown(IngestArgs),
}

#[tokio::main]
async fn main() {
    // Settings fall back to the environment, so load .env before parsing
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("catalina-ingest")
        .build();

    // Environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring logging environment: {e:#}");
            log_config
        }
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    match execute(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}

/// Run a subcommand and return the process exit code.
async fn execute(command: Command) -> Result<i32> {
    let (args, action) = match command {
        Command::Run(args) => (args, Action::Run),
        Command::Setup(args) => (args, Action::Setup),
        Command::DropTable(args) => (args, Action::DropTable),
        Command::Teardown(args) => (args, Action::Teardown),
    };

    let config = IngestConfig::try_from(args).context("Invalid configuration")?;
    let rules = match &config.rules_path {
        Some(path) => RuleSet::load(path)
            .with_context(|| format!("Failed to load rules from {}", path.display()))?,
        None => RuleSet::builtin()?,
    };
    let template = match &config.table_template_path {
        Some(path) => TableTemplate::load(path)
            .with_context(|| format!("Failed to load table template from {}", path.display()))?,
        None => TableTemplate::builtin(),
    };

    let sdk_config = load_sdk_config(&config.region, config.aws_profile.as_deref()).await;
    let store = Arc::new(S3Store::new(&sdk_config));
    let engine = Arc::new(AthenaEngine::new(&sdk_config));

    let ctx = RunContext::new(&config.tv_type, &config.table);
    let fail_if_nothing_succeeds = config.fail_if_nothing_succeeds;
    let mut pipeline = Pipeline::new(config, store, engine, rules, template)?;

    match action {
        Action::Setup => {
            pipeline.catalog().setup().await?;
            Ok(0)
        }
        Action::DropTable => {
            pipeline.catalog().drop_table().await?;
            Ok(0)
        }
        Action::Teardown => {
            pipeline.catalog().teardown().await?;
            Ok(0)
        }
        Action::Run => {
            info!(run_id = %ctx.run_id(), "Starting ingest run");
            let report = pipeline.run(&ctx).await?;

            for (key, failure) in report.failures() {
                warn!(key, kind = failure.kind(), error = %failure, "Key not ingested");
            }
            println!("{}", report.summary);

            if fail_if_nothing_succeeds && report.summary.nothing_succeeded() {
                error!(
                    candidates = report.summary.candidates,
                    "No key was ingested successfully"
                );
                return Ok(2);
            }
            Ok(0)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Run,
    Setup,
    DropTable,
    Teardown,
}
