//! Ingest run orchestration
//!
//! A run walks a fixed sequence of states:
//!
//! ```text
//! Idle -> Setup -> Selecting -> Processing -> Reconciling -> Done
//!            \          \                          \
//!             +----------+---------> Failed <-------+
//! ```
//!
//! Selecting may go straight to Done when the window holds no keys. Keys are
//! processed concurrently and a key that fails is recorded and skipped; only
//! setup, listing and reconciliation errors fail the run.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{CatalogReconciler, TableTemplate};
use crate::cleaner::{Cleaner, CleanerSettings};
use crate::config::IngestConfig;
use crate::context::RunContext;
use crate::error::{IngestError, KeyFailure, Result};
use crate::publisher::Publisher;
use crate::query::{QueryEngine, QueryRunner};
use crate::storage::ObjectStore;
use crate::validation::{RuleSet, Scrubber};
use crate::window::{select_keys, SourceKey, TimeWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Setup,
    Selecting,
    Processing,
    Reconciling,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Setup => "setup",
            RunState::Selecting => "selecting",
            RunState::Processing => "processing",
            RunState::Reconciling => "reconciling",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Setup)
                | (Setup, Selecting)
                | (Setup, Failed)
                | (Selecting, Processing)
                | (Selecting, Done)
                | (Selecting, Failed)
                | (Processing, Reconciling)
                | (Reconciling, Done)
                | (Reconciling, Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one source key
#[derive(Debug)]
pub enum KeyOutcome {
    Published { key: String, partitions: Vec<String> },
    Skipped { key: String, reason: String },
    Failed { key: String, failure: KeyFailure },
}

impl KeyOutcome {
    pub fn key(&self) -> &str {
        match self {
            KeyOutcome::Published { key, .. }
            | KeyOutcome::Skipped { key, .. }
            | KeyOutcome::Failed { key, .. } => key,
        }
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub candidates: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub partitions_added: usize,
    pub duration_seconds: f64,
}

impl RunSummary {
    /// Keys were selected but none made it through.
    pub fn nothing_succeeded(&self) -> bool {
        self.candidates > 0 && self.processed == 0 && self.skipped == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: {} candidates, {} processed, {} skipped, {} failed, {} partitions added in {:.1}s",
            self.run_id,
            self.candidates,
            self.processed,
            self.skipped,
            self.failed,
            self.partitions_added,
            self.duration_seconds
        )
    }
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Per-key outcomes ordered by key
    pub outcomes: Vec<KeyOutcome>,
    /// Partition values registered by reconciliation
    pub partitions_added: Vec<String>,
    /// States visited, starting with [`RunState::Setup`]
    pub states: Vec<RunState>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = (&str, &KeyFailure)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            KeyOutcome::Failed { key, failure } => Some((key.as_str(), failure)),
            _ => None,
        })
    }
}

pub struct Pipeline {
    config: IngestConfig,
    store: Arc<dyn ObjectStore>,
    catalog: CatalogReconciler,
    publisher: Publisher,
    rules: RuleSet,
    cleaner_settings: CleanerSettings,
    state: RunState,
    states: Vec<RunState>,
}

impl Pipeline {
    pub fn new(
        config: IngestConfig,
        store: Arc<dyn ObjectStore>,
        engine: Arc<dyn QueryEngine>,
        rules: RuleSet,
        template: TableTemplate,
    ) -> Result<Self> {
        config.validate()?;

        let table_root = config.table_root()?;
        let runner = QueryRunner::new(
            engine,
            config.query_output.clone(),
            config.query_timeout,
            config.poll_interval,
        );
        let catalog = CatalogReconciler::new(
            runner,
            store.clone(),
            config.database.clone(),
            config.table.clone(),
            table_root.clone(),
            template,
        );
        let publisher = Publisher::new(store.clone(), table_root);
        let cleaner_settings = CleanerSettings {
            category: config.tv_type.clone(),
            category_column: config.category_column.clone(),
            date_column: config.date_column.clone(),
            staging_root: config.staging_category_root()?,
        };

        Ok(Self {
            config,
            store,
            catalog,
            publisher,
            rules,
            cleaner_settings,
            state: RunState::Idle,
            states: Vec::new(),
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn catalog(&self) -> &CatalogReconciler {
        &self.catalog
    }

    fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::Transition {
                from: self.state,
                to: next,
            });
        }
        info!(from = %self.state, to = %next, "Run state");
        self.state = next;
        self.states.push(next);
        Ok(())
    }

    /// Move to Failed when `result` is an error, then hand it back.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!(state = %self.state, error = %e, "Run failed");
            if let Err(transition) = self.transition(RunState::Failed) {
                warn!(error = %transition, "Could not mark run as failed");
            }
        }
        result
    }

    /// Execute one full run. A pipeline runs at most once.
    pub async fn run(&mut self, ctx: &RunContext) -> Result<RunReport> {
        let span = ctx.span().clone();
        self.run_inner(ctx).instrument(span).await
    }

    async fn run_inner(&mut self, ctx: &RunContext) -> Result<RunReport> {
        self.transition(RunState::Setup)?;
        let setup = self.catalog.setup().await;
        self.guard(setup)?;

        self.transition(RunState::Selecting)?;
        let window = TimeWindow::trailing(ctx.now(), self.config.horizon_days);
        let selected = select_keys(self.store.as_ref(), &self.config.source_root, &window).await;
        let keys = self.guard(selected)?;
        ctx.record_candidates(keys.len());

        if keys.is_empty() {
            info!(
                source = %self.config.source_root,
                window_start = %window.start(),
                window_end = %window.end(),
                "No keys to process"
            );
            self.transition(RunState::Done)?;
            return Ok(self.report(ctx, Vec::new(), Vec::new()));
        }

        self.transition(RunState::Processing)?;
        let outcomes = self.process(ctx, &keys).await;

        self.transition(RunState::Reconciling)?;
        let synced = self.catalog.sync_partitions().await;
        let partitions_added = self.guard(synced)?;
        ctx.record_partitions(partitions_added.len());

        self.transition(RunState::Done)?;
        let report = self.report(ctx, outcomes, partitions_added);
        info!(
            candidates = report.summary.candidates,
            processed = report.summary.processed,
            skipped = report.summary.skipped,
            failed = report.summary.failed,
            partitions_added = report.summary.partitions_added,
            duration_seconds = report.summary.duration_seconds,
            "Run finished"
        );
        Ok(report)
    }

    async fn process(&self, ctx: &RunContext, keys: &[SourceKey]) -> Vec<KeyOutcome> {
        let scrubber = Scrubber::new(self.rules.clone(), ctx.now().date_naive());
        let cleaner = Cleaner::new(self.store.clone(), scrubber, self.cleaner_settings.clone());
        let publisher = &self.publisher;
        let skip_existing = self.config.skip_existing;
        let total = keys.len();

        info!(keys = total, concurrency = self.config.concurrency, "Processing keys");

        let mut outcomes: Vec<KeyOutcome> = stream::iter(keys.iter().enumerate())
            .map(|(index, key)| {
                let cleaner = &cleaner;
                async move {
                    let outcome = process_key(cleaner, publisher, key, skip_existing).await;
                    log_outcome(&outcome, index + 1, total);
                    ctx.record_outcome(&outcome);
                    outcome
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        outcomes.sort_by(|a, b| a.key().cmp(b.key()));
        outcomes
    }

    fn report(
        &self,
        ctx: &RunContext,
        outcomes: Vec<KeyOutcome>,
        partitions_added: Vec<String>,
    ) -> RunReport {
        RunReport {
            summary: ctx.summary(),
            outcomes,
            partitions_added,
            states: self.states.clone(),
        }
    }
}

async fn process_key(
    cleaner: &Cleaner,
    publisher: &Publisher,
    source: &SourceKey,
    skip_existing: bool,
) -> KeyOutcome {
    let key = source.key.clone();

    let prepared = match cleaner.prepare(source).await {
        Ok(prepared) => prepared,
        Err(failure) => return KeyOutcome::Failed { key, failure },
    };

    if prepared.is_empty() {
        return KeyOutcome::Skipped {
            key,
            reason: "no rows for category".to_string(),
        };
    }

    if skip_existing {
        match publisher.already_published(&prepared).await {
            Ok(true) => {
                return KeyOutcome::Skipped {
                    key,
                    reason: "already published".to_string(),
                }
            }
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "Could not check for published files"),
        }
    }

    let cleaned = match cleaner.stage(prepared).await {
        Ok(cleaned) => cleaned,
        Err(failure) => return KeyOutcome::Failed { key, failure },
    };

    match publisher.publish(&cleaned).await {
        Ok(partitions) => KeyOutcome::Published { key, partitions },
        Err(failure) => KeyOutcome::Failed { key, failure },
    }
}

fn log_outcome(outcome: &KeyOutcome, position: usize, total: usize) {
    match outcome {
        KeyOutcome::Published { key, partitions } => info!(
            key = %key,
            partitions = partitions.len(),
            position,
            total,
            "Key published"
        ),
        KeyOutcome::Skipped { key, reason } => info!(
            key = %key,
            reason = %reason,
            position,
            total,
            "Key skipped"
        ),
        KeyOutcome::Failed { key, failure } => warn!(
            key = %key,
            kind = failure.kind(),
            error = %failure,
            position,
            total,
            "Key failed"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::query::MemoryCatalog;
    use crate::storage::MemoryStore;
    use catalina_common::S3Location;
    use chrono::{TimeZone, Utc};

    fn loc(s: &str) -> S3Location {
        S3Location::parse(s).unwrap()
    }

    fn pipeline(store: Arc<MemoryStore>, engine: Arc<MemoryCatalog>) -> Pipeline {
        let config = IngestConfig::new(
            "TCL",
            "tcl_data",
            loc("s3://tv-type-raw"),
            loc("s3://tv-type-test"),
        )
        .unwrap();
        Pipeline::new(
            config,
            store,
            engine,
            RuleSet::builtin().unwrap(),
            TableTemplate::builtin(),
        )
        .unwrap()
    }

    fn ctx() -> RunContext {
        RunContext::at(
            Utc.with_ymd_and_hms(2022, 5, 20, 6, 0, 0).unwrap(),
            "TCL",
            "tcl_data",
        )
    }

    #[test]
    fn test_transitions() {
        use RunState::*;
        assert!(Idle.can_transition_to(Setup));
        assert!(Selecting.can_transition_to(Done));
        assert!(Reconciling.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Processing));
        assert!(!Done.can_transition_to(Setup));
        assert!(!Failed.can_transition_to(Setup));
        assert!(Done.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_nothing_succeeded() {
        let mut summary = ctx().summary();
        assert!(!summary.nothing_succeeded());
        summary.candidates = 2;
        summary.failed = 2;
        assert!(summary.nothing_succeeded());
        summary.skipped = 1;
        assert!(!summary.nothing_succeeded());
    }

    #[tokio::test]
    async fn test_empty_window_finishes_without_reconciling() {
        let engine = Arc::new(MemoryCatalog::new());
        let mut pipeline = pipeline(Arc::new(MemoryStore::new()), engine.clone());

        let report = pipeline.run(&ctx()).await.unwrap();
        assert_eq!(
            report.states,
            vec![RunState::Setup, RunState::Selecting, RunState::Done]
        );
        assert_eq!(report.summary.candidates, 0);
        assert!(engine.statements_matching("SHOW PARTITIONS").is_empty());
    }

    #[tokio::test]
    async fn test_a_pipeline_runs_once() {
        let mut pipeline = pipeline(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCatalog::new()),
        );
        pipeline.run(&ctx()).await.unwrap();

        assert!(matches!(
            pipeline.run(&ctx()).await,
            Err(IngestError::Transition {
                from: RunState::Done,
                to: RunState::Setup
            })
        ));
    }

    #[tokio::test]
    async fn test_setup_failure_fails_run() {
        let engine = Arc::new(MemoryCatalog::new());
        engine.fail_on("CREATE DATABASE", "access denied");
        let mut pipeline = pipeline(Arc::new(MemoryStore::new()), engine);

        assert!(pipeline.run(&ctx()).await.is_err());
        assert_eq!(pipeline.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_run() {
        let store = Arc::new(MemoryStore::new());
        store.fail_listing("slow down");
        let mut pipeline = pipeline(store, Arc::new(MemoryCatalog::new()));

        assert!(matches!(
            pipeline.run(&ctx()).await,
            Err(IngestError::Storage { .. })
        ));
        assert_eq!(pipeline.state(), RunState::Failed);
    }
}
