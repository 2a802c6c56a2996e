//! Per-run context
//!
//! A [`RunContext`] is created at the start of every invocation and handed to
//! each stage. It pins the instant the window is computed from, owns the
//! tracing span every stage logs under, and keeps the run counters that end
//! up in the final summary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info_span, Span};
use uuid::Uuid;

use crate::pipeline::{KeyOutcome, RunSummary};

#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    now: DateTime<Utc>,
    started: Instant,
    span: Span,
    counters: RunCounters,
}

#[derive(Debug, Default)]
struct RunCounters {
    candidates: AtomicUsize,
    processed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    partitions_added: AtomicUsize,
}

impl RunContext {
    /// Context for a run starting now
    pub fn new(tv_type: &str, table: &str) -> Self {
        Self::at(Utc::now(), tv_type, table)
    }

    /// Context for a run whose window ends at `now`
    pub fn at(now: DateTime<Utc>, tv_type: &str, table: &str) -> Self {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, tv_type, table);

        Self {
            run_id,
            now,
            started: Instant::now(),
            span,
            counters: RunCounters::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn record_candidates(&self, count: usize) {
        self.counters.candidates.store(count, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &KeyOutcome) {
        let counter = match outcome {
            KeyOutcome::Published { .. } => &self.counters.processed,
            KeyOutcome::Skipped { .. } => &self.counters.skipped,
            KeyOutcome::Failed { .. } => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partitions(&self, count: usize) {
        self.counters.partitions_added.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot of the counters so far
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            candidates: self.counters.candidates.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            partitions_added: self.counters.partitions_added.load(Ordering::Relaxed),
            duration_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{IngestError, KeyFailure};

    #[test]
    fn test_counters() {
        let ctx = RunContext::new("TCL", "tcl_data");
        ctx.record_candidates(3);
        ctx.record_outcome(&KeyOutcome::Published {
            key: "20220512/a.csv".to_string(),
            partitions: vec!["20220512".to_string()],
        });
        ctx.record_outcome(&KeyOutcome::Skipped {
            key: "20220512/b.csv".to_string(),
            reason: "already published".to_string(),
        });
        ctx.record_outcome(&KeyOutcome::Failed {
            key: "20220512/c.csv".to_string(),
            failure: KeyFailure::Load {
                key: "20220512/c.csv".to_string(),
                source: IngestError::NotFound("c.csv".to_string()),
            },
        });
        ctx.record_partitions(2);

        let summary = ctx.summary();
        assert_eq!(summary.run_id, ctx.run_id());
        assert_eq!(summary.candidates, 3);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.partitions_added, 2);
    }

    #[test]
    fn test_runs_get_distinct_ids() {
        let a = RunContext::new("TCL", "tcl_data");
        let b = RunContext::new("TCL", "tcl_data");
        assert_ne!(a.run_id(), b.run_id());
    }
}
