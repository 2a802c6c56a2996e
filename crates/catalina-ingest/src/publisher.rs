//! Publishing staged files into the table layout
//!
//! Every source key owns its destination objects, so deliveries sharing a
//! file name never overwrite each other:
//!
//! ```text
//! <table_root>/day=D/<file>                 key D/<file>, rows dated D
//! <table_root>/day=D/<delivery>/<key path>  any other key or row date
//! ```
//!
//! The staged copy is removed once the final object exists.

use std::sync::Arc;

use catalina_common::S3Location;
use tracing::{debug, info, warn};

use crate::cleaner::{CleanedKey, PreparedKey};
use crate::error::{KeyFailure, Result};
use crate::storage::ObjectStore;
use crate::window::SourceKey;

/// Name of the table's partition column
pub const PARTITION_KEY: &str = "day";

pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    table_root: S3Location,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, table_root: S3Location) -> Self {
        Self { store, table_root }
    }

    pub fn table_root(&self) -> &S3Location {
        &self.table_root
    }

    /// `<table_root>/day=<value>/`
    pub fn partition_location(&self, value: &str) -> Result<S3Location> {
        Ok(self.table_root.join([partition_segment(value)])?)
    }

    /// Where the rows of `source` dated `value` are published.
    ///
    /// A plain `<delivery>/<file>` key publishes its own day as
    /// `day=<value>/<file>`. Everything else goes one level down, under the
    /// delivery date and the key path below it. Objects directly in a
    /// partition and objects nested below it cannot collide, and within
    /// either group the path names the key.
    pub fn destination(&self, value: &str, source: &SourceKey) -> Result<S3Location> {
        let segment = partition_segment(value);
        let delivered = source.date_segment();
        let below = source
            .key
            .split_once('/')
            .map_or(source.filename.as_str(), |(_, rest)| rest);

        if value == delivered && !below.contains('/') {
            Ok(self.table_root.join([segment.as_str(), below])?)
        } else {
            Ok(self
                .table_root
                .join([segment.as_str(), delivered.as_str(), below])?)
        }
    }

    /// Whether every object `publish` would write for `prepared` already
    /// exists.
    pub async fn already_published(&self, prepared: &PreparedKey) -> Result<bool> {
        if prepared.is_empty() {
            return Ok(false);
        }
        for subset in &prepared.dates {
            let destination = self.destination(&subset.date, &prepared.source)?;
            if !self.store.exists(&destination).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Copy every staged subset of `cleaned` to its partition and return the
    /// partition values written.
    pub async fn publish(&self, cleaned: &CleanedKey) -> std::result::Result<Vec<String>, KeyFailure> {
        let key = &cleaned.source.key;
        let failure = |e| KeyFailure::Publish {
            key: key.clone(),
            source: e,
        };

        let mut partitions = Vec::with_capacity(cleaned.dates.len());
        for staged in &cleaned.dates {
            let destination = self
                .destination(&staged.date, &cleaned.source)
                .map_err(failure)?;

            self.store
                .copy(&staged.location, &destination)
                .await
                .map_err(failure)?;

            debug!(key = %key, from = %staged.location, to = %destination, "Published subset");

            if let Err(e) = self.store.delete(&staged.location).await {
                warn!(
                    key = %key,
                    staged = %staged.location,
                    error = %e,
                    "Failed to remove staged file"
                );
            }

            partitions.push(staged.date.clone());
        }

        info!(key = %key, partitions = ?partitions, "Published key");
        Ok(partitions)
    }
}

/// `day=<value>`
pub fn partition_segment(value: &str) -> String {
    format!("{PARTITION_KEY}={value}")
}

/// Inverse of [`partition_segment`], tolerating a trailing `/`.
pub fn parse_partition_segment(segment: &str) -> Option<&str> {
    let value = segment
        .trim_end_matches('/')
        .strip_prefix(PARTITION_KEY)?
        .strip_prefix('=')?;
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchStats};
    use crate::cleaner::{DateBatch, StagedDate};
    use crate::storage::memory::{MemoryStore, StoreOp};
    use crate::validation::ValidationReport;

    fn loc(s: &str) -> S3Location {
        S3Location::parse(s).unwrap()
    }

    fn stats() -> BatchStats {
        BatchStats {
            rows: 1,
            unique_rows: 1,
            min_date: None,
            max_date: None,
        }
    }

    fn staged(date: &str, location: &str) -> StagedDate {
        StagedDate {
            date: date.to_string(),
            location: loc(location),
            rows: 1,
            stats: stats(),
        }
    }

    fn source(key: &str) -> SourceKey {
        SourceKey::parse(&loc("s3://tv-type-raw/"), key).unwrap()
    }

    fn cleaned(dates: Vec<StagedDate>) -> CleanedKey {
        CleanedKey {
            source: source("20220512/TV_Final.csv"),
            rows_loaded: 1,
            report: ValidationReport::default(),
            dates,
        }
    }

    fn prepared(key: &str, dates: &[&str]) -> PreparedKey {
        let dates = dates
            .iter()
            .map(|date| DateBatch {
                date: date.to_string(),
                batch: Batch::from_csv(format!("Brand,date\nTCL,{date}\n").as_bytes()).unwrap(),
                stats: stats(),
            })
            .collect();
        PreparedKey {
            source: source(key),
            rows_loaded: 1,
            report: ValidationReport::default(),
            dates,
        }
    }

    fn publisher(store: Arc<MemoryStore>) -> Publisher {
        Publisher::new(store, loc("s3://tv-type-test/TCL-data"))
    }

    #[test]
    fn test_partition_segments() {
        assert_eq!(partition_segment("20220512"), "day=20220512");
        assert_eq!(parse_partition_segment("day=20220512/"), Some("20220512"));
        assert_eq!(parse_partition_segment("day=20220512"), Some("20220512"));
        assert_eq!(parse_partition_segment("day=/"), None);
        assert_eq!(parse_partition_segment("month=05/"), None);
        assert_eq!(parse_partition_segment("dayx=1/"), None);
    }

    #[test]
    fn test_destinations_are_unique_per_key() {
        let publisher = publisher(Arc::new(MemoryStore::new()));
        let dest = |date: &str, key: &str| {
            publisher
                .destination(date, &source(key))
                .unwrap()
                .to_string()
        };

        assert_eq!(
            dest("20220512", "20220512/TV_Final.csv"),
            "s3://tv-type-test/TCL-data/day=20220512/TV_Final.csv"
        );
        assert_eq!(
            dest("20220512", "20220513/TV_Final.csv"),
            "s3://tv-type-test/TCL-data/day=20220512/20220513/TV_Final.csv"
        );
        assert_eq!(
            dest("20220512", "20220512/extra/TV_Final.csv"),
            "s3://tv-type-test/TCL-data/day=20220512/20220512/extra/TV_Final.csv"
        );
        assert_ne!(
            dest("20220512", "20220512/20220513/TV_Final.csv"),
            dest("20220512", "20220513/TV_Final.csv")
        );
    }

    #[tokio::test]
    async fn test_publish_moves_staged_files() {
        let store = Arc::new(MemoryStore::new());
        let a = "s3://tv-type-intermediary/TCL-data/20220511/TV_Final/TCL.csv";
        let b = "s3://tv-type-intermediary/TCL-data/20220512/TV_Final/TCL.csv";
        store.insert(&loc(a), "a");
        store.insert(&loc(b), "b");

        let partitions = publisher(store.clone())
            .publish(&cleaned(vec![staged("20220511", a), staged("20220512", b)]))
            .await
            .unwrap();

        assert_eq!(partitions, vec!["20220511", "20220512"]);
        assert_eq!(
            store.object(&loc("s3://tv-type-test/TCL-data/day=20220512/TV_Final.csv")),
            Some(b"b".to_vec())
        );
        assert!(store.keys("tv-type-intermediary").is_empty());
    }

    #[tokio::test]
    async fn test_copy_failure_is_a_publish_failure() {
        let store = Arc::new(MemoryStore::new());
        let a = "s3://tv-type-intermediary/TCL-data/20220512/TV_Final/TCL.csv";
        store.insert(&loc(a), "a");
        store.fail_on(StoreOp::Copy, &loc(a), "throttled");

        let failure = publisher(store.clone())
            .publish(&cleaned(vec![staged("20220512", a)]))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "publish");
        assert!(store.object(&loc(a)).is_some());
    }

    #[tokio::test]
    async fn test_delete_failure_is_only_a_warning() {
        let store = Arc::new(MemoryStore::new());
        let a = "s3://tv-type-intermediary/TCL-data/20220512/TV_Final/TCL.csv";
        store.insert(&loc(a), "a");
        store.fail_on(StoreOp::Delete, &loc(a), "denied");

        let partitions = publisher(store.clone())
            .publish(&cleaned(vec![staged("20220512", a)]))
            .await
            .unwrap();
        assert_eq!(partitions, vec!["20220512"]);
    }

    #[tokio::test]
    async fn test_already_published_checks_every_destination() {
        let store = Arc::new(MemoryStore::new());
        let publisher = publisher(store.clone());
        let key = prepared("20220513/TV_Final.csv", &["20220512", "20220513"]);

        assert!(!publisher.already_published(&key).await.unwrap());

        store.insert(&loc("s3://tv-type-test/TCL-data/day=20220513/TV_Final.csv"), "x");
        assert!(!publisher.already_published(&key).await.unwrap());

        store.insert(
            &loc("s3://tv-type-test/TCL-data/day=20220512/20220513/TV_Final.csv"),
            "x",
        );
        assert!(publisher.already_published(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_delivery_does_not_count_as_published() {
        let store = Arc::new(MemoryStore::new());
        let publisher = publisher(store.clone());
        store.insert(
            &loc("s3://tv-type-test/TCL-data/day=20220512/20220513/TV_Final.csv"),
            "x",
        );

        let key = prepared("20220512/TV_Final.csv", &["20220512"]);
        assert!(!publisher.already_published(&key).await.unwrap());
        assert!(!publisher
            .already_published(&prepared("20220512/TV_Final.csv", &[]))
            .await
            .unwrap());
    }
}
