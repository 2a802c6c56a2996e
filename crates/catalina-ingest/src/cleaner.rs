//! Row cleaning
//!
//! Turns one source object into one cleaned CSV per distinct row date.
//! [`Cleaner::prepare`] filters to the category, validates, splits by date
//! and logs statistics without writing anything; [`Cleaner::stage`] then
//! writes every subset to the staging area.

use std::sync::Arc;

use catalina_common::S3Location;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchStats};
use crate::config::SOURCE_EXTENSION;
use crate::error::{IngestError, KeyFailure, Result};
use crate::storage::ObjectStore;
use crate::validation::{Scrubber, ValidationReport};
use crate::window::{parse_key_date, SourceKey, KEY_DATE_FORMAT};

const CSV_CONTENT_TYPE: &str = "text/csv";

/// Column names and the category value rows are filtered on
#[derive(Debug, Clone)]
pub struct CleanerSettings {
    pub category: String,
    pub category_column: String,
    pub date_column: String,
    /// `<staging_root>/<category>-data`
    pub staging_root: S3Location,
}

/// Cleaned rows sharing one date, held in memory
#[derive(Debug, Clone)]
pub struct DateBatch {
    /// Raw `YYYYMMDD` value shared by every row of the subset
    pub date: String,
    pub batch: Batch,
    pub stats: BatchStats,
}

/// A source key cleaned in memory and not yet staged
#[derive(Debug, Clone)]
pub struct PreparedKey {
    pub source: SourceKey,
    /// Rows loaded before the category filter
    pub rows_loaded: usize,
    pub report: ValidationReport,
    /// Subsets ascending by date, never empty
    pub dates: Vec<DateBatch>,
}

impl PreparedKey {
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// One date's worth of cleaned rows, written to staging
#[derive(Debug, Clone)]
pub struct StagedDate {
    pub date: String,
    pub location: S3Location,
    pub rows: usize,
    pub stats: BatchStats,
}

/// Result of cleaning and staging one source key
#[derive(Debug, Clone)]
pub struct CleanedKey {
    pub source: SourceKey,
    pub rows_loaded: usize,
    pub report: ValidationReport,
    /// Staged subsets, ascending by date
    pub dates: Vec<StagedDate>,
}

pub struct Cleaner {
    store: Arc<dyn ObjectStore>,
    scrubber: Scrubber,
    settings: CleanerSettings,
}

impl Cleaner {
    pub fn new(store: Arc<dyn ObjectStore>, scrubber: Scrubber, settings: CleanerSettings) -> Self {
        Self {
            store,
            scrubber,
            settings,
        }
    }

    /// `<staging_root>/<row date>/<delivery date>/<source stem>/<category>.csv`
    pub fn staging_location(&self, date: &str, source: &SourceKey) -> Result<S3Location> {
        let stem = match source.filename.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => source.filename.as_str(),
        };
        let delivered = source.date_segment();
        let file = format!("{}.csv", self.settings.category);
        Ok(self
            .settings
            .staging_root
            .join([date, delivered.as_str(), stem, file.as_str()])?)
    }

    /// Prepare and stage `source`.
    pub async fn clean(&self, source: &SourceKey) -> std::result::Result<CleanedKey, KeyFailure> {
        let prepared = self.prepare(source).await?;
        self.stage(prepared).await
    }

    /// Load, filter, validate and split `source`. Nothing is written.
    pub async fn prepare(
        &self,
        source: &SourceKey,
    ) -> std::result::Result<PreparedKey, KeyFailure> {
        if !source
            .filename
            .to_ascii_lowercase()
            .ends_with(SOURCE_EXTENSION)
        {
            warn!(key = %source.key, "File should be in valid {} format", SOURCE_EXTENSION);
            return Err(KeyFailure::UnexpectedExtension {
                key: source.key.clone(),
                expected: SOURCE_EXTENSION,
            });
        }

        let load = |e: IngestError| KeyFailure::Load {
            key: source.key.clone(),
            source: e,
        };
        let data = self.store.get(&source.location).await.map_err(load)?;
        let batch = Batch::from_csv(&data).map_err(load)?;

        debug!(key = %source.key, rows = batch.len(), "Loaded source batch");

        self.prepare_batch(source, &batch)
            .map_err(|e| KeyFailure::Clean {
                key: source.key.clone(),
                source: e,
            })
    }

    fn prepare_batch(&self, source: &SourceKey, batch: &Batch) -> Result<PreparedKey> {
        let settings = &self.settings;
        let mut filtered = batch.filter_eq(&settings.category_column, &settings.category)?;

        // Rules may rewrite or drop dates, so split only once they have run
        let report = self.scrubber.run(&mut filtered);
        let groups = filtered.split_by(&settings.date_column)?;

        if let Some(date) = groups.keys().find(|date| parse_key_date(date).is_none()) {
            return Err(IngestError::InvalidDate {
                column: settings.date_column.clone(),
                value: date.clone(),
            });
        }

        let mut dates = Vec::with_capacity(groups.len());
        for (date, subset) in groups {
            let stats = subset.stats(&settings.date_column, KEY_DATE_FORMAT)?;
            info!(
                key = %source.key,
                date = %date,
                rows = stats.rows,
                unique_rows = stats.unique_rows,
                min_date = %format_stat_date(&stats.min_date),
                max_date = %format_stat_date(&stats.max_date),
                "Ingest clean"
            );
            dates.push(DateBatch {
                date,
                batch: subset,
                stats,
            });
        }

        for entry in report.entries() {
            info!(
                key = %source.key,
                field = %entry.field,
                rule = entry.rule,
                outcome = %entry.outcome,
                count = entry.count,
                samples = ?entry.samples,
                "Ingest scrubber report"
            );
        }

        Ok(PreparedKey {
            source: source.clone(),
            rows_loaded: batch.len(),
            report,
            dates,
        })
    }

    /// Write every prepared subset to staging. When a write fails, the
    /// subsets already staged for this key are removed again.
    pub async fn stage(
        &self,
        prepared: PreparedKey,
    ) -> std::result::Result<CleanedKey, KeyFailure> {
        let PreparedKey {
            source,
            rows_loaded,
            report,
            dates,
        } = prepared;

        let mut staged: Vec<StagedDate> = Vec::with_capacity(dates.len());
        for subset in dates {
            match self.stage_date(&source, &subset).await {
                Ok(location) => staged.push(StagedDate {
                    date: subset.date,
                    location,
                    rows: subset.batch.len(),
                    stats: subset.stats,
                }),
                Err(e) => {
                    self.discard(&source, &staged).await;
                    return Err(KeyFailure::Clean {
                        key: source.key.clone(),
                        source: e,
                    });
                }
            }
        }

        Ok(CleanedKey {
            source,
            rows_loaded,
            report,
            dates: staged,
        })
    }

    async fn stage_date(&self, source: &SourceKey, subset: &DateBatch) -> Result<S3Location> {
        let location = self.staging_location(&subset.date, source)?;
        self.store
            .put(&location, subset.batch.to_csv()?, Some(CSV_CONTENT_TYPE))
            .await?;

        debug!(key = %source.key, staged = %location, "Staged cleaned subset");
        Ok(location)
    }

    async fn discard(&self, source: &SourceKey, staged: &[StagedDate]) {
        for date in staged {
            if let Err(e) = self.store.delete(&date.location).await {
                warn!(
                    key = %source.key,
                    staged = %date.location,
                    error = %e,
                    "Failed to remove staged file"
                );
            }
        }
    }
}

fn format_stat_date(date: &Option<chrono::NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStore, StoreOp};
    use crate::validation::{DateRule, FallbackMode, Outcome, RangeCheck, Rule, RuleSet};
    use chrono::NaiveDate;

    const DELIVERY: &str = "\
Brand,Resolution,Size,Selling Price,Original Price,Operating System,Rating,date
TCL,Ultra HD LED,55,32999,45990,Android,4.3,20220512
Samsung,Full HD LED,43,28999,39900,Tizen,4.4,20220512
TCL,QLED,65,abc,104990,Android,4.5,20220512
TCL,HD LED,32,13999,21990,Android,4.1,20220511
";

    fn loc(s: &str) -> S3Location {
        S3Location::parse(s).unwrap()
    }

    fn cleaner(store: Arc<MemoryStore>) -> Cleaner {
        cleaner_with(store, RuleSet::builtin().unwrap())
    }

    fn cleaner_with(store: Arc<MemoryStore>, rules: RuleSet) -> Cleaner {
        let scrubber = Scrubber::new(rules, NaiveDate::from_ymd_opt(2022, 5, 20).unwrap());
        Cleaner::new(
            store,
            scrubber,
            CleanerSettings {
                category: "TCL".to_string(),
                category_column: "Brand".to_string(),
                date_column: "date".to_string(),
                staging_root: loc("s3://tv-type-intermediary/TCL-data"),
            },
        )
    }

    fn source(key: &str) -> SourceKey {
        SourceKey::parse(&loc("s3://tv-type-raw/"), key).unwrap()
    }

    #[tokio::test]
    async fn test_clean_splits_and_stages_by_date() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, DELIVERY);

        let cleaned = cleaner(store.clone()).clean(&key).await.unwrap();
        assert_eq!(cleaned.rows_loaded, 4);

        let dates: Vec<&str> = cleaned.dates.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["20220511", "20220512"]);

        let staged = &cleaned.dates[1];
        assert_eq!(
            staged.location.to_string(),
            "s3://tv-type-intermediary/TCL-data/20220512/20220512/TV_Final/TCL.csv"
        );
        assert_eq!(staged.rows, 2);
        assert_eq!(staged.stats.unique_rows, 2);

        // Fallback substitution and rounding are visible in the staged output
        let written = String::from_utf8(store.object(&staged.location).unwrap()).unwrap();
        let batch = Batch::from_csv(written.as_bytes()).unwrap();
        assert_eq!(batch.rows()[0][6], "4");
        assert_eq!(batch.rows()[1][3], "0");
        assert_eq!(cleaned.report.entry("Selling Price", Outcome::Replaced).unwrap().count, 1);
        assert_eq!(cleaned.report.entry("Rating", Outcome::Fixed).unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_prepare_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, DELIVERY);

        let prepared = cleaner(store.clone()).prepare(&key).await.unwrap();
        assert_eq!(prepared.dates.len(), 2);
        assert_eq!(prepared.dates[1].batch.len(), 2);
        assert!(store.keys("tv-type-intermediary").is_empty());
    }

    #[tokio::test]
    async fn test_rejects_other_extensions() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/notes.txt");
        store.insert(&key.location, DELIVERY);

        let failure = cleaner(store.clone()).clean(&key).await.unwrap_err();
        assert!(matches!(failure, KeyFailure::UnexpectedExtension { .. }));
        assert!(store.keys("tv-type-intermediary").is_empty());
    }

    #[tokio::test]
    async fn test_extension_check_is_case_insensitive() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_FINAL.CSV");
        store.insert(&key.location, DELIVERY);

        assert!(cleaner(store).clean(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_failure() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, DELIVERY);
        store.fail_on(StoreOp::Get, &key.location, "access denied");

        let failure = cleaner(store).clean(&key).await.unwrap_err();
        assert_eq!(failure.kind(), "load");
    }

    #[tokio::test]
    async fn test_missing_category_column_fails_key() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, "Make,date\nTCL,20220512\n");

        let failure = cleaner(store).clean(&key).await.unwrap_err();
        assert!(matches!(
            failure,
            KeyFailure::Clean { source: IngestError::MissingColumn(ref c), .. } if c == "Brand"
        ));
    }

    #[tokio::test]
    async fn test_unparseable_date_fails_key() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, "Brand,date\nTCL,2022-05-12\n");

        let failure = cleaner(store.clone()).clean(&key).await.unwrap_err();
        assert_eq!(failure.kind(), "clean");
        assert!(store.keys("tv-type-intermediary").is_empty());
    }

    #[tokio::test]
    async fn test_bad_later_date_stages_nothing() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, "Brand,date\nTCL,20220512\nTCL,n/a\n");

        let failure = cleaner(store.clone()).clean(&key).await.unwrap_err();
        assert!(matches!(
            failure,
            KeyFailure::Clean { source: IngestError::InvalidDate { ref value, .. }, .. } if value == "n/a"
        ));
        assert!(store.keys("tv-type-intermediary").is_empty());
    }

    #[tokio::test]
    async fn test_failed_put_removes_earlier_subsets() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, DELIVERY);
        store.fail_on(
            StoreOp::Put,
            &loc("s3://tv-type-intermediary/TCL-data/20220512/"),
            "slow down",
        );

        let failure = cleaner(store.clone()).clean(&key).await.unwrap_err();
        assert_eq!(failure.kind(), "clean");
        assert!(store.keys("tv-type-intermediary").is_empty());
    }

    fn date_rule(fallback_mode: FallbackMode, default_value: Option<&str>) -> RuleSet {
        RuleSet::new(vec![Rule::Date(DateRule {
            field: "date".to_string(),
            date_format: "%Y%m%d".to_string(),
            range_check: RangeCheck::Rolling,
            range_minimum: Some(-30),
            range_maximum: Some(0),
            fallback_mode,
            default_value: default_value.map(str::to_string),
            skip_blank: false,
        })])
    }

    #[tokio::test]
    async fn test_date_rules_apply_before_split() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, "Brand,date\nTCL,20220512\nTCL,20200101\n");

        let rules = date_rule(FallbackMode::UseDefault, Some("20220501"));
        let prepared = cleaner_with(store, rules).prepare(&key).await.unwrap();

        let dates: Vec<&str> = prepared.dates.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["20220501", "20220512"]);
        assert_eq!(prepared.dates[0].batch.rows()[0][1], "20220501");
    }

    #[tokio::test]
    async fn test_removed_rows_leave_no_empty_subset() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, "Brand,date\nTCL,20200101\nTCL,20200102\n");

        let rules = date_rule(FallbackMode::RemoveRecord, None);
        let cleaned = cleaner_with(store.clone(), rules).clean(&key).await.unwrap();

        assert!(cleaned.dates.is_empty());
        assert_eq!(cleaned.report.entry("date", Outcome::Removed).unwrap().count, 2);
        assert!(store.keys("tv-type-intermediary").is_empty());
    }

    #[tokio::test]
    async fn test_no_matching_rows() {
        let store = Arc::new(MemoryStore::new());
        let key = source("20220512/TV_Final.csv");
        store.insert(&key.location, "Brand,date\nSamsung,20220512\n");

        let cleaned = cleaner(store).clean(&key).await.unwrap();
        assert!(cleaned.dates.is_empty());
    }

    #[test]
    fn test_staging_location_keeps_sources_apart() {
        let c = cleaner(Arc::new(MemoryStore::new()));
        let a = c
            .staging_location("20220512", &source("20220512/TV_Final.csv"))
            .unwrap();
        let b = c
            .staging_location("20220512", &source("20220512/TV_Extra.csv"))
            .unwrap();
        let redelivered = c
            .staging_location("20220512", &source("20220513/TV_Final.csv"))
            .unwrap();
        assert_ne!(a, b);
        assert_ne!(a, redelivered);
    }
}
