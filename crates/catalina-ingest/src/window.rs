//! Trailing day window and source key selection
//!
//! Source objects are laid out as `<root>/<YYYYMMDD>/<file>`. A run considers
//! every object whose date segment falls inside `[today - horizon, today]`.
//! Nothing is persisted between runs; the window is recomputed every time.

use catalina_common::S3Location;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{list_keys, ObjectStore};

/// Format of the date segment in source keys and partition values.
pub const KEY_DATE_FORMAT: &str = "%Y%m%d";

/// Inclusive range of calendar days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl TimeWindow {
    /// Window ending on the UTC day of `now` and reaching `horizon_days` back.
    pub fn trailing(now: DateTime<Utc>, horizon_days: u32) -> Self {
        let end = now.date_naive();
        let start = end
            .checked_sub_signed(Duration::days(i64::from(horizon_days)))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every day of the window as `YYYYMMDD`, oldest first.
    pub fn days(&self) -> impl Iterator<Item = String> + '_ {
        self.start
            .iter_days()
            .take_while(move |d| *d <= self.end)
            .map(|d| d.format(KEY_DATE_FORMAT).to_string())
    }
}

/// One delivered source object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceKey {
    /// Delivery date from the first key segment below the root
    pub date: NaiveDate,
    /// Key relative to the source root, e.g. `20220512/TV_Final.csv`
    pub key: String,
    /// Last key segment
    pub filename: String,
    pub location: S3Location,
}

impl SourceKey {
    /// Interpret `relative_key` below `root`. Returns `None` when the first
    /// segment is not an eight digit date or the key has no file name.
    pub fn parse(root: &S3Location, relative_key: &str) -> Option<Self> {
        if relative_key.ends_with('/') {
            return None;
        }

        let (segment, _) = relative_key.split_once('/')?;
        let date = parse_key_date(segment)?;
        let filename = relative_key.rsplit('/').next()?.to_string();
        if filename.is_empty() {
            return None;
        }
        let location = root.join([relative_key]).ok()?;

        Some(Self {
            date,
            key: relative_key.to_string(),
            filename,
            location,
        })
    }

    /// `YYYYMMDD` of the delivery date
    pub fn date_segment(&self) -> String {
        self.date.format(KEY_DATE_FORMAT).to_string()
    }
}

/// Parse exactly eight ASCII digits as `YYYYMMDD`.
pub fn parse_key_date(segment: &str) -> Option<NaiveDate> {
    if segment.len() != 8 || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(segment, KEY_DATE_FORMAT).ok()
}

/// List everything under `root` and keep the keys whose date falls in
/// `window`, ordered by date then key.
pub async fn select_keys(
    store: &dyn ObjectStore,
    root: &S3Location,
    window: &TimeWindow,
) -> Result<Vec<SourceKey>> {
    let all: Vec<String> = list_keys(store, root).try_collect().await?;
    let listed = all.len();

    let mut selected = Vec::new();
    for key in all {
        let Some(relative) = root.relative_key(&key) else {
            continue;
        };
        match SourceKey::parse(root, relative) {
            Some(source) if window.contains(source.date) => selected.push(source),
            Some(source) => {
                debug!(key = %source.key, date = %source.date, "Key outside window")
            }
            None => debug!(key = %key, "Skipping key without a date segment"),
        }
    }

    selected.sort();

    info!(
        listed,
        selected = selected.len(),
        window_start = %window.start(),
        window_end = %window.end(),
        "Selected source keys"
    );

    Ok(selected)
}
