//! In-memory CSV tables
//!
//! A [`Batch`] holds the header row and the rows of one source object as
//! plain strings. Cells are never reinterpreted on the way through, so rows
//! that pass the category filter come out byte-for-byte as they went in,
//! apart from what validation deliberately rewrites.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Summary statistics of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub rows: usize,
    pub unique_rows: usize,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

impl Batch {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Parse CSV with a header row.
    pub fn from_csv(data: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(data);

        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let rows = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, _>>()?;

        Ok(Self { headers, rows })
    }

    /// Serialize as CSV with a header row.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| IngestError::Io(e.into_error()))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Vec<String>] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| IngestError::MissingColumn(name.to_string()))
    }

    /// Keep rows whose `column` equals `value` exactly.
    pub fn filter_eq(&self, column: &str, value: &str) -> Result<Batch> {
        let idx = self.require_column(column)?;
        Ok(Self {
            headers: self.headers.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| row.get(idx).map(String::as_str) == Some(value))
                .cloned()
                .collect(),
        })
    }

    /// Split into one batch per distinct raw value of `column`, ordered by
    /// that value.
    pub fn split_by(&self, column: &str) -> Result<BTreeMap<String, Batch>> {
        let idx = self.require_column(column)?;
        let mut groups: BTreeMap<String, Batch> = BTreeMap::new();

        for row in &self.rows {
            let key = row.get(idx).cloned().unwrap_or_default();
            groups
                .entry(key)
                .or_insert_with(|| Batch::new(self.headers.clone(), Vec::new()))
                .rows
                .push(row.clone());
        }

        Ok(groups)
    }

    /// Keep rows for which `keep(index, row)` is true.
    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize, &[String]) -> bool,
    {
        let mut index = 0;
        self.rows.retain(|row| {
            let kept = keep(index, row);
            index += 1;
            kept
        });
    }

    /// Row counts and the date range of `date_column` parsed with `format`.
    ///
    /// Any value that does not parse fails the whole computation.
    pub fn stats(&self, date_column: &str, format: &str) -> Result<BatchStats> {
        let idx = self.require_column(date_column)?;

        let mut min_date: Option<NaiveDate> = None;
        let mut max_date: Option<NaiveDate> = None;
        for row in &self.rows {
            let raw = row.get(idx).map(String::as_str).unwrap_or_default();
            let date = NaiveDate::parse_from_str(raw.trim(), format).map_err(|_| {
                IngestError::InvalidDate {
                    column: date_column.to_string(),
                    value: raw.to_string(),
                }
            })?;
            min_date = Some(min_date.map_or(date, |d| d.min(date)));
            max_date = Some(max_date.map_or(date, |d| d.max(date)));
        }

        let unique_rows = self.rows.iter().collect::<HashSet<_>>().len();

        Ok(BatchStats {
            rows: self.rows.len(),
            unique_rows,
            min_date,
            max_date,
        })
    }
}
