use std::fmt;

use serde::Serialize;

/// Sample values kept per report entry
pub const MAX_SAMPLES: usize = 5;

/// What validation did to a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Rounded to the allowed number of decimal places
    Fixed,
    /// Replaced by the rule's default value
    Replaced,
    /// Invalid but kept as is
    Flagged,
    /// Whole row dropped
    Removed,
    /// The rule's field is not a column of the batch
    MissingField,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Fixed => "fixed",
            Outcome::Replaced => "replaced",
            Outcome::Flagged => "flagged",
            Outcome::Removed => "removed",
            Outcome::MissingField => "missing_field",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub field: String,
    pub rule: &'static str,
    pub outcome: Outcome,
    pub count: usize,
    /// Original values, at most [`MAX_SAMPLES`]
    pub samples: Vec<String>,
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field={} rule={} outcome={} count={} samples={:?}",
            self.field, self.rule, self.outcome, self.count, self.samples
        )
    }
}

/// Everything validation observed on one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    entries: Vec<ReportEntry>,
}

impl ValidationReport {
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, field: &str, outcome: Outcome) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .find(|e| e.field == field && e.outcome == outcome)
    }

    /// Number of values with `outcome` across all fields
    pub fn total(&self, outcome: Outcome) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == outcome)
            .map(|e| e.count)
            .sum()
    }

    /// Count one value, aggregating per (field, rule, outcome).
    pub(crate) fn record(&mut self, field: &str, rule: &'static str, outcome: Outcome, value: &str) {
        let entry = self.entry_mut(field, rule, outcome);
        entry.count += 1;
        if entry.samples.len() < MAX_SAMPLES {
            entry.samples.push(value.to_string());
        }
    }

    pub(crate) fn record_missing(&mut self, field: &str, rule: &'static str) {
        self.entry_mut(field, rule, Outcome::MissingField);
    }

    fn entry_mut(&mut self, field: &str, rule: &'static str, outcome: Outcome) -> &mut ReportEntry {
        let position = self
            .entries
            .iter()
            .position(|e| e.field == field && e.rule == rule && e.outcome == outcome);

        let index = match position {
            Some(index) => index,
            None => {
                self.entries.push(ReportEntry {
                    field: field.to_string(),
                    rule,
                    outcome,
                    count: 0,
                    samples: Vec::new(),
                });
                self.entries.len() - 1
            }
        };

        &mut self.entries[index]
    }
}
