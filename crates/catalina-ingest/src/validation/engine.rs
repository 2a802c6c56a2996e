//! Rule application
//!
//! [`Scrubber::run`] walks the rules in order. For each rule it checks every
//! remaining row's value in the rule's column and applies the fallback mode
//! to the invalid ones. Rows marked for removal are skipped by later rules
//! and dropped at the end.

use chrono::NaiveDate;

use super::report::{Outcome, ValidationReport};
use super::rules::{parse_date, DateRule, FallbackMode, NumberRule, RangeCheck, Rule, RuleSet};
use crate::batch::Batch;

#[derive(Debug, Clone, PartialEq)]
enum Check {
    Valid,
    /// Valid after rewriting to the given text
    Fixed(String),
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Scrubber {
    rules: RuleSet,
    /// Reference date for rolling ranges
    today: NaiveDate,
}

impl Scrubber {
    pub fn new(rules: RuleSet, today: NaiveDate) -> Self {
        Self { rules, today }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Validate `batch` in place and report what was found.
    pub fn run(&self, batch: &mut Batch) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut removed = vec![false; batch.len()];

        for rule in self.rules.rules() {
            let Some(column) = batch.column_index(rule.field()) else {
                report.record_missing(rule.field(), rule.kind());
                continue;
            };

            for (index, row) in batch.rows_mut().iter_mut().enumerate() {
                if removed[index] {
                    continue;
                }
                let Some(cell) = row.get_mut(column) else {
                    continue;
                };

                match self.check(rule, cell) {
                    Check::Valid => {}
                    Check::Fixed(text) => {
                        report.record(rule.field(), rule.kind(), Outcome::Fixed, cell);
                        *cell = text;
                    }
                    Check::Invalid => match rule.fallback_mode() {
                        FallbackMode::UseDefault => {
                            report.record(rule.field(), rule.kind(), Outcome::Replaced, cell);
                            *cell = default_text(rule);
                        }
                        FallbackMode::DoNotReplace => {
                            report.record(rule.field(), rule.kind(), Outcome::Flagged, cell);
                        }
                        FallbackMode::RemoveRecord => {
                            report.record(rule.field(), rule.kind(), Outcome::Removed, cell);
                            removed[index] = true;
                        }
                    },
                }
            }
        }

        batch.retain_rows(|index, _| !removed[index]);
        report
    }

    fn check(&self, rule: &Rule, value: &str) -> Check {
        match rule {
            Rule::Number(rule) => check_number(rule, value),
            Rule::Date(rule) => check_date(rule, value, self.today),
        }
    }
}

fn check_number(rule: &NumberRule, raw: &str) -> Check {
    let value = raw.trim();
    if value.is_empty() {
        return blank(rule.skip_blank);
    }

    let mut number = match value.parse::<f64>() {
        Ok(n) if n.is_finite() => n,
        _ => return Check::Invalid,
    };

    let mut fixed = None;
    if decimal_places(value) > rule.decimal_places as usize {
        if !rule.fix_decimal_places {
            return Check::Invalid;
        }
        number = round_to(number, rule.decimal_places);
        fixed = Some(format_number(number, rule.decimal_places));
    }

    if rule.minimum_value.is_some_and(|min| number < min)
        || rule.maximum_value.is_some_and(|max| number > max)
    {
        return Check::Invalid;
    }

    match fixed {
        Some(text) => Check::Fixed(text),
        None => Check::Valid,
    }
}

fn check_date(rule: &DateRule, raw: &str, today: NaiveDate) -> Check {
    let value = raw.trim();
    if value.is_empty() {
        return blank(rule.skip_blank);
    }

    let Some(date) = parse_date(value, &rule.date_format) else {
        return Check::Invalid;
    };

    if rule.range_check == RangeCheck::Rolling {
        let offset = (date - today).num_days();
        if rule.range_minimum.is_some_and(|min| offset < min)
            || rule.range_maximum.is_some_and(|max| offset > max)
        {
            return Check::Invalid;
        }
    }

    Check::Valid
}

fn blank(skip_blank: bool) -> Check {
    if skip_blank {
        Check::Valid
    } else {
        Check::Invalid
    }
}

/// Digits after the decimal point, ignoring any exponent.
fn decimal_places(value: &str) -> usize {
    let mantissa = value.split(|c: char| c == 'e' || c == 'E').next().unwrap_or(value);
    mantissa
        .split_once('.')
        .map(|(_, fraction)| fraction.len())
        .unwrap_or(0)
}

fn round_to(number: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (number * factor).round() / factor
}

fn format_number(number: f64, places: u32) -> String {
    // Avoid rendering "-0"
    let number = if number == 0.0 { 0.0 } else { number };
    format!("{:.*}", places as usize, number)
}

fn default_text(rule: &Rule) -> String {
    match rule {
        Rule::Number(rule) => rule
            .default_value
            .map(|v| format_number(v, rule.decimal_places))
            .unwrap_or_default(),
        Rule::Date(rule) => rule.default_value.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 5, 20).unwrap()
    }

    fn batch(csv: &str) -> Batch {
        Batch::from_csv(csv.as_bytes()).unwrap()
    }

    fn price_rule(fallback_mode: FallbackMode) -> NumberRule {
        NumberRule {
            field: "Selling Price".to_string(),
            decimal_places: 0,
            fix_decimal_places: true,
            minimum_value: Some(0.0),
            maximum_value: Some(86_400_000.0),
            fallback_mode,
            default_value: Some(0.0),
            skip_blank: false,
        }
    }

    fn scrubber(rule: Rule) -> Scrubber {
        Scrubber::new(RuleSet::new(vec![rule]), today())
    }

    #[test]
    fn test_builtin_rules_on_clean_data() {
        let scrubber = Scrubber::new(RuleSet::builtin().unwrap(), today());
        let mut data = batch(
            "Brand,Size,Selling Price,Original Price,Rating,date\n\
             TCL,55,32999,45990,4,20220512\n",
        );
        let before = data.clone();

        let report = scrubber.run(&mut data);
        assert!(report.is_empty(), "unexpected entries: {:?}", report.entries());
        assert_eq!(data, before);
    }

    #[test]
    fn test_use_default_replaces_value() {
        let scrubber = scrubber(Rule::Number(price_rule(FallbackMode::UseDefault)));
        let mut data = batch("Brand,Selling Price\nTCL,abc\nTCL,-5\nTCL,100\n");

        let report = scrubber.run(&mut data);
        let column: Vec<&str> = data.rows().iter().map(|r| r[1].as_str()).collect();
        assert_eq!(column, vec!["0", "0", "100"]);

        let entry = report.entry("Selling Price", Outcome::Replaced).unwrap();
        assert_eq!(entry.count, 2);
        assert_eq!(entry.samples, vec!["abc", "-5"]);
    }

    #[test]
    fn test_use_default_above_maximum() {
        let scrubber = scrubber(Rule::Number(price_rule(FallbackMode::UseDefault)));
        let mut data = batch("Brand,Selling Price\nTCL,86400001\nTCL,86400000\n");

        let report = scrubber.run(&mut data);
        assert_eq!(data.rows()[0][1], "0");
        assert_eq!(data.rows()[1][1], "86400000");

        let entry = report.entry("Selling Price", Outcome::Replaced).unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.samples, vec!["86400001"]);
    }

    #[test]
    fn test_fix_decimal_places_rounds() {
        let scrubber = scrubber(Rule::Number(price_rule(FallbackMode::UseDefault)));
        let mut data = batch("Brand,Selling Price\nTCL,32999.6\nTCL,-0.4\n");

        let report = scrubber.run(&mut data);
        assert_eq!(data.rows()[0][1], "33000");
        assert_eq!(data.rows()[1][1], "0");
        assert_eq!(report.entry("Selling Price", Outcome::Fixed).unwrap().count, 2);
    }

    #[test]
    fn test_extra_decimals_invalid_without_fix() {
        let rule = Rule::Number(NumberRule {
            field: "Rating".to_string(),
            decimal_places: 1,
            fix_decimal_places: false,
            minimum_value: None,
            maximum_value: None,
            fallback_mode: FallbackMode::DoNotReplace,
            default_value: None,
            skip_blank: false,
        });
        let scrubber = scrubber(rule);
        let mut data = batch("Rating\n4.25\n4.2\n");

        let report = scrubber.run(&mut data);
        assert_eq!(data.rows()[0][0], "4.25");
        let flagged = report.entry("Rating", Outcome::Flagged).unwrap();
        assert_eq!(flagged.samples, vec!["4.25"]);
    }

    #[test]
    fn test_remove_record_drops_rows() {
        let scrubber = scrubber(Rule::Number(price_rule(FallbackMode::RemoveRecord)));
        let mut data = batch("Brand,Selling Price\nTCL,1\nTCL,\nTCL,3\n");

        let report = scrubber.run(&mut data);
        assert_eq!(data.len(), 2);
        assert_eq!(report.total(Outcome::Removed), 1);
    }

    #[test]
    fn test_skip_blank() {
        let scrubber = scrubber(Rule::Number(NumberRule {
            skip_blank: true,
            ..price_rule(FallbackMode::UseDefault)
        }));
        let mut data = batch("Brand,Selling Price\nTCL,\n");

        let report = scrubber.run(&mut data);
        assert!(report.is_empty());
        assert_eq!(data.rows()[0][1], "");
    }

    #[test]
    fn test_rolling_date_range() {
        let rule = Rule::Date(DateRule {
            field: "date".to_string(),
            date_format: "%Y%m%d".to_string(),
            range_check: RangeCheck::Rolling,
            range_minimum: Some(-10),
            range_maximum: Some(0),
            fallback_mode: FallbackMode::DoNotReplace,
            default_value: None,
            skip_blank: false,
        });
        let scrubber = scrubber(rule);
        let mut data = batch("date\n20220510\n20220509\n20220521\n2022-05-12\n");

        let report = scrubber.run(&mut data);
        let flagged = report.entry("date", Outcome::Flagged).unwrap();
        assert_eq!(flagged.count, 3);
        assert_eq!(flagged.samples, vec!["20220509", "20220521", "2022-05-12"]);
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn test_missing_field_is_reported() {
        let scrubber = Scrubber::new(RuleSet::builtin().unwrap(), today());
        let mut data = batch("Brand,date\nTCL,20220512\n");
        let before = data.clone();

        let report = scrubber.run(&mut data);
        assert_eq!(data, before);
        for field in ["Selling Price", "Original Price", "Size", "Rating"] {
            assert!(report.entry(field, Outcome::MissingField).is_some(), "{field}");
        }
        assert!(report.entry("date", Outcome::MissingField).is_none());
    }

    #[test]
    fn test_decimal_places() {
        assert_eq!(decimal_places("12"), 0);
        assert_eq!(decimal_places("12.50"), 2);
        assert_eq!(decimal_places("1.5e3"), 1);
        assert_eq!(decimal_places("-0.125"), 3);
    }
}
