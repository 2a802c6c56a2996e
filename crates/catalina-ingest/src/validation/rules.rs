//! Rule documents
//!
//! A rule document is `{"rules": [{"field", "rule_type", "params"}]}` in JSON
//! or YAML. Each entry is converted into a typed [`Rule`] when the document
//! is loaded, so a bad parameter fails the run before any object is touched.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Rules compiled into the binary, used when no rule document is given.
const BUILTIN_RULES: &str = include_str!("../../rules/default_rules.json");

/// What to do with a value that fails its rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Replace the value with the rule's default
    UseDefault,
    /// Report the value but keep it
    DoNotReplace,
    /// Drop the whole row
    RemoveRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeCheck {
    #[default]
    None,
    /// Bounds are days relative to the current date
    Rolling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NumberRule {
    #[serde(skip)]
    pub field: String,
    #[serde(default)]
    pub decimal_places: u32,
    /// Round to `decimal_places` instead of treating extra places as invalid
    #[serde(default)]
    pub fix_decimal_places: bool,
    #[serde(default)]
    pub minimum_value: Option<f64>,
    #[serde(default)]
    pub maximum_value: Option<f64>,
    pub fallback_mode: FallbackMode,
    #[serde(default)]
    pub default_value: Option<f64>,
    #[serde(default)]
    pub skip_blank: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateRule {
    #[serde(skip)]
    pub field: String,
    /// strftime format, e.g. `%Y%m%d`
    pub date_format: String,
    #[serde(default)]
    pub range_check: RangeCheck,
    #[serde(default)]
    pub range_minimum: Option<i64>,
    #[serde(default)]
    pub range_maximum: Option<i64>,
    pub fallback_mode: FallbackMode,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub skip_blank: bool,
}

/// A validation rule bound to one field
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Number(NumberRule),
    Date(DateRule),
}

impl Rule {
    pub fn field(&self) -> &str {
        match self {
            Rule::Number(rule) => &rule.field,
            Rule::Date(rule) => &rule.field,
        }
    }

    /// Rule kind as written in rule documents
    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Number(_) => "Number",
            Rule::Date(_) => "Date",
        }
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        match self {
            Rule::Number(rule) => rule.fallback_mode,
            Rule::Date(rule) => rule.fallback_mode,
        }
    }
}

/// One entry of a rule document as written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRule {
    pub field: String,
    pub rule_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument {
    pub rules: Vec<RawRule>,
}

impl TryFrom<RawRule> for Rule {
    type Error = IngestError;

    fn try_from(raw: RawRule) -> Result<Self> {
        if raw.field.is_empty() {
            return Err(IngestError::rules("rule without a field"));
        }

        let params = match raw.params {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let context = |e: serde_json::Error| {
            IngestError::rules(format!("{} rule on '{}': {e}", raw.rule_type, raw.field))
        };

        let rule = match raw.rule_type.to_ascii_lowercase().as_str() {
            "number" => {
                let mut rule: NumberRule = serde_json::from_value(params).map_err(context)?;
                rule.field = raw.field.clone();
                Rule::Number(rule)
            }
            "date" => {
                let mut rule: DateRule = serde_json::from_value(params).map_err(context)?;
                rule.field = raw.field.clone();
                Rule::Date(rule)
            }
            other => {
                return Err(IngestError::rules(format!(
                    "unknown rule_type '{other}' on '{}'",
                    raw.field
                )))
            }
        };

        validate(&rule)?;
        Ok(rule)
    }
}

fn validate(rule: &Rule) -> Result<()> {
    match rule {
        Rule::Number(r) => {
            if let (Some(min), Some(max)) = (r.minimum_value, r.maximum_value) {
                if min > max {
                    return Err(invalid(
                        rule,
                        format!("minimum_value {min} is greater than maximum_value {max}"),
                    ));
                }
            }
            if r.decimal_places > 15 {
                return Err(invalid(
                    rule,
                    format!("decimal_places {} is too large", r.decimal_places),
                ));
            }
            if r.fallback_mode == FallbackMode::UseDefault && r.default_value.is_none() {
                return Err(invalid(rule, "fallback_mode use_default needs a default_value"));
            }
        }
        Rule::Date(r) => {
            if let (Some(min), Some(max)) = (r.range_minimum, r.range_maximum) {
                if min > max {
                    return Err(invalid(
                        rule,
                        format!("range_minimum {min} is greater than range_maximum {max}"),
                    ));
                }
            }
            match (&r.fallback_mode, &r.default_value) {
                (FallbackMode::UseDefault, None) => {
                    return Err(invalid(rule, "fallback_mode use_default needs a default_value"));
                }
                (_, Some(default)) if parse_date(default, &r.date_format).is_none() => {
                    return Err(invalid(
                        rule,
                        format!(
                            "default_value '{default}' does not match date_format '{}'",
                            r.date_format
                        ),
                    ));
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn invalid(rule: &Rule, message: impl std::fmt::Display) -> IngestError {
    IngestError::rules(format!("{} rule on '{}': {message}", rule.kind(), rule.field()))
}

/// Parse a date, accepting formats that carry a time of day too.
pub(crate) fn parse_date(value: &str, format: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, format)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, format).ok().map(|dt| dt.date()))
}

/// An ordered list of validated rules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The rules shipped with the binary
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(BUILTIN_RULES)
    }

    /// Load a document from disk, picking JSON or YAML by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Err(IngestError::rules(format!(
                "rule document {} must end in .json, .yaml or .yml",
                path.display()
            ))),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let document: RuleDocument = serde_json::from_str(content)?;
        Self::from_document(document)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let document: RuleDocument = serde_yaml::from_str(content)?;
        Self::from_document(document)
    }

    pub fn from_document(document: RuleDocument) -> Result<Self> {
        let rules = document
            .rules
            .into_iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
