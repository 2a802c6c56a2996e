//! Rule-driven field validation
//!
//! Rules are loaded from a document ([`rules`]), applied to a batch by the
//! [`Scrubber`] ([`engine`]), and everything they find is aggregated into a
//! [`ValidationReport`] ([`report`]). Validation never fails a batch: invalid
//! values are fixed, replaced, flagged or dropped according to each rule's
//! fallback mode.

pub mod engine;
pub mod report;
pub mod rules;

pub use engine::Scrubber;
pub use report::{Outcome, ReportEntry, ValidationReport};
pub use rules::{DateRule, FallbackMode, NumberRule, RangeCheck, Rule, RuleSet};
