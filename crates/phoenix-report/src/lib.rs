//! Verdicts, summaries and coverage computed from test outcomes.
//!
//! [`ReportAggregator::aggregate`] is a pure function: the same results and
//! test cases always produce the same [`ReportOutcome`]. Identity and
//! timestamps are stamped on separately by [`ReportAggregator::report`].

pub mod aggregate;

pub use aggregate::{by_category, AggregatorConfig, CasesByCategory, ReportAggregator, ReportContext};
