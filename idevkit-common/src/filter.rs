//! Keyword filtering for device log records
//!
//! A record is kept when its line contains at least one configured keyword.
//! An empty keyword set keeps everything.

use crate::LogRecord;
use serde::{Deserialize, Serialize};

/// Ordered keyword set with OR semantics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl FilterSpec {
    /// Filter that accepts every record
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Case-sensitive keyword filter
    pub fn keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            case_sensitive: true,
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

/// Check whether a record passes the filter
pub fn matches(record: &LogRecord, spec: &FilterSpec) -> bool {
    matches_text(&record.line, spec)
}

/// Keyword test on raw text; [`matches`] applies it to the record's line
pub fn matches_text(text: &str, spec: &FilterSpec) -> bool {
    if spec.keywords.is_empty() {
        return true;
    }

    if spec.case_sensitive {
        spec.keywords.iter().any(|keyword| text.contains(keyword.as_str()))
    } else {
        let haystack = text.to_lowercase();
        spec.keywords
            .iter()
            .any(|keyword| haystack.contains(&keyword.to_lowercase()))
    }
}

/// Filter a batch of records, preserving order
pub fn filter_records(records: &[LogRecord], spec: &FilterSpec) -> Vec<LogRecord> {
    records
        .iter()
        .filter(|record| matches(record, spec))
        .cloned()
        .collect()
}
