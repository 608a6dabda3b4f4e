//! Attachment task-sheet validation.
//!
//! Every task sheet is checked row by row: mandatory cells (marked by the
//! template's background color, surfaced as a flag here) must be non-empty,
//! and each filled cell must pass its declared rule. Any empty mandatory
//! cell triggers a system send-back upstream.

use std::collections::HashMap;

use regex::Regex;

use crate::attachment::{TaskSheet, ValidationRule, ValueType};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowValidationFailure {
    pub sheet: String,
    /// Zero-based index within the sheet's task rows.
    pub row_index: usize,
    pub empty_columns: Vec<String>,
    pub invalid_columns: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub failures: Vec<RowValidationFailure>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn has_empty_mandatory(&self) -> bool {
        self.failures.iter().any(|failure| !failure.empty_columns.is_empty())
    }

    /// One-line description for the send-back reason and the audit trail.
    pub fn summary(&self) -> String {
        let mut empty = 0usize;
        let mut invalid = 0usize;
        for failure in &self.failures {
            empty += failure.empty_columns.len();
            invalid += failure.invalid_columns.len();
        }
        format!(
            "attachment validation failed: {empty} empty mandatory cell(s), {invalid} invalid cell(s) across {} row(s)",
            self.failures.len()
        )
    }
}

/// Validates all sheets. Blank rows are skipped entirely; they do not count
/// as tasks.
pub fn validate_sheets(sheets: &[TaskSheet]) -> ValidationReport {
    let mut patterns = PatternCache::default();
    let mut report = ValidationReport::default();

    for sheet in sheets {
        for (row_index, row) in sheet.rows.iter().enumerate() {
            let blank = row.values().all(|value| value.trim().is_empty());
            if blank {
                continue;
            }

            let mut empty_columns = Vec::new();
            let mut invalid_columns = Vec::new();

            for column in &sheet.columns {
                let value = row.get(&column.name).map(String::as_str).unwrap_or("").trim();

                if value.is_empty() {
                    if column.mandatory {
                        empty_columns.push(column.name.clone());
                    }
                    continue;
                }

                if let Some(rule) = &column.rule {
                    if !passes(rule, value, row, &mut patterns) {
                        invalid_columns.push(column.name.clone());
                    }
                }
            }

            if !empty_columns.is_empty() || !invalid_columns.is_empty() {
                report.failures.push(RowValidationFailure {
                    sheet: sheet.name.clone(),
                    row_index,
                    empty_columns,
                    invalid_columns,
                });
            }
        }
    }

    report
}

#[derive(Default)]
struct PatternCache {
    compiled: HashMap<String, Option<Regex>>,
}

impl PatternCache {
    fn matches(&mut self, pattern: &str, value: &str) -> bool {
        let regex = self
            .compiled
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(pattern).ok());
        // An uncompilable pattern rejects everything rather than silently
        // passing bad data.
        regex.as_ref().map(|regex| regex.is_match(value)).unwrap_or(false)
    }
}

fn passes(
    rule: &ValidationRule,
    value: &str,
    row: &std::collections::BTreeMap<String, String>,
    patterns: &mut PatternCache,
) -> bool {
    match rule {
        ValidationRule::Lookup { options } => options.contains(value),
        ValidationRule::DependentLookup { key_column, sets } => {
            let key = row.get(key_column).map(String::as_str).unwrap_or("").trim();
            sets.get(key).map(|options| options.contains(value)).unwrap_or(false)
        }
        ValidationRule::Pattern { pattern } => patterns.matches(pattern, value),
        ValidationRule::DependentPattern { key_column, patterns: by_key } => {
            let key = row.get(key_column).map(String::as_str).unwrap_or("").trim();
            by_key.get(key).map(|pattern| patterns.matches(pattern, value)).unwrap_or(false)
        }
        ValidationRule::Typed { value_type } => match value_type {
            ValueType::Integer => value.parse::<i64>().is_ok(),
            ValueType::Float => value.parse::<f64>().is_ok(),
            ValueType::Text => true,
        },
        ValidationRule::LookupOrDependentPattern { options, key_column, patterns: by_key } => {
            if options.contains(value) {
                return true;
            }
            let key = row.get(key_column).map(String::as_str).unwrap_or("").trim();
            by_key.get(key).map(|pattern| patterns.matches(pattern, value)).unwrap_or(false)
        }
    }
}
