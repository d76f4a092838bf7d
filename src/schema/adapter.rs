//! Parsing of event rows from JSON input
//!
//! Accepts either a JSON array of rows or NDJSON (one row per line).

use crate::error::ComputeError;
use crate::schema::event_row::{EventRow, ValidationError};
use std::collections::BTreeMap;

/// Adapter for turning serialized input into event rows
pub struct EventRowAdapter;

impl EventRowAdapter {
    /// Parse a JSON string containing an array of rows
    pub fn parse_array(json: &str) -> Result<Vec<EventRow>, ComputeError> {
        let rows: Vec<EventRow> = serde_json::from_str(json)?;
        Ok(rows)
    }

    /// Parse NDJSON (newline-delimited JSON) containing rows
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<EventRow>, ComputeError> {
        let mut rows = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRow>(trimmed) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    return Err(ComputeError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(rows)
    }

    /// Parse either format, sniffing the first non-whitespace character
    pub fn parse_any(input: &str) -> Result<Vec<EventRow>, ComputeError> {
        if input.trim_start().starts_with('[') {
            Self::parse_array(input)
        } else {
            Self::parse_ndjson(input)
        }
    }

    /// Validate a batch of rows, returning only the failures
    pub fn validate_rows(rows: &[EventRow]) -> Vec<ValidationResult> {
        rows.iter()
            .enumerate()
            .filter_map(|(idx, row)| {
                row.validate().err().map(|error| ValidationResult {
                    index: idx,
                    uuid: row.uuid.to_string(),
                    error,
                })
            })
            .collect()
    }
}

/// Result of row validation
#[derive(Debug)]
pub struct ValidationResult {
    pub index: usize,
    pub uuid: String,
    pub error: ValidationError,
}

/// Group rows by subject, each group sorted by timestamp.
///
/// The sort is stable, so rows sharing a timestamp keep their input order.
/// Generated uuids are random and never break ties.
pub fn group_by_subject<'a, I>(rows: I) -> BTreeMap<String, Vec<&'a EventRow>>
where
    I: IntoIterator<Item = &'a EventRow>,
{
    let mut by_subject: BTreeMap<String, Vec<&'a EventRow>> = BTreeMap::new();
    for row in rows {
        by_subject
            .entry(row.subject_id.clone())
            .or_default()
            .push(row);
    }
    for rows in by_subject.values_mut() {
        rows.sort_by_key(|row| row.timestamp);
    }
    by_subject
}
