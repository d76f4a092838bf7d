//! Event row schema
//!
//! One row of the inbound event stream: a subject did something at a point in
//! time, with a bag of properties. Rows from external tables carry the table
//! name in `table`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Flexible property value (supports the JSON value shapes events carry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Array(Vec<PropertyValue>),
    Object(HashMap<String, PropertyValue>),
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

impl PropertyValue {
    /// Numeric coercion: numbers, numeric strings and booleans
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) if n.is_finite() => Some(*n),
            PropertyValue::Integer(i) => Some(*i as f64),
            PropertyValue::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            PropertyValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// String coercion used wherever values act as keys (ids, breakdowns).
    ///
    /// Integral numbers render without a fractional part, so `1`, `1.0` and
    /// `"1"` all produce `"1"`. Null yields `None`.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Boolean(b) => Some(b.to_string()),
            PropertyValue::Integer(i) => Some(i.to_string()),
            PropertyValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(n.to_string())
                }
            }
            PropertyValue::String(s) => Some(s.clone()),
            PropertyValue::Array(_) | PropertyValue::Object(_) => {
                serde_json::to_string(self).ok()
            }
        }
    }

    /// True for null, empty strings and empty collections
    pub fn is_empty(&self) -> bool {
        match self {
            PropertyValue::Null => true,
            PropertyValue::String(s) => s.trim().is_empty(),
            PropertyValue::Array(a) => a.is_empty(),
            PropertyValue::Object(o) => o.is_empty(),
            _ => false,
        }
    }
}

/// A single row of the event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    /// Unique row identifier
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    /// Distinct actor key (person or group)
    pub subject_id: String,
    /// Event name (or the table name for external table rows)
    pub event: String,
    /// Event timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    /// Event properties
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
    /// External table the row was read from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl EventRow {
    /// Create a new event row with a fresh identifier
    pub fn new(
        subject_id: impl Into<String>,
        event: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        EventRow {
            uuid: Uuid::new_v4(),
            subject_id: subject_id.into(),
            event: event.into(),
            timestamp,
            properties: HashMap::new(),
            table: None,
        }
    }

    /// Create a row read from an external table
    pub fn table_row(
        table: impl Into<String>,
        subject_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let table = table.into();
        let mut row = EventRow::new(subject_id, table.clone(), timestamp);
        row.table = Some(table);
        row
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property, treating an explicit null like a missing key
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties
            .get(key)
            .filter(|v| !matches!(v, PropertyValue::Null))
    }

    /// Validate the row
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.subject_id.trim().is_empty() {
            return Err(ValidationError::MissingSubject);
        }
        if self.event.trim().is_empty() {
            return Err(ValidationError::MissingEvent);
        }
        Ok(())
    }
}

/// Validation errors for event rows
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Row has an empty subject_id")]
    MissingSubject,

    #[error("Row has an empty event name")]
    MissingEvent,
}
