//! Property filters and source matching
//!
//! Filters are evaluated against a single event row. A [`SourceMatcher`] is
//! compiled once per metric source (resolving action definitions) and then
//! applied to every row.

use crate::config::{ActionDefinition, EngineConfig};
use crate::error::ComputeError;
use crate::metric::MetricSource;
use crate::schema::{EventRow, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Comparison operator for a property filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOperator {
    #[default]
    Exact,
    IsNot,
    Icontains,
    NotIcontains,
    Gt,
    Gte,
    Lt,
    Lte,
    IsSet,
    IsNotSet,
}

/// A single property filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub key: String,
    #[serde(default)]
    pub operator: PropertyOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<PropertyValue>,
}

impl PropertyFilter {
    pub fn exact(key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            key: key.into(),
            operator: PropertyOperator::Exact,
            value: Some(value.into()),
        }
    }

    pub fn new(
        key: impl Into<String>,
        operator: PropertyOperator,
        value: Option<PropertyValue>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            value,
        }
    }

    /// Check the filter against a row
    pub fn matches(&self, row: &EventRow) -> bool {
        let actual = row.property(&self.key);
        match self.operator {
            PropertyOperator::IsSet => actual.is_some(),
            PropertyOperator::IsNotSet => actual.is_none(),
            PropertyOperator::Exact => actual
                .and_then(PropertyValue::to_key_string)
                .map(|a| self.expected_strings().iter().any(|e| *e == a))
                .unwrap_or(false),
            PropertyOperator::IsNot => actual
                .and_then(PropertyValue::to_key_string)
                .map(|a| !self.expected_strings().iter().any(|e| *e == a))
                .unwrap_or(true),
            PropertyOperator::Icontains => actual
                .and_then(PropertyValue::to_key_string)
                .map(|a| self.contains_any(&a))
                .unwrap_or(false),
            PropertyOperator::NotIcontains => actual
                .and_then(PropertyValue::to_key_string)
                .map(|a| !self.contains_any(&a))
                .unwrap_or(true),
            PropertyOperator::Gt => self.compare(actual, |a, e| a > e),
            PropertyOperator::Gte => self.compare(actual, |a, e| a >= e),
            PropertyOperator::Lt => self.compare(actual, |a, e| a < e),
            PropertyOperator::Lte => self.compare(actual, |a, e| a <= e),
        }
    }

    /// Expected values as key strings; an array value means "any of"
    fn expected_strings(&self) -> Vec<String> {
        match &self.value {
            Some(PropertyValue::Array(values)) => values
                .iter()
                .filter_map(PropertyValue::to_key_string)
                .collect(),
            Some(value) => value.to_key_string().into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn contains_any(&self, actual: &str) -> bool {
        let actual = actual.to_lowercase();
        self.expected_strings()
            .iter()
            .any(|e| actual.contains(&e.to_lowercase()))
    }

    fn compare(&self, actual: Option<&PropertyValue>, op: impl Fn(f64, f64) -> bool) -> bool {
        match (
            actual.and_then(PropertyValue::as_f64),
            self.value.as_ref().and_then(PropertyValue::as_f64),
        ) {
            (Some(a), Some(e)) => op(a, e),
            _ => false,
        }
    }

    /// Reject filters whose operator needs a value but has none
    pub fn validate(&self) -> Result<(), ComputeError> {
        let needs_value = !matches!(
            self.operator,
            PropertyOperator::IsSet | PropertyOperator::IsNotSet
        );
        if needs_value && self.value.is_none() {
            return Err(ComputeError::InvalidConfig(format!(
                "property filter on '{}' with operator {:?} requires a value",
                self.key, self.operator
            )));
        }
        Ok(())
    }
}

/// True when every filter matches
pub fn matches_all(filters: &[PropertyFilter], row: &EventRow) -> bool {
    filters.iter().all(|f| f.matches(row))
}

/// One compiled way a row can satisfy a source
#[derive(Debug, Clone)]
struct MatchArm {
    event: Option<String>,
    table: Option<String>,
    filters: Vec<PropertyFilter>,
}

impl MatchArm {
    fn matches(&self, row: &EventRow) -> bool {
        match (&self.table, &row.table) {
            (Some(table), Some(row_table)) if table == row_table => {}
            (Some(_), _) => return false,
            (None, Some(_)) => return false,
            (None, None) => {
                if let Some(event) = &self.event {
                    if event != &row.event {
                        return false;
                    }
                }
            }
        }
        matches_all(&self.filters, row)
    }
}

/// Compiled matcher for a [`MetricSource`]
#[derive(Debug, Clone)]
pub struct SourceMatcher {
    /// The row must satisfy at least one arm
    arms: Vec<MatchArm>,
    /// And every one of these filters
    filters: Vec<PropertyFilter>,
}

impl SourceMatcher {
    /// Compile a source against the team configuration.
    ///
    /// Fails when an action id is unknown or a filter is malformed.
    pub fn compile(source: &MetricSource, config: &EngineConfig) -> Result<Self, ComputeError> {
        let (arms, properties, fixed) = match source {
            MetricSource::Event {
                event,
                properties,
                fixed_properties,
            } => (
                vec![MatchArm {
                    event: event.clone(),
                    table: None,
                    filters: Vec::new(),
                }],
                properties,
                fixed_properties,
            ),
            MetricSource::Action {
                id,
                properties,
                fixed_properties,
            } => {
                let action = config.action(*id).ok_or_else(|| {
                    ComputeError::UnsupportedSource(format!("unknown action id {id}"))
                })?;
                (action_arms(action)?, properties, fixed_properties)
            }
            MetricSource::ExternalTable {
                table_name,
                properties,
                fixed_properties,
            } => (
                vec![MatchArm {
                    event: None,
                    table: Some(table_name.clone()),
                    filters: Vec::new(),
                }],
                properties,
                fixed_properties,
            ),
        };

        let filters: Vec<PropertyFilter> =
            properties.iter().chain(fixed.iter()).cloned().collect();
        for filter in &filters {
            filter.validate()?;
        }

        Ok(Self { arms, filters })
    }

    /// Add filters every matching row must also satisfy
    pub fn with_filters(mut self, filters: &[PropertyFilter]) -> Self {
        self.filters.extend(filters.iter().cloned());
        self
    }

    pub fn matches(&self, row: &EventRow) -> bool {
        self.arms.iter().any(|arm| arm.matches(row)) && matches_all(&self.filters, row)
    }

    /// Event names this matcher can accept; `None` means any event
    pub fn event_names(&self) -> Option<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for arm in self.arms.iter().filter(|a| a.table.is_none()) {
            match &arm.event {
                Some(event) => {
                    names.insert(event.clone());
                }
                None => return None,
            }
        }
        Some(names)
    }

    /// External tables this matcher reads
    pub fn table_names(&self) -> BTreeSet<String> {
        self.arms.iter().filter_map(|a| a.table.clone()).collect()
    }
}

fn action_arms(action: &ActionDefinition) -> Result<Vec<MatchArm>, ComputeError> {
    if action.steps.is_empty() {
        return Err(ComputeError::InvalidConfig(format!(
            "action {} ('{}') has no steps",
            action.id, action.name
        )));
    }
    action
        .steps
        .iter()
        .map(|step| {
            for filter in &step.properties {
                filter.validate()?;
            }
            Ok(MatchArm {
                event: step.event.clone(),
                table: None,
                filters: step.properties.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActionStep;
    use chrono::{TimeZone, Utc};

    fn row(event: &str) -> EventRow {
        EventRow::new("u1", event, Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_exact_coerces_types() {
        let r = row("purchase").with_property("plan_id", 7i64);
        assert!(PropertyFilter::exact("plan_id", "7").matches(&r));
        assert!(PropertyFilter::exact("plan_id", 7.0).matches(&r));
        assert!(!PropertyFilter::exact("plan_id", "8").matches(&r));
    }

    #[test]
    fn test_exact_with_list() {
        let r = row("pageview").with_property("browser", "Safari");
        let filter = PropertyFilter::new(
            "browser",
            PropertyOperator::Exact,
            Some(PropertyValue::Array(vec!["Chrome".into(), "Safari".into()])),
        );
        assert!(filter.matches(&r));
    }

    #[test]
    fn test_negative_operators_pass_on_missing() {
        let r = row("pageview");
        assert!(PropertyFilter::new("email", PropertyOperator::IsNot, Some("x".into())).matches(&r));
        assert!(PropertyFilter::new(
            "email",
            PropertyOperator::NotIcontains,
            Some("@internal.com".into())
        )
        .matches(&r));
        assert!(!PropertyFilter::new("email", PropertyOperator::Icontains, Some("a".into()))
            .matches(&r));
    }

    #[test]
    fn test_numeric_comparisons() {
        let r = row("purchase").with_property("price", "19.5");
        assert!(PropertyFilter::new("price", PropertyOperator::Gt, Some(10.0.into())).matches(&r));
        assert!(!PropertyFilter::new("price", PropertyOperator::Lte, Some(10.0.into())).matches(&r));
    }

    #[test]
    fn test_filter_without_value_is_rejected() {
        let filter = PropertyFilter::new("price", PropertyOperator::Gt, None);
        assert!(filter.validate().is_err());
        assert!(PropertyFilter::new("price", PropertyOperator::IsSet, None)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_action_source_matches_any_step() {
        let config = EngineConfig {
            actions: vec![ActionDefinition {
                id: 3,
                name: "checkout".to_string(),
                steps: vec![
                    ActionStep {
                        event: Some("purchase".to_string()),
                        properties: vec![],
                    },
                    ActionStep {
                        event: Some("$pageview".to_string()),
                        properties: vec![PropertyFilter::exact("$pathname", "/thanks")],
                    },
                ],
            }],
            ..Default::default()
        };
        let source = MetricSource::Action {
            id: 3,
            properties: vec![],
            fixed_properties: vec![],
        };
        let matcher = SourceMatcher::compile(&source, &config).unwrap();

        assert!(matcher.matches(&row("purchase")));
        assert!(matcher.matches(&row("$pageview").with_property("$pathname", "/thanks")));
        assert!(!matcher.matches(&row("$pageview").with_property("$pathname", "/home")));
    }

    #[test]
    fn test_unknown_action_fails_fast() {
        let source = MetricSource::Action {
            id: 99,
            properties: vec![],
            fixed_properties: vec![],
        };
        let err = SourceMatcher::compile(&source, &EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unknown action id 99"));
    }

    #[test]
    fn test_external_table_only_matches_table_rows() {
        let source = MetricSource::ExternalTable {
            table_name: "payments".to_string(),
            properties: vec![],
            fixed_properties: vec![PropertyFilter::exact("status", "paid")],
        };
        let matcher = SourceMatcher::compile(&source, &EngineConfig::default()).unwrap();
        let ts = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();

        assert!(matcher.matches(&EventRow::table_row("payments", "u", ts).with_property("status", "paid")));
        assert!(!matcher.matches(&EventRow::table_row("payments", "u", ts)));
        assert!(!matcher.matches(&row("payments").with_property("status", "paid")));
        assert_eq!(matcher.table_names().len(), 1);
        assert_eq!(matcher.event_names(), Some(BTreeSet::new()));
    }
}
