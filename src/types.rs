//! Core types for the experiment engine
//!
//! This module defines the data structures that flow through each stage:
//! experiment configuration, exposure decisions, per-variant statistics and
//! the result shapes handed back to callers.

use crate::filters::PropertyFilter;
use crate::metric::MetricSource;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Variant key every experiment must carry
pub const CONTROL_VARIANT: &str = "control";

/// Bucket key for subjects exposed to more than one variant
pub const MULTIPLE_VARIANT_KEY: &str = "$multiple";

/// Event the SDKs send when a flag is evaluated
pub const FEATURE_FLAG_CALLED_EVENT: &str = "$feature_flag_called";

/// Property naming the flag on `$feature_flag_called`
pub const FEATURE_FLAG_PROPERTY: &str = "$feature_flag";

/// Property carrying the variant on `$feature_flag_called`
pub const FEATURE_FLAG_RESPONSE_PROPERTY: &str = "$feature_flag_response";

/// Per-flag variant property attached to every other event
pub fn feature_variant_property(flag_key: &str) -> String {
    format!("$feature/{flag_key}")
}

/// How to treat subjects exposed to more than one variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipleVariantHandling {
    /// Drop the subject from every variant
    #[default]
    Exclude,
    /// Keep the variant of the chronologically first exposure
    FirstSeen,
}

/// Holdout group attached to the flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holdout {
    pub id: i64,
}

impl Holdout {
    pub fn variant_key(&self) -> String {
        format!("holdout-{}", self.id)
    }
}

/// What counts as an exposure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureCriterion {
    /// Custom exposure source; `None` means `$feature_flag_called` for the flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MetricSource>,
    /// Extra filters every exposure row must satisfy
    #[serde(default)]
    pub filters: Vec<PropertyFilter>,
}

/// An A/B experiment on a feature flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub flag_key: String,
    /// Ordered variant keys, including "control"
    pub variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdout: Option<Holdout>,
    pub start_date: DateTime<Utc>,
    /// Inclusive end; open-ended experiments run up to the evaluation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exposure_criterion: ExposureCriterion,
    #[serde(default)]
    pub multiple_variant_handling: MultipleVariantHandling,
    #[serde(default)]
    pub filter_test_accounts: bool,
}

impl Experiment {
    /// Configured variants followed by the holdout key, if any
    pub fn all_variant_keys(&self) -> Vec<String> {
        let mut keys = self.variants.clone();
        if let Some(holdout) = &self.holdout {
            keys.push(holdout.variant_key());
        }
        keys
    }

    /// Non-control variants that count as test arms (holdout excluded)
    pub fn test_variant_keys(&self) -> impl Iterator<Item = &String> {
        self.variants.iter().filter(|v| v.as_str() != CONTROL_VARIANT)
    }

    /// The window this experiment is analysed over at `as_of`
    pub fn analysis_window(&self, as_of: DateTime<Utc>) -> AnalysisWindow {
        match self.end_date {
            Some(end) => AnalysisWindow {
                start: self.start_date,
                end,
                end_inclusive: true,
            },
            None => AnalysisWindow {
                start: self.start_date,
                end: as_of,
                end_inclusive: false,
            },
        }
    }

    /// Check the variant list and date range
    pub fn validate(&self) -> Result<(), crate::error::ComputeError> {
        use crate::error::ComputeError;

        if self.flag_key.trim().is_empty() {
            return Err(ComputeError::MissingField("flag_key".to_string()));
        }
        if !self.variants.iter().any(|v| v == CONTROL_VARIANT) {
            return Err(ComputeError::InvalidConfig(format!(
                "experiment on '{}' has no \"{CONTROL_VARIANT}\" variant",
                self.flag_key
            )));
        }
        if self.test_variant_keys().next().is_none() {
            return Err(ComputeError::InvalidConfig(format!(
                "experiment on '{}' has no test variant",
                self.flag_key
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for key in self.all_variant_keys() {
            if !seen.insert(key.clone()) {
                return Err(ComputeError::InvalidConfig(format!(
                    "duplicate variant key '{key}'"
                )));
            }
        }
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(ComputeError::InvalidConfig(
                    "end_date is before start_date".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Time window over which exposures and conversions are read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub end_inclusive: bool,
}

impl AnalysisWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && self.before_end(ts)
    }

    /// True when `ts` does not pass the end of the window
    pub fn before_end(&self, ts: DateTime<Utc>) -> bool {
        if self.end_inclusive {
            ts <= self.end
        } else {
            ts < self.end
        }
    }

    /// Calendar days covered, inclusive of both ends
    pub fn days(&self) -> Vec<NaiveDate> {
        let first = self.start.date_naive();
        let last = self.end.date_naive();
        first.iter_days().take_while(|d| *d <= last).collect()
    }
}

/// Unit of a conversion window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

/// Maximum time after first exposure during which a metric event counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionWindow {
    pub value: i64,
    pub unit: WindowUnit,
}

impl ConversionWindow {
    /// Fails when the window does not fit in a [`Duration`]
    pub fn to_duration(self) -> Result<Duration, crate::error::ComputeError> {
        let duration = match self.unit {
            WindowUnit::Second => Duration::try_seconds(self.value),
            WindowUnit::Minute => Duration::try_minutes(self.value),
            WindowUnit::Hour => Duration::try_hours(self.value),
            WindowUnit::Day => Duration::try_days(self.value),
            WindowUnit::Week => Duration::try_weeks(self.value),
        };
        duration.ok_or_else(|| {
            crate::error::ComputeError::InvalidConfig(format!(
                "conversion window of {} {:?} is out of range",
                self.value, self.unit
            ))
        })
    }
}

/// Ordered tuple of breakdown property values; `None` marks a missing value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakdownValue(pub Vec<Option<String>>);

impl BreakdownValue {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self(values)
    }
}

impl fmt::Display for BreakdownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .0
            .iter()
            .map(|v| v.as_deref().unwrap_or("(none)"))
            .collect();
        write!(f, "{}", parts.join(" / "))
    }
}

/// Which bucket a subject landed in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assignment {
    Variant(String),
    /// Exposed to more than one variant under the `Exclude` policy
    Multiple,
}

impl Assignment {
    pub fn key(&self) -> &str {
        match self {
            Assignment::Variant(key) => key,
            Assignment::Multiple => MULTIPLE_VARIANT_KEY,
        }
    }

    pub fn variant(&self) -> Option<&str> {
        match self {
            Assignment::Variant(key) => Some(key),
            Assignment::Multiple => None,
        }
    }
}

/// The resolved exposure of one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureDecision {
    pub subject_id: String,
    pub assignment: Assignment,
    /// Timestamp conversions are measured from
    pub first_exposure: DateTime<Utc>,
    /// Breakdown value read off the deciding exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<BreakdownValue>,
}

/// Kind of metric a result was computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Mean,
    Funnel,
    Ratio,
}

/// Sufficient statistics for one (variant, breakdown) bucket.
///
/// For funnels `sum` is the number of subjects who completed the last step
/// and `step_counts[i]` the number who reached step `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown_value: Option<BreakdownValue>,
    pub number_of_samples: u64,
    pub sum: f64,
    pub sum_squares: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_counts: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denominator_sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denominator_sum_squares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numerator_denominator_sum_product: Option<f64>,
}

impl VariantStats {
    /// A fresh zero-valued row shaped for `kind`
    pub fn zero(
        key: impl Into<String>,
        breakdown_value: Option<BreakdownValue>,
        kind: MetricKind,
        funnel_steps: usize,
    ) -> Self {
        let (step_counts, ratio) = match kind {
            MetricKind::Mean => (None, None),
            MetricKind::Funnel => (Some(vec![0; funnel_steps]), None),
            MetricKind::Ratio => (None, Some(0.0)),
        };
        Self {
            key: key.into(),
            breakdown_value,
            number_of_samples: 0,
            sum: 0.0,
            sum_squares: 0.0,
            step_counts,
            denominator_sum: ratio,
            denominator_sum_squares: ratio,
            numerator_denominator_sum_product: ratio,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.number_of_samples == 0 {
            return None;
        }
        Some(self.sum / self.number_of_samples as f64)
    }

    /// Variant-level ratio Σ numerator / Σ denominator
    pub fn ratio(&self) -> Option<f64> {
        match self.denominator_sum {
            Some(denominator) if denominator != 0.0 => Some(self.sum / denominator),
            _ => None,
        }
    }
}

/// Results for one breakdown value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownGroup {
    pub breakdown_value: BreakdownValue,
    pub baseline: VariantStats,
    pub variants: Vec<VariantStats>,
}

/// Output of one metric computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub kind: MetricKind,
    /// Control-equivalent stats across all breakdown values
    pub baseline: VariantStats,
    /// Every other variant (holdout included), in configured order
    pub variants: Vec<VariantStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown_results: Option<Vec<BreakdownGroup>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown_values: Option<Vec<BreakdownValue>>,
}

/// Cumulative first-exposure counts per day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureTimeseries {
    pub days: Vec<NaiveDate>,
    /// variant key → cumulative count per day (aligned with `days`)
    pub series: BTreeMap<String, Vec<u64>>,
    pub total_exposures: BTreeMap<String, u64>,
}
