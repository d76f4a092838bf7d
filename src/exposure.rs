//! Exposure resolution
//!
//! Turns the raw exposure stream into at most one [`ExposureDecision`] per
//! subject, applying the experiment's multiple-variant policy.

use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::filters::{matches_all, PropertyFilter, SourceMatcher};
use crate::metric::{BreakdownSpec, MetricSource};
use crate::schema::{EventQuery, EventRow};
use crate::types::{
    feature_variant_property, AnalysisWindow, Assignment, BreakdownValue, Experiment,
    ExposureDecision, MultipleVariantHandling, FEATURE_FLAG_CALLED_EVENT, FEATURE_FLAG_PROPERTY,
    FEATURE_FLAG_RESPONSE_PROPERTY,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Resolved exposures keyed by subject id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExposureDecisions {
    decisions: BTreeMap<String, ExposureDecision>,
}

impl ExposureDecisions {
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn get(&self, subject_id: &str) -> Option<&ExposureDecision> {
        self.decisions.get(subject_id)
    }

    /// Every decision, in subject-id order
    pub fn iter(&self) -> impl Iterator<Item = &ExposureDecision> {
        self.decisions.values()
    }

    /// Decisions that landed in a real variant
    pub fn assigned(&self) -> impl Iterator<Item = &ExposureDecision> {
        self.iter().filter(|d| d.assignment.variant().is_some())
    }

    /// Number of subjects assigned to `variant`
    pub fn count_for(&self, variant: &str) -> usize {
        self.assigned()
            .filter(|d| d.assignment.variant() == Some(variant))
            .count()
    }

    /// Subjects excluded for seeing more than one variant
    pub fn multiple_count(&self) -> usize {
        self.iter()
            .filter(|d| d.assignment == Assignment::Multiple)
            .count()
    }
}

impl FromIterator<ExposureDecision> for ExposureDecisions {
    fn from_iter<T: IntoIterator<Item = ExposureDecision>>(iter: T) -> Self {
        Self {
            decisions: iter
                .into_iter()
                .map(|d| (d.subject_id.clone(), d))
                .collect(),
        }
    }
}

/// Resolves exposure rows for one experiment
#[derive(Debug, Clone)]
pub struct ExposureResolver {
    flag_key: String,
    variant_keys: Vec<String>,
    policy: MultipleVariantHandling,
    window: AnalysisWindow,
    matcher: SourceMatcher,
    test_account_filters: Vec<PropertyFilter>,
    breakdown: Vec<String>,
}

impl ExposureResolver {
    /// Compile the exposure criterion for `experiment` evaluated at `as_of`
    pub fn new(
        experiment: &Experiment,
        breakdown: &BreakdownSpec,
        config: &EngineConfig,
        as_of: DateTime<Utc>,
    ) -> Result<Self, ComputeError> {
        let criterion = &experiment.exposure_criterion;
        let source = criterion.source.clone().unwrap_or_else(|| {
            MetricSource::event(FEATURE_FLAG_CALLED_EVENT).with_property(PropertyFilter::exact(
                FEATURE_FLAG_PROPERTY,
                experiment.flag_key.as_str(),
            ))
        });
        for filter in &criterion.filters {
            filter.validate()?;
        }
        let matcher = SourceMatcher::compile(&source, config)?.with_filters(&criterion.filters);

        let test_account_filters = if experiment.filter_test_accounts {
            config.test_account_filters.clone()
        } else {
            Vec::new()
        };

        Ok(Self {
            flag_key: experiment.flag_key.clone(),
            variant_keys: experiment.all_variant_keys(),
            policy: experiment.multiple_variant_handling,
            window: experiment.analysis_window(as_of),
            matcher,
            test_account_filters,
            breakdown: breakdown.properties.clone(),
        })
    }

    pub fn window(&self) -> AnalysisWindow {
        self.window
    }

    /// The fetch request covering every candidate exposure row
    pub fn query(&self) -> EventQuery {
        let mut query = EventQuery::new(self.window.start, self.window.end);
        query.events = self.matcher.event_names();
        let tables = self.matcher.table_names();
        if !tables.is_empty() {
            query.tables = Some(tables);
        }
        query
    }

    /// Window, internal-traffic filter and exposure criterion
    pub fn is_exposure(&self, row: &EventRow) -> bool {
        self.window.contains(row.timestamp)
            && matches_all(&self.test_account_filters, row)
            && self.matcher.matches(row)
    }

    /// Variant named by an exposure row.
    ///
    /// Reads `$feature_flag_response` first and falls back to the per-flag
    /// `$feature/<flag>` property, so rows from SDKs that omit one of them
    /// still count.
    pub fn variant_of(&self, row: &EventRow) -> Option<String> {
        let flag_property = feature_variant_property(&self.flag_key);
        [FEATURE_FLAG_RESPONSE_PROPERTY, flag_property.as_str()]
            .iter()
            .filter_map(|key| row.property(key))
            .find(|value| !value.is_empty())
            .and_then(|value| value.to_key_string())
    }

    fn breakdown_of(&self, row: &EventRow) -> Option<BreakdownValue> {
        if self.breakdown.is_empty() {
            return None;
        }
        Some(BreakdownValue::new(
            self.breakdown
                .iter()
                .map(|key| row.property(key).and_then(|v| v.to_key_string()))
                .collect(),
        ))
    }

    /// Resolve rows (in any order) into one decision per subject
    pub fn resolve<'a, I>(&self, rows: I) -> ExposureDecisions
    where
        I: IntoIterator<Item = &'a EventRow>,
    {
        let mut skipped_no_variant = 0usize;
        let mut skipped_unknown_variant = 0usize;
        let mut exposures: Vec<(&EventRow, String)> = Vec::new();

        for row in rows.into_iter().filter(|r| self.is_exposure(r)) {
            match self.variant_of(row) {
                Some(variant) if self.variant_keys.contains(&variant) => {
                    exposures.push((row, variant))
                }
                Some(_) => skipped_unknown_variant += 1,
                None => skipped_no_variant += 1,
            }
        }

        // Stable sort: exposures sharing a timestamp keep their input order
        let mut by_subject: BTreeMap<&str, Vec<(&EventRow, &str)>> = BTreeMap::new();
        for (row, variant) in &exposures {
            by_subject
                .entry(row.subject_id.as_str())
                .or_default()
                .push((*row, variant.as_str()));
        }
        for group in by_subject.values_mut() {
            group.sort_by_key(|(row, _)| row.timestamp);
        }
        let groups: Vec<(&str, &Vec<(&EventRow, &str)>)> =
            by_subject.iter().map(|(subject, group)| (*subject, group)).collect();

        let decisions: ExposureDecisions = groups
            .par_iter()
            .filter_map(|(subject_id, group)| self.decide(subject_id, group))
            .collect::<Vec<_>>()
            .into_iter()
            .collect();

        debug!(
            flag_key = %self.flag_key,
            exposure_rows = exposures.len(),
            subjects = decisions.len(),
            multiple = decisions.multiple_count(),
            skipped_no_variant,
            skipped_unknown_variant,
            "Resolved exposures"
        );
        if skipped_unknown_variant > 0 {
            warn!(
                flag_key = %self.flag_key,
                rows = skipped_unknown_variant,
                "Skipped exposures naming a variant the experiment does not define"
            );
        }

        decisions
    }

    /// Decide one subject from its exposures, sorted by time
    fn decide(&self, subject_id: &str, group: &[(&EventRow, &str)]) -> Option<ExposureDecision> {
        let (first, first_variant) = *group.first()?;
        let mixed = group.iter().any(|(_, variant)| *variant != first_variant);

        let assignment = match (mixed, self.policy) {
            (true, MultipleVariantHandling::Exclude) => Assignment::Multiple,
            _ => Assignment::Variant(first_variant.to_string()),
        };

        Some(ExposureDecision {
            subject_id: subject_id.to_string(),
            assignment,
            first_exposure: first.timestamp,
            breakdown: self.breakdown_of(first),
        })
    }
}
