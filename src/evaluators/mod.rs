//! Metric evaluators
//!
//! Each metric kind has its own evaluator turning a subject's post-exposure
//! rows into a [`SubjectValue`]. [`evaluate`] selects the evaluator with a
//! single match on [`Metric`].

pub mod funnel;
pub mod mean;
pub mod ratio;

pub use funnel::FunnelOutcome;

use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::filters::SourceMatcher;
use crate::metric::{Metric, MetricSource};
use crate::schema::{EventQuery, EventRow};
use crate::types::{AnalysisWindow, BreakdownValue, ConversionWindow, ExposureDecision};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

/// Time bounds shared by every evaluator
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext {
    pub window: AnalysisWindow,
    pub conversion_window: Option<Duration>,
}

impl EvaluationContext {
    pub fn new(
        window: AnalysisWindow,
        conversion_window: Option<ConversionWindow>,
    ) -> Result<Self, ComputeError> {
        Ok(Self {
            window,
            conversion_window: conversion_window
                .map(ConversionWindow::to_duration)
                .transpose()?,
        })
    }

    /// Whether an event at `ts` counts for a subject first exposed at
    /// `first_exposure`: strictly after exposure, within the conversion
    /// window and not past the end of the experiment.
    pub fn counts(&self, first_exposure: DateTime<Utc>, ts: DateTime<Utc>) -> bool {
        if ts <= first_exposure || !self.window.before_end(ts) {
            return false;
        }
        match self.conversion_window {
            // A window end past the representable range never cuts anything off
            Some(window) => first_exposure
                .checked_add_signed(window)
                .map_or(true, |end| ts <= end),
            None => true,
        }
    }
}

/// One assigned subject and its candidate metric rows, sorted by time
#[derive(Debug, Clone, Copy)]
pub struct SubjectRows<'a> {
    pub decision: &'a ExposureDecision,
    pub rows: &'a [&'a EventRow],
}

impl<'a> SubjectRows<'a> {
    /// Rows inside the subject's conversion window that satisfy `matcher`
    pub fn matching(&self, ctx: &EvaluationContext, matcher: &SourceMatcher) -> Vec<&'a EventRow> {
        self.rows
            .iter()
            .copied()
            .filter(|row| ctx.counts(self.decision.first_exposure, row.timestamp))
            .filter(|row| matcher.matches(row))
            .collect()
    }
}

/// Per-subject evaluation result
#[derive(Debug, Clone, PartialEq)]
pub enum SubjectValue {
    Mean(f64),
    Funnel(FunnelOutcome),
    Ratio { numerator: f64, denominator: f64 },
}

/// A subject's value together with its bucket
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectOutcome {
    pub subject_id: String,
    pub variant: String,
    pub breakdown: Option<BreakdownValue>,
    pub value: SubjectValue,
}

impl SubjectOutcome {
    fn new(subject: &SubjectRows<'_>, value: SubjectValue) -> Option<Self> {
        Some(Self {
            subject_id: subject.decision.subject_id.clone(),
            variant: subject.decision.assignment.variant()?.to_string(),
            breakdown: subject.decision.breakdown.clone(),
            value,
        })
    }
}

/// Evaluate `metric` for every subject.
///
/// Outcomes come back in the same order as `subjects`.
pub fn evaluate(
    metric: &Metric,
    subjects: &[SubjectRows<'_>],
    ctx: &EvaluationContext,
    config: &EngineConfig,
) -> Result<Vec<SubjectOutcome>, ComputeError> {
    match metric {
        Metric::Mean(m) => mean::evaluate(m, subjects, ctx, config),
        Metric::Funnel(m) => funnel::evaluate(m, subjects, ctx, config),
        Metric::Ratio(m) => ratio::evaluate(m, subjects, ctx, config),
    }
}

/// Every row source a metric reads
pub fn metric_sources(metric: &Metric) -> Vec<&MetricSource> {
    match metric {
        Metric::Mean(m) => vec![&m.source],
        Metric::Funnel(m) => m.series.iter().collect(),
        Metric::Ratio(m) => vec![&m.numerator.source, &m.denominator.source],
    }
}

/// The fetch request covering every row `metric` may read in `window`
pub fn metric_query(
    metric: &Metric,
    window: &AnalysisWindow,
    config: &EngineConfig,
) -> Result<EventQuery, ComputeError> {
    let mut events: Option<BTreeSet<String>> = Some(BTreeSet::new());
    let mut tables: BTreeSet<String> = BTreeSet::new();

    for source in metric_sources(metric) {
        let matcher = SourceMatcher::compile(source, config)?;
        events = match (events, matcher.event_names()) {
            (Some(mut acc), Some(names)) => {
                acc.extend(names);
                Some(acc)
            }
            _ => None,
        };
        tables.extend(matcher.table_names());
    }

    let mut query = EventQuery::new(window.start, window.end);
    query.events = events;
    if !tables.is_empty() {
        query.tables = Some(tables);
    }
    Ok(query)
}
