//! Funnel metric evaluation

use super::{EvaluationContext, SubjectOutcome, SubjectRows, SubjectValue};
use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::filters::SourceMatcher;
use crate::metric::{FunnelMetric, FunnelOrderType};
use crate::schema::EventRow;
use rayon::prelude::*;

/// How far a subject got through a funnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunnelOutcome {
    /// Ordered: length of the completed prefix. Unordered: steps matched.
    pub steps_completed: usize,
    pub success: bool,
}

/// Evaluate a funnel metric for every subject
pub fn evaluate(
    metric: &FunnelMetric,
    subjects: &[SubjectRows<'_>],
    ctx: &EvaluationContext,
    config: &EngineConfig,
) -> Result<Vec<SubjectOutcome>, ComputeError> {
    if metric.series.is_empty() {
        return Err(ComputeError::InvalidConfig(
            "funnel metric needs at least one step".to_string(),
        ));
    }
    let steps = metric
        .series
        .iter()
        .map(|source| SourceMatcher::compile(source, config))
        .collect::<Result<Vec<_>, _>>()?;

    let outcomes: Vec<Option<SubjectOutcome>> = subjects
        .par_iter()
        .map(|subject| {
            let rows: Vec<&EventRow> = subject
                .rows
                .iter()
                .copied()
                .filter(|row| ctx.counts(subject.decision.first_exposure, row.timestamp))
                .collect();
            let outcome = match metric.funnel_order_type {
                FunnelOrderType::Ordered => ordered(&steps, &rows),
                FunnelOrderType::Unordered => unordered(&steps, &rows),
            };
            SubjectOutcome::new(subject, SubjectValue::Funnel(outcome))
        })
        .collect();

    Ok(outcomes.into_iter().flatten().collect())
}

/// Greedy ordered match over time-sorted rows.
///
/// Each step takes the earliest unused matching row no earlier than the row
/// matched by the previous step.
pub fn ordered(steps: &[SourceMatcher], rows: &[&EventRow]) -> FunnelOutcome {
    let mut used = vec![false; rows.len()];
    let mut previous = None;
    let mut completed = 0;

    for step in steps {
        let found = rows.iter().enumerate().find(|(i, row)| {
            !used[*i] && previous.map_or(true, |p| row.timestamp >= p) && step.matches(row)
        });
        match found {
            Some((i, row)) => {
                used[i] = true;
                previous = Some(row.timestamp);
                completed += 1;
            }
            None => break,
        }
    }

    FunnelOutcome {
        steps_completed: completed,
        success: completed == steps.len(),
    }
}

/// Every step matched anywhere in the window, in any order
pub fn unordered(steps: &[SourceMatcher], rows: &[&EventRow]) -> FunnelOutcome {
    let completed = steps
        .iter()
        .filter(|step| rows.iter().any(|row| step.matches(row)))
        .count();

    FunnelOutcome {
        steps_completed: completed,
        success: completed == steps.len(),
    }
}
