//! Mean metric evaluation

use super::{EvaluationContext, SubjectOutcome, SubjectRows, SubjectValue};
use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::latency_tree::reduce_traces;
use crate::metric::{CompiledValue, MathType, MeanMetric, TraceSpec};
use crate::outliers::PercentileBounds;
use rayon::prelude::*;
use tracing::debug;

/// Evaluate a mean metric, winsorizing over the pooled population
pub fn evaluate(
    metric: &MeanMetric,
    subjects: &[SubjectRows<'_>],
    ctx: &EvaluationContext,
    config: &EngineConfig,
) -> Result<Vec<SubjectOutcome>, ComputeError> {
    if metric.trace.is_some() && metric.math != MathType::Sum {
        return Err(ComputeError::InvalidConfig(format!(
            "trace reduction requires math \"sum\", got {:?}",
            metric.math
        )));
    }
    let value = CompiledValue::compile(
        &metric.source,
        metric.math,
        metric.math_property.as_deref(),
        metric.expression.as_deref(),
        config,
    )?;

    let raw: Vec<f64> = subjects
        .par_iter()
        .map(|subject| subject_value(&value, metric.trace.as_ref(), subject, ctx))
        .collect();

    let bounds = PercentileBounds::compute(
        &raw,
        metric.lower_bound_percentile,
        metric.upper_bound_percentile,
    )?;
    if !bounds.is_noop() {
        debug!(lower = ?bounds.lower, upper = ?bounds.upper, "Winsorizing mean metric");
    }

    Ok(subjects
        .iter()
        .zip(raw)
        .filter_map(|(subject, v)| SubjectOutcome::new(subject, SubjectValue::Mean(bounds.clip(v))))
        .collect())
}

/// A subject's value before outlier handling
pub fn subject_value(
    value: &CompiledValue,
    trace: Option<&TraceSpec>,
    subject: &SubjectRows<'_>,
    ctx: &EvaluationContext,
) -> f64 {
    let rows = subject.matching(ctx, &value.matcher);
    match trace {
        Some(spec) => reduce_traces(&rows, spec, |row| value.optional_property_value(row)),
        None => value.reduce(&rows),
    }
}
