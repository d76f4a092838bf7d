//! Ratio metric evaluation
//!
//! Numerator and denominator are evaluated as independent mean-style
//! sources. The ratio itself is formed per variant from the totals.

use super::{EvaluationContext, SubjectOutcome, SubjectRows, SubjectValue};
use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::metric::{CompiledValue, RatioMetric};
use rayon::prelude::*;

pub fn evaluate(
    metric: &RatioMetric,
    subjects: &[SubjectRows<'_>],
    ctx: &EvaluationContext,
    config: &EngineConfig,
) -> Result<Vec<SubjectOutcome>, ComputeError> {
    let numerator = CompiledValue::from_mean_source(&metric.numerator, config)?;
    let denominator = CompiledValue::from_mean_source(&metric.denominator, config)?;

    let outcomes: Vec<Option<SubjectOutcome>> = subjects
        .par_iter()
        .map(|subject| {
            let value = SubjectValue::Ratio {
                numerator: numerator.reduce(&subject.matching(ctx, &numerator.matcher)),
                denominator: denominator.reduce(&subject.matching(ctx, &denominator.matcher)),
            };
            SubjectOutcome::new(subject, value)
        })
        .collect();

    Ok(outcomes.into_iter().flatten().collect())
}
