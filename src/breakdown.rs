//! Breakdown completion
//!
//! Guarantees a result row for every `(variant, breakdown value)` pair: the
//! union of values observed in any variant is taken and missing pairs get a
//! fresh zero row. A missing property (`None`) is a bucket like any other.

use crate::error::ComputeError;
use crate::types::{BreakdownGroup, BreakdownValue, MetricKind, VariantStats, CONTROL_VARIANT};
use std::collections::{BTreeMap, BTreeSet};

/// Zero-fills and groups result rows for one experiment
#[derive(Debug, Clone)]
pub struct BreakdownDimensioner {
    variant_keys: Vec<String>,
    kind: MetricKind,
    funnel_steps: usize,
}

impl BreakdownDimensioner {
    /// `variant_keys` is the full configured list, holdout included
    pub fn new(variant_keys: Vec<String>, kind: MetricKind, funnel_steps: usize) -> Self {
        Self {
            variant_keys,
            kind,
            funnel_steps,
        }
    }

    /// Distinct breakdown values seen in any row, sorted
    pub fn observed_values(rows: &[VariantStats]) -> Vec<Option<BreakdownValue>> {
        rows.iter()
            .map(|r| r.breakdown_value.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every configured variant for every observed value.
    ///
    /// Output is ordered by breakdown value, then by configured variant
    /// order. Rows for unknown variants are dropped.
    pub fn complete(&self, rows: Vec<VariantStats>) -> Vec<VariantStats> {
        let mut values = Self::observed_values(&rows);
        if values.is_empty() {
            values.push(None);
        }

        let mut present: BTreeMap<(String, Option<BreakdownValue>), VariantStats> = rows
            .into_iter()
            .map(|r| ((r.key.clone(), r.breakdown_value.clone()), r))
            .collect();

        let mut completed = Vec::with_capacity(values.len() * self.variant_keys.len());
        for value in &values {
            for key in &self.variant_keys {
                let row = present
                    .remove(&(key.clone(), value.clone()))
                    .unwrap_or_else(|| {
                        VariantStats::zero(key.clone(), value.clone(), self.kind, self.funnel_steps)
                    });
                completed.push(row);
            }
        }
        completed
    }

    /// Completed rows grouped per breakdown value with control as baseline
    pub fn group(&self, rows: Vec<VariantStats>) -> Result<Vec<BreakdownGroup>, ComputeError> {
        let mut grouped: BTreeMap<Option<BreakdownValue>, Vec<VariantStats>> = BTreeMap::new();
        for row in self.complete(rows) {
            grouped
                .entry(row.breakdown_value.clone())
                .or_default()
                .push(row);
        }

        grouped
            .into_iter()
            .map(|(value, rows)| {
                let (baseline, variants) = split_baseline(rows)?;
                Ok(BreakdownGroup {
                    breakdown_value: value.unwrap_or_else(|| BreakdownValue::new(Vec::new())),
                    baseline,
                    variants,
                })
            })
            .collect()
    }
}

/// Separate the control row from the comparison rows, keeping their order
pub fn split_baseline(
    rows: Vec<VariantStats>,
) -> Result<(VariantStats, Vec<VariantStats>), ComputeError> {
    let mut baseline = None;
    let mut variants = Vec::with_capacity(rows.len().saturating_sub(1));
    for row in rows {
        if row.key == CONTROL_VARIANT && baseline.is_none() {
            baseline = Some(row);
        } else {
            variants.push(row);
        }
    }
    let baseline = baseline.ok_or_else(|| {
        ComputeError::InvalidConfig(format!("no \"{CONTROL_VARIANT}\" variant in results"))
    })?;
    Ok((baseline, variants))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn browser(name: &str) -> Option<BreakdownValue> {
        Some(BreakdownValue::new(vec![Some(name.to_string())]))
    }

    fn row(key: &str, value: Option<BreakdownValue>, samples: u64, sum: f64) -> VariantStats {
        let mut stats = VariantStats::zero(key, value, MetricKind::Mean, 0);
        stats.number_of_samples = samples;
        stats.sum = sum;
        stats.sum_squares = sum;
        stats
    }

    fn dimensioner() -> BreakdownDimensioner {
        BreakdownDimensioner::new(
            vec!["control".to_string(), "test".to_string()],
            MetricKind::Mean,
            0,
        )
    }

    #[test]
    fn test_missing_pair_is_zero_filled() {
        let rows = vec![
            row("control", browser("Chrome"), 5, 2.0),
            row("test", browser("Chrome"), 4, 3.0),
            row("control", browser("Safari"), 3, 1.0),
        ];
        let completed = dimensioner().complete(rows);

        assert_eq!(completed.len(), 4);
        let safari_test = completed
            .iter()
            .find(|r| r.key == "test" && r.breakdown_value == browser("Safari"))
            .unwrap();
        assert_eq!(safari_test.number_of_samples, 0);
        assert_eq!(safari_test.sum, 0.0);
    }

    #[test]
    fn test_zero_rows_are_independent() {
        let rows = vec![
            row("control", browser("Chrome"), 1, 1.0),
            row("control", browser("Safari"), 1, 1.0),
        ];
        let mut completed = dimensioner().complete(rows);
        let zero_positions: Vec<usize> = completed
            .iter()
            .enumerate()
            .filter(|(_, r)| r.number_of_samples == 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(zero_positions.len(), 2);

        completed[zero_positions[0]].sum = 42.0;
        completed[zero_positions[0]].number_of_samples = 7;
        assert_eq!(completed[zero_positions[1]].sum, 0.0);
        assert_eq!(completed[zero_positions[1]].number_of_samples, 0);
    }

    #[test]
    fn test_none_value_is_a_bucket() {
        let missing = Some(BreakdownValue::new(vec![None]));
        let rows = vec![
            row("test", missing.clone(), 2, 2.0),
            row("control", browser("Chrome"), 1, 1.0),
        ];
        let values = BreakdownDimensioner::observed_values(&rows);
        assert_eq!(values.len(), 2);

        let groups = dimensioner().group(rows).unwrap();
        assert_eq!(groups.len(), 2);
        let none_group = groups
            .iter()
            .find(|g| Some(g.breakdown_value.clone()) == missing)
            .unwrap();
        assert_eq!(none_group.baseline.number_of_samples, 0);
        assert_eq!(none_group.variants[0].number_of_samples, 2);
    }

    #[test]
    fn test_holdout_gets_rows_too() {
        let d = BreakdownDimensioner::new(
            vec![
                "control".to_string(),
                "test".to_string(),
                "holdout-1".to_string(),
            ],
            MetricKind::Funnel,
            2,
        );
        let completed = d.complete(vec![]);
        assert_eq!(completed.len(), 3);
        assert_eq!(completed[2].key, "holdout-1");
        assert_eq!(completed[2].step_counts, Some(vec![0, 0]));

        let (baseline, variants) = split_baseline(completed).unwrap();
        assert_eq!(baseline.key, "control");
        assert_eq!(variants.len(), 2);
    }
}
