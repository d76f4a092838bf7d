//! Sufficient-statistics accumulation
//!
//! One accumulator per `(variant, breakdown)` bucket. Accumulators only hold
//! counts and sums, so merging is associative and commutative.

use crate::evaluators::{SubjectOutcome, SubjectValue};
use crate::types::{BreakdownValue, MetricKind, VariantStats};
use std::collections::BTreeMap;

/// Bucket identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub variant: String,
    pub breakdown: Option<BreakdownValue>,
}

/// Running statistics for one bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsAccumulator {
    pub count: u64,
    pub sum: f64,
    pub sum_squares: f64,
    pub step_counts: Vec<u64>,
    pub denominator_sum: f64,
    pub denominator_sum_squares: f64,
    pub sum_product: f64,
}

impl StatsAccumulator {
    pub fn new(funnel_steps: usize) -> Self {
        Self {
            step_counts: vec![0; funnel_steps],
            ..Self::default()
        }
    }

    pub fn add(&mut self, value: &SubjectValue) {
        self.count += 1;
        match value {
            SubjectValue::Mean(v) => {
                self.sum += v;
                self.sum_squares += v * v;
            }
            SubjectValue::Funnel(outcome) => {
                if outcome.success {
                    self.sum += 1.0;
                    self.sum_squares += 1.0;
                }
                for count in self.step_counts.iter_mut().take(outcome.steps_completed) {
                    *count += 1;
                }
            }
            SubjectValue::Ratio {
                numerator,
                denominator,
            } => {
                self.sum += numerator;
                self.sum_squares += numerator * numerator;
                self.denominator_sum += denominator;
                self.denominator_sum_squares += denominator * denominator;
                self.sum_product += numerator * denominator;
            }
        }
    }

    pub fn merge(&mut self, other: &StatsAccumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_squares += other.sum_squares;
        if self.step_counts.len() < other.step_counts.len() {
            self.step_counts.resize(other.step_counts.len(), 0);
        }
        for (mine, theirs) in self.step_counts.iter_mut().zip(&other.step_counts) {
            *mine += theirs;
        }
        self.denominator_sum += other.denominator_sum;
        self.denominator_sum_squares += other.denominator_sum_squares;
        self.sum_product += other.sum_product;
    }

    /// Shape the accumulator as a result row for `kind`
    pub fn to_stats(
        &self,
        key: impl Into<String>,
        breakdown_value: Option<BreakdownValue>,
        kind: MetricKind,
    ) -> VariantStats {
        let mut stats = VariantStats::zero(key, breakdown_value, kind, self.step_counts.len());
        stats.number_of_samples = self.count;
        stats.sum = self.sum;
        stats.sum_squares = self.sum_squares;
        match kind {
            MetricKind::Mean => {}
            MetricKind::Funnel => stats.step_counts = Some(self.step_counts.clone()),
            MetricKind::Ratio => {
                stats.denominator_sum = Some(self.denominator_sum);
                stats.denominator_sum_squares = Some(self.denominator_sum_squares);
                stats.numerator_denominator_sum_product = Some(self.sum_product);
            }
        }
        stats
    }
}

/// Accumulators for every bucket that received at least one subject
#[derive(Debug, Clone)]
pub struct Aggregator {
    kind: MetricKind,
    funnel_steps: usize,
    buckets: BTreeMap<BucketKey, StatsAccumulator>,
}

impl Aggregator {
    pub fn new(kind: MetricKind, funnel_steps: usize) -> Self {
        Self {
            kind,
            funnel_steps,
            buckets: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn funnel_steps(&self) -> usize {
        self.funnel_steps
    }

    pub fn add(&mut self, outcome: &SubjectOutcome) {
        let key = BucketKey {
            variant: outcome.variant.clone(),
            breakdown: outcome.breakdown.clone(),
        };
        let steps = self.funnel_steps;
        self.buckets
            .entry(key)
            .or_insert_with(|| StatsAccumulator::new(steps))
            .add(&outcome.value);
    }

    /// Accumulate outcomes; callers pass them in subject-id order so that
    /// float sums are reproducible.
    pub fn extend<'a, I>(&mut self, outcomes: I)
    where
        I: IntoIterator<Item = &'a SubjectOutcome>,
    {
        for outcome in outcomes {
            self.add(outcome);
        }
    }

    pub fn merge(&mut self, other: &Aggregator) {
        for (key, acc) in &other.buckets {
            let steps = self.funnel_steps;
            self.buckets
                .entry(key.clone())
                .or_insert_with(|| StatsAccumulator::new(steps))
                .merge(acc);
        }
    }

    /// Per-variant totals across all breakdown values
    pub fn totals(&self) -> BTreeMap<String, StatsAccumulator> {
        let mut totals: BTreeMap<String, StatsAccumulator> = BTreeMap::new();
        for (key, acc) in &self.buckets {
            totals
                .entry(key.variant.clone())
                .or_insert_with(|| StatsAccumulator::new(self.funnel_steps))
                .merge(acc);
        }
        totals
    }

    pub fn keys(&self) -> impl Iterator<Item = &BucketKey> {
        self.buckets.keys()
    }

    pub fn get(&self, key: &BucketKey) -> Option<&StatsAccumulator> {
        self.buckets.get(key)
    }

    /// Result rows for the buckets present, in key order
    pub fn stats(&self) -> Vec<VariantStats> {
        self.buckets
            .iter()
            .map(|(key, acc)| acc.to_stats(key.variant.clone(), key.breakdown.clone(), self.kind))
            .collect()
    }
}
