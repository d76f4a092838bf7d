//! Pipeline orchestration
//!
//! This module provides the public API of the engine. One run goes through
//! these stages:
//! 1. ExposureResolver - one decision per subject
//! 2. Validation - missing exposures / control / test reported together
//! 3. Evaluators - per-subject metric values (parallel over subjects)
//! 4. Aggregator - sufficient statistics per (variant, breakdown) bucket
//! 5. BreakdownDimensioner - zero-fill and grouping

use crate::aggregation::Aggregator;
use crate::breakdown::{split_baseline, BreakdownDimensioner};
use crate::config::EngineConfig;
use crate::encoder::ResultEncoder;
use crate::error::{ComputeError, ExperimentValidationError};
use crate::evaluators::{self, EvaluationContext, SubjectRows};
use crate::exposure::{ExposureDecisions, ExposureResolver};
use crate::filters::{matches_all, PropertyFilter};
use crate::metric::{BreakdownSpec, Metric};
use crate::schema::{group_by_subject, EventRow, EventRowAdapter, EventSource, InMemoryEventSource};
use crate::timeseries::build_timeseries;
use crate::types::{
    Experiment, ExperimentResult, ExposureTimeseries, VariantStats, CONTROL_VARIANT,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Everything needed for one run besides the events themselves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRequest {
    pub experiment: Experiment,
    /// Required for metric results, unused for exposure timeseries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<Metric>,
    #[serde(default)]
    pub config: EngineConfig,
    /// Evaluation time; defaults to now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

impl ExperimentRequest {
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let request: ExperimentRequest = serde_json::from_str(json)?;
        request.config.validate()?;
        Ok(request)
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of.unwrap_or_else(Utc::now)
    }

    pub fn metric(&self) -> Result<&Metric, ComputeError> {
        self.metric
            .as_ref()
            .ok_or_else(|| ComputeError::MissingField("metric".to_string()))
    }
}

/// Compute metric results from JSON inputs.
///
/// # Arguments
/// * `request_json` - An [`ExperimentRequest`] as JSON
/// * `events_json` - Event rows as a JSON array or NDJSON
///
/// # Returns
/// A result payload as JSON
pub fn calculate_experiment_results(
    request_json: &str,
    events_json: &str,
) -> Result<String, ComputeError> {
    let request = ExperimentRequest::from_json(request_json)?;
    let source = InMemoryEventSource::new(EventRowAdapter::parse_any(events_json)?);
    let as_of = request.as_of();

    let processor = ExperimentProcessor::new(request.config.clone());
    let result = processor.calculate(&request.experiment, request.metric()?, &source, as_of)?;
    processor.encoder.encode_result_to_json(&result, as_of)
}

/// Compute the cumulative exposure timeseries from JSON inputs
pub fn exposure_timeseries_json(
    request_json: &str,
    events_json: &str,
) -> Result<String, ComputeError> {
    let request = ExperimentRequest::from_json(request_json)?;
    let source = InMemoryEventSource::new(EventRowAdapter::parse_any(events_json)?);
    let as_of = request.as_of();

    let processor = ExperimentProcessor::new(request.config.clone());
    let timeseries = processor.exposure_timeseries(&request.experiment, &source, as_of)?;
    processor.encoder.encode_timeseries_to_json(&timeseries, as_of)
}

/// Check the resolved exposures; every missing piece is reported at once
pub fn check_exposures(
    experiment: &Experiment,
    decisions: &ExposureDecisions,
) -> Result<(), ExperimentValidationError> {
    let validation = ExperimentValidationError {
        no_exposures: decisions.is_empty(),
        no_control_variant: decisions.count_for(CONTROL_VARIANT) == 0,
        no_test_variant: experiment
            .test_variant_keys()
            .all(|key| decisions.count_for(key) == 0),
    };
    if validation.has_errors() {
        return Err(validation);
    }
    Ok(())
}

/// Runs experiment computations for one team configuration
pub struct ExperimentProcessor {
    config: EngineConfig,
    encoder: ResultEncoder,
}

impl Default for ExperimentProcessor {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ExperimentProcessor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            encoder: ResultEncoder::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn encoder(&self) -> &ResultEncoder {
        &self.encoder
    }

    /// Resolve one exposure decision per subject
    pub fn resolve_exposures(
        &self,
        experiment: &Experiment,
        breakdown: &BreakdownSpec,
        source: &dyn EventSource,
        as_of: DateTime<Utc>,
    ) -> Result<ExposureDecisions, ComputeError> {
        experiment.validate()?;
        let resolver = ExposureResolver::new(experiment, breakdown, &self.config, as_of)?;

        let mut rows: Vec<EventRow> = Vec::new();
        source.fetch(&resolver.query(), self.config.batch_size, &mut |batch| {
            rows.extend(batch.into_iter().filter(|row| resolver.is_exposure(row)))
        })?;

        Ok(resolver.resolve(&rows))
    }

    /// Compute sufficient statistics for `metric`
    pub fn calculate(
        &self,
        experiment: &Experiment,
        metric: &Metric,
        source: &dyn EventSource,
        as_of: DateTime<Utc>,
    ) -> Result<ExperimentResult, ComputeError> {
        metric.validate()?;
        let decisions = self.resolve_exposures(experiment, metric.breakdown(), source, as_of)?;
        check_exposures(experiment, &decisions).map_err(ComputeError::Validation)?;

        let window = experiment.analysis_window(as_of);
        let ctx = EvaluationContext::new(window, metric.conversion_window())?;
        let query = evaluators::metric_query(metric, &window, &self.config)?;
        let test_account_filters: &[PropertyFilter] = if experiment.filter_test_accounts {
            self.config.test_account_filters.as_slice()
        } else {
            &[]
        };

        let mut rows: Vec<EventRow> = Vec::new();
        source.fetch(&query, self.config.batch_size, &mut |batch| {
            rows.extend(batch.into_iter().filter(|row| {
                decisions
                    .get(&row.subject_id)
                    .is_some_and(|d| d.assignment.variant().is_some())
                    && matches_all(test_account_filters, row)
            }))
        })?;
        debug!(metric_rows = rows.len(), "Fetched metric rows");

        let by_subject = group_by_subject(&rows);
        let subjects: Vec<SubjectRows<'_>> = decisions
            .assigned()
            .map(|decision| SubjectRows {
                decision,
                rows: by_subject
                    .get(&decision.subject_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]),
            })
            .collect();

        let outcomes = evaluators::evaluate(metric, &subjects, &ctx, &self.config)?;
        let mut aggregator = Aggregator::new(metric.kind(), metric.funnel_steps());
        aggregator.extend(&outcomes);

        let result = assemble(experiment, metric, &aggregator)?;
        info!(
            flag_key = %experiment.flag_key,
            kind = ?result.kind,
            subjects = subjects.len(),
            baseline_samples = result.baseline.number_of_samples,
            "Computed experiment results"
        );
        Ok(result)
    }

    /// Cumulative first-exposure counts per day and variant
    pub fn exposure_timeseries(
        &self,
        experiment: &Experiment,
        source: &dyn EventSource,
        as_of: DateTime<Utc>,
    ) -> Result<ExposureTimeseries, ComputeError> {
        let decisions =
            self.resolve_exposures(experiment, &BreakdownSpec::default(), source, as_of)?;
        Ok(build_timeseries(
            &decisions,
            &experiment.all_variant_keys(),
            experiment.multiple_variant_handling,
            &experiment.analysis_window(as_of),
        ))
    }
}

fn assemble(
    experiment: &Experiment,
    metric: &Metric,
    aggregator: &Aggregator,
) -> Result<ExperimentResult, ComputeError> {
    let kind = metric.kind();
    let dimensioner =
        BreakdownDimensioner::new(experiment.all_variant_keys(), kind, metric.funnel_steps());

    let totals: Vec<VariantStats> = aggregator
        .totals()
        .into_iter()
        .map(|(key, acc)| acc.to_stats(key, None, kind))
        .collect();
    let (baseline, variants) = split_baseline(dimensioner.complete(totals))?;

    if metric.breakdown().is_empty() {
        return Ok(ExperimentResult {
            kind,
            baseline,
            variants,
            breakdown_results: None,
            breakdown_values: None,
        });
    }

    let rows = aggregator.stats();
    let breakdown_values = BreakdownDimensioner::observed_values(&rows)
        .into_iter()
        .flatten()
        .collect();
    let groups = dimensioner.group(rows)?;

    Ok(ExperimentResult {
        kind,
        baseline,
        variants,
        breakdown_results: Some(groups),
        breakdown_values: Some(breakdown_values),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionDefinition, ActionStep};
    use crate::error::SourceError;
    use crate::filters::PropertyOperator;
    use crate::metric::{
        FunnelMetric, FunnelOrderType, MathType, MeanMetric, MeanSource, MetricSource, RatioMetric,
    };
    use crate::types::{
        BreakdownValue, ExposureCriterion, MultipleVariantHandling, FEATURE_FLAG_CALLED_EVENT,
        FEATURE_FLAG_PROPERTY, FEATURE_FLAG_RESPONSE_PROPERTY, MULTIPLE_VARIANT_KEY,
    };
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, day, hour, minute, 0).unwrap()
    }

    fn experiment() -> Experiment {
        Experiment {
            flag_key: "new-checkout".to_string(),
            variants: vec!["control".to_string(), "test".to_string()],
            holdout: None,
            start_date: at(1, 0, 0),
            end_date: Some(at(31, 0, 0)),
            exposure_criterion: ExposureCriterion::default(),
            multiple_variant_handling: MultipleVariantHandling::Exclude,
            filter_test_accounts: false,
        }
    }

    fn exposure(subject: &str, variant: &str, ts: DateTime<Utc>) -> EventRow {
        EventRow::new(subject, FEATURE_FLAG_CALLED_EVENT, ts)
            .with_property(FEATURE_FLAG_PROPERTY, "new-checkout")
            .with_property(FEATURE_FLAG_RESPONSE_PROPERTY, variant)
    }

    /// 10 control + 10 test subjects exposed on Jan 2 at noon; 6 control and
    /// 8 test subjects purchase a minute later.
    fn scenario_rows() -> Vec<EventRow> {
        let mut rows = Vec::new();
        for (variant, buyers) in [("control", 6), ("test", 8)] {
            for i in 0..10 {
                let subject = format!("{variant}-{i}");
                rows.push(exposure(&subject, variant, at(2, 12, 0)));
                if i < buyers {
                    rows.push(EventRow::new(subject.as_str(), "purchase", at(2, 12, 1)));
                }
            }
        }
        rows
    }

    #[test]
    fn test_end_to_end_purchase_counts() {
        let source = InMemoryEventSource::new(scenario_rows());
        let result = ExperimentProcessor::default()
            .calculate(
                &experiment(),
                &Metric::Mean(MeanMetric::count("purchase")),
                &source,
                at(31, 0, 0),
            )
            .unwrap();

        assert_eq!(result.baseline.key, "control");
        assert_eq!(result.baseline.number_of_samples, 10);
        assert_eq!(result.baseline.sum, 6.0);
        assert_eq!(result.variants.len(), 1);
        assert_eq!(result.variants[0].key, "test");
        assert_eq!(result.variants[0].number_of_samples, 10);
        assert_eq!(result.variants[0].sum, 8.0);
        assert!(result.breakdown_results.is_none());
    }

    #[test]
    fn test_small_batches_give_same_result() {
        let source = InMemoryEventSource::new(scenario_rows());
        let processor = ExperimentProcessor::new(EngineConfig {
            batch_size: 3,
            ..Default::default()
        });
        let result = processor
            .calculate(
                &experiment(),
                &Metric::Mean(MeanMetric::count("purchase")),
                &source,
                at(31, 0, 0),
            )
            .unwrap();
        assert_eq!(result.variants[0].sum, 8.0);
    }

    #[test]
    fn test_exclude_subject_counts_nowhere() {
        let mut rows = scenario_rows();
        rows.push(exposure("both", "control", at(3, 0, 0)));
        rows.push(exposure("both", "test", at(3, 1, 0)));
        rows.push(EventRow::new("both", "purchase", at(3, 2, 0)));
        let source = InMemoryEventSource::new(rows);
        let exp = experiment();
        let processor = ExperimentProcessor::default();

        let result = processor
            .calculate(
                &exp,
                &Metric::Mean(MeanMetric::count("purchase")),
                &source,
                at(31, 0, 0),
            )
            .unwrap();
        assert_eq!(result.baseline.number_of_samples, 10);
        assert_eq!(result.variants[0].number_of_samples, 10);

        let ts = processor.exposure_timeseries(&exp, &source, at(31, 0, 0)).unwrap();
        assert_eq!(ts.total_exposures["control"], 10);
        assert_eq!(ts.total_exposures["test"], 10);
        assert_eq!(ts.total_exposures[MULTIPLE_VARIANT_KEY], 1);
    }

    #[test]
    fn test_first_seen_counts_conversions_after_first_exposure() {
        let mut exp = experiment();
        exp.multiple_variant_handling = MultipleVariantHandling::FirstSeen;
        let t1 = at(3, 0, 0);
        let t2 = at(4, 0, 0);
        let rows = vec![
            exposure("c", "control", at(2, 0, 0)),
            exposure("s", "test", t1),
            exposure("s", "control", t2),
            EventRow::new("s", "purchase", at(2, 12, 0)),
            EventRow::new("s", "purchase", at(3, 12, 0)),
            EventRow::new("s", "purchase", at(4, 12, 0)),
        ];
        let source = InMemoryEventSource::new(rows);
        let processor = ExperimentProcessor::default();
        let result = processor
            .calculate(
                &exp,
                &Metric::Mean(MeanMetric::count("purchase")),
                &source,
                at(31, 0, 0),
            )
            .unwrap();

        assert_eq!(result.baseline.number_of_samples, 1);
        assert_eq!(result.baseline.sum, 0.0);
        assert_eq!(result.variants[0].number_of_samples, 1);
        assert_eq!(result.variants[0].sum, 2.0);

        let ts = processor.exposure_timeseries(&exp, &source, at(31, 0, 0)).unwrap();
        assert!(!ts.series.contains_key(MULTIPLE_VARIANT_KEY));
        assert_eq!(ts.total_exposures["test"], 1);
    }

    #[test]
    fn test_validation_conditions_reported_together() {
        let source = InMemoryEventSource::new(vec![EventRow::new("u", "purchase", at(2, 0, 0))]);
        let err = ExperimentProcessor::default()
            .calculate(
                &experiment(),
                &Metric::Mean(MeanMetric::count("purchase")),
                &source,
                at(31, 0, 0),
            )
            .unwrap_err();

        match err {
            ComputeError::Validation(v) => assert_eq!(
                v,
                ExperimentValidationError {
                    no_exposures: true,
                    no_control_variant: true,
                    no_test_variant: true,
                }
            ),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_test_variant_only() {
        let source = InMemoryEventSource::new(vec![exposure("u", "control", at(2, 0, 0))]);
        let err = ExperimentProcessor::default()
            .calculate(
                &experiment(),
                &Metric::Mean(MeanMetric::count("purchase")),
                &source,
                at(31, 0, 0),
            )
            .unwrap_err();
        let user = err.user_facing();
        assert_eq!(user.conditions, vec!["NO_TEST_VARIANT".to_string()]);
    }

    #[test]
    fn test_source_failure_propagates() {
        let source = InMemoryEventSource::failing(SourceError::MemoryLimitExceeded);
        let err = ExperimentProcessor::default()
            .calculate(
                &experiment(),
                &Metric::Mean(MeanMetric::count("purchase")),
                &source,
                at(31, 0, 0),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Source(SourceError::MemoryLimitExceeded)
        ));
        assert!(err.user_facing().retryable);
    }

    #[test]
    fn test_unknown_action_fails_before_reading_events() {
        let source = InMemoryEventSource::failing(SourceError::Timeout);
        let mut metric = MeanMetric::count("purchase");
        metric.source = MetricSource::Action {
            id: 12,
            properties: vec![],
            fixed_properties: vec![],
        };
        let mut exp = experiment();
        exp.exposure_criterion.source = Some(metric.source.clone());

        let err = ExperimentProcessor::default()
            .calculate(&exp, &Metric::Mean(metric), &source, at(31, 0, 0))
            .unwrap_err();
        assert!(matches!(err, ComputeError::UnsupportedSource(_)));
        assert!(err.to_string().contains("unknown action id 12"));
    }

    #[test]
    fn test_breakdown_zero_fills_missing_variant() {
        let rows = vec![
            exposure("a", "control", at(2, 0, 0)).with_property("$browser", "Chrome"),
            exposure("b", "test", at(2, 0, 0)).with_property("$browser", "Chrome"),
            exposure("c", "control", at(2, 0, 0)).with_property("$browser", "Safari"),
            EventRow::new("a", "purchase", at(2, 1, 0)),
            EventRow::new("c", "purchase", at(2, 1, 0)),
        ];
        let mut metric = MeanMetric::count("purchase");
        metric.breakdown = BreakdownSpec {
            properties: vec!["$browser".to_string()],
        };
        let result = ExperimentProcessor::default()
            .calculate(
                &experiment(),
                &Metric::Mean(metric),
                &InMemoryEventSource::new(rows),
                at(31, 0, 0),
            )
            .unwrap();

        let chrome = BreakdownValue::new(vec![Some("Chrome".to_string())]);
        let safari = BreakdownValue::new(vec![Some("Safari".to_string())]);
        assert_eq!(
            result.breakdown_values,
            Some(vec![chrome.clone(), safari.clone()])
        );

        let groups = result.breakdown_results.unwrap();
        let safari_group = groups
            .iter()
            .find(|g| g.breakdown_value == safari)
            .unwrap();
        assert_eq!(safari_group.baseline.number_of_samples, 1);
        assert_eq!(safari_group.baseline.sum, 1.0);
        assert_eq!(safari_group.variants[0].key, "test");
        assert_eq!(safari_group.variants[0].number_of_samples, 0);

        assert_eq!(result.baseline.number_of_samples, 2);
        assert_eq!(result.baseline.sum, 2.0);
        assert_eq!(result.variants[0].number_of_samples, 1);
    }

    #[test]
    fn test_funnel_end_to_end() {
        let rows = vec![
            exposure("a", "control", at(2, 0, 0)),
            exposure("b", "test", at(2, 0, 0)),
            EventRow::new("a", "$pageview", at(2, 1, 0)),
            EventRow::new("a", "purchase", at(2, 2, 0)),
            EventRow::new("b", "purchase", at(2, 1, 0)),
            EventRow::new("b", "$pageview", at(2, 2, 0)),
        ];
        let metric = Metric::Funnel(FunnelMetric {
            series: vec![MetricSource::event("$pageview"), MetricSource::event("purchase")],
            funnel_order_type: FunnelOrderType::Ordered,
            conversion_window: None,
            breakdown: BreakdownSpec::default(),
        });
        let result = ExperimentProcessor::default()
            .calculate(
                &experiment(),
                &metric,
                &InMemoryEventSource::new(rows),
                at(31, 0, 0),
            )
            .unwrap();

        assert_eq!(result.baseline.sum, 1.0);
        assert_eq!(result.baseline.step_counts, Some(vec![1, 1]));
        assert_eq!(result.variants[0].sum, 0.0);
        assert_eq!(result.variants[0].step_counts, Some(vec![1, 0]));
    }

    #[test]
    fn test_test_accounts_filtered_from_metric_rows() {
        let mut exp = experiment();
        exp.filter_test_accounts = true;
        let config = EngineConfig {
            test_account_filters: vec![PropertyFilter::new(
                "is_internal",
                PropertyOperator::IsNot,
                Some(true.into()),
            )],
            ..Default::default()
        };
        let rows = vec![
            exposure("a", "control", at(2, 0, 0)),
            exposure("b", "test", at(2, 0, 0)),
            EventRow::new("a", "purchase", at(2, 1, 0)),
            EventRow::new("a", "purchase", at(2, 2, 0)).with_property("is_internal", true),
        ];
        let result = ExperimentProcessor::new(config)
            .calculate(
                &exp,
                &Metric::Mean(MeanMetric::count("purchase")),
                &InMemoryEventSource::new(rows),
                at(31, 0, 0),
            )
            .unwrap();
        assert_eq!(result.baseline.sum, 1.0);
    }

    #[test]
    fn test_action_metric_and_holdout() {
        let mut exp = experiment();
        exp.holdout = Some(crate::types::Holdout { id: 9 });
        let config = EngineConfig {
            actions: vec![ActionDefinition {
                id: 1,
                name: "paid".to_string(),
                steps: vec![ActionStep {
                    event: Some("purchase".to_string()),
                    properties: vec![],
                }],
            }],
            ..Default::default()
        };
        let mut metric = MeanMetric::count("unused");
        metric.source = MetricSource::Action {
            id: 1,
            properties: vec![],
            fixed_properties: vec![],
        };
        let rows = vec![
            exposure("a", "control", at(2, 0, 0)),
            exposure("b", "test", at(2, 0, 0)),
            EventRow::new("b", "purchase", at(2, 1, 0)),
        ];
        let result = ExperimentProcessor::new(config)
            .calculate(
                &exp,
                &Metric::Mean(metric),
                &InMemoryEventSource::new(rows),
                at(31, 0, 0),
            )
            .unwrap();

        assert_eq!(result.variants.len(), 2);
        assert_eq!(result.variants[0].sum, 1.0);
        assert_eq!(result.variants[1].key, "holdout-9");
        assert_eq!(result.variants[1].number_of_samples, 0);
    }

    #[test]
    fn test_json_api() {
        let request = r#"{
            "experiment": {
                "flag_key": "new-checkout",
                "variants": ["control", "test"],
                "start_date": "2020-01-01T00:00:00Z",
                "end_date": "2020-01-31T00:00:00Z"
            },
            "metric": {
                "kind": "mean",
                "source": { "kind": "event", "event": "purchase" }
            },
            "as_of": "2020-02-01T00:00:00Z"
        }"#;
        let events: String = scenario_rows()
            .iter()
            .map(|r| serde_json::to_string(r).unwrap())
            .collect::<Vec<_>>()
            .join("\n");

        let json = calculate_experiment_results(request, &events).unwrap();
        let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(payload["result"]["baseline"]["number_of_samples"], 10);
        assert_eq!(payload["result"]["variants"][0]["sum"], 8.0);

        let json = exposure_timeseries_json(request, &events).unwrap();
        let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(payload["result"]["total_exposures"]["test"], 10);
        assert_eq!(payload["result"]["days"].as_array().unwrap().len(), 31);
    }

    #[test]
    fn test_json_api_requires_metric() {
        let request = r#"{
            "experiment": {
                "flag_key": "f",
                "variants": ["control", "test"],
                "start_date": "2020-01-01T00:00:00Z"
            }
        }"#;
        let err = calculate_experiment_results(request, "[]").unwrap_err();
        assert!(matches!(err, ComputeError::MissingField(_)));
    }

    #[test]
    fn test_ratio_end_to_end() {
        let rows = vec![
            exposure("c0", "control", at(2, 0, 0)),
            exposure("c1", "control", at(2, 0, 0)),
            exposure("t0", "test", at(2, 0, 0)),
            exposure("t1", "test", at(2, 0, 0)),
            EventRow::new("c0", "$pageview", at(2, 1, 0)),
            EventRow::new("c0", "$pageview", at(2, 2, 0)),
            EventRow::new("c0", "purchase", at(2, 3, 0)).with_property("revenue", 10.0),
            EventRow::new("c1", "$pageview", at(2, 1, 0)),
            EventRow::new("t0", "$pageview", at(2, 1, 0)),
            EventRow::new("t0", "purchase", at(2, 2, 0)).with_property("revenue", 20.0),
            EventRow::new("t0", "purchase", at(2, 3, 0)).with_property("revenue", 5.0),
        ];
        let metric = Metric::Ratio(RatioMetric {
            numerator: MeanSource {
                source: MetricSource::event("purchase"),
                math: MathType::Sum,
                math_property: Some("revenue".to_string()),
                expression: None,
            },
            denominator: MeanSource {
                source: MetricSource::event("$pageview"),
                math: MathType::Total,
                math_property: None,
                expression: None,
            },
            conversion_window: None,
            breakdown: Default::default(),
        });
        let source = InMemoryEventSource::new(rows);
        let result = ExperimentProcessor::default()
            .calculate(&experiment(), &metric, &source, at(31, 0, 0))
            .unwrap();

        let control = &result.baseline;
        assert_eq!(control.number_of_samples, 2);
        assert_eq!(control.sum, 10.0);
        assert_eq!(control.sum_squares, 100.0);
        assert_eq!(control.denominator_sum, Some(3.0));
        assert_eq!(control.denominator_sum_squares, Some(5.0));
        assert_eq!(control.numerator_denominator_sum_product, Some(20.0));

        let test = &result.variants[0];
        assert_eq!(test.number_of_samples, 2);
        assert_eq!(test.sum, 25.0);
        assert_eq!(test.sum_squares, 625.0);
        assert_eq!(test.denominator_sum, Some(1.0));
        assert_eq!(test.denominator_sum_squares, Some(1.0));
        assert_eq!(test.numerator_denominator_sum_product, Some(25.0));
    }

    #[test]
    fn test_open_ended_experiment_stops_before_as_of() {
        let mut exp = experiment();
        exp.end_date = None;
        let as_of = at(10, 0, 0);
        let rows = vec![
            exposure("c", "control", at(2, 0, 0)),
            exposure("t", "test", at(2, 0, 0)),
            exposure("late", "control", as_of),
            EventRow::new("c", "purchase", as_of),
            EventRow::new("t", "purchase", at(9, 23, 59)),
            EventRow::new("t", "purchase", as_of),
        ];
        let source = InMemoryEventSource::new(rows);
        let processor = ExperimentProcessor::default();

        let result = processor
            .calculate(&exp, &Metric::Mean(MeanMetric::count("purchase")), &source, as_of)
            .unwrap();
        assert_eq!(result.baseline.number_of_samples, 1);
        assert_eq!(result.baseline.sum, 0.0);
        assert_eq!(result.variants[0].number_of_samples, 1);
        assert_eq!(result.variants[0].sum, 1.0);

        let ts = processor.exposure_timeseries(&exp, &source, as_of).unwrap();
        assert_eq!(ts.total_exposures["control"], 1);
        assert_eq!(ts.days.len(), 10);
    }

    #[test]
    fn test_first_seen_tie_is_reproducible_without_uuids() {
        let request = r#"{
            "experiment": {
                "flag_key": "new-checkout",
                "variants": ["control", "test"],
                "start_date": "2020-01-01T00:00:00Z",
                "end_date": "2020-01-31T00:00:00Z",
                "multiple_variant_handling": "first_seen"
            },
            "metric": {
                "kind": "mean",
                "source": { "kind": "event", "event": "purchase" }
            },
            "as_of": "2020-02-01T00:00:00Z"
        }"#;
        let line = |subject: &str, variant: &str| {
            format!(
                r#"{{"subject_id":"{subject}","event":"$feature_flag_called","timestamp":"2020-01-02T00:00:00Z","properties":{{"$feature_flag":"new-checkout","$feature_flag_response":"{variant}"}}}}"#
            )
        };
        let events = [line("s", "control"), line("s", "test"), line("t", "test")].join("\n");

        let results: Vec<serde_json::Value> = (0..20)
            .map(|_| {
                let json = calculate_experiment_results(request, &events).unwrap();
                let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
                payload["result"].clone()
            })
            .collect();

        assert_eq!(results[0]["baseline"]["number_of_samples"], 1);
        assert_eq!(results[0]["variants"][0]["number_of_samples"], 1);
        assert!(results.iter().all(|r| *r == results[0]));
    }

    #[test]
    fn test_out_of_range_conversion_window_is_rejected() {
        let mut metric = MeanMetric::count("purchase");
        metric.conversion_window = Some(crate::types::ConversionWindow {
            value: i64::MAX / 2,
            unit: crate::types::WindowUnit::Week,
        });
        let source = InMemoryEventSource::new(scenario_rows());
        let err = ExperimentProcessor::default()
            .calculate(&experiment(), &Metric::Mean(metric), &source, at(31, 0, 0))
            .unwrap_err();

        assert!(matches!(err, ComputeError::InvalidConfig(_)));
        assert!(!err.user_facing().retryable);
    }
}
