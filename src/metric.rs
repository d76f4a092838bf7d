//! Metric definitions
//!
//! The set of metric kinds is closed: mean, funnel and ratio. Each kind is
//! evaluated by its own function in [`crate::evaluators`].

use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::expression::{Aggregation, AggregationExpression};
use crate::filters::{PropertyFilter, SourceMatcher};
use crate::schema::EventRow;
use crate::types::{ConversionWindow, MetricKind};
use serde::{Deserialize, Serialize};

/// Where metric rows come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSource {
    /// An event by name; `None` matches every event
    Event {
        #[serde(default)]
        event: Option<String>,
        #[serde(default)]
        properties: Vec<PropertyFilter>,
        #[serde(default)]
        fixed_properties: Vec<PropertyFilter>,
    },
    /// A saved action from the team configuration
    Action {
        id: i64,
        #[serde(default)]
        properties: Vec<PropertyFilter>,
        #[serde(default)]
        fixed_properties: Vec<PropertyFilter>,
    },
    /// Rows of an external table joined to subjects upstream
    ExternalTable {
        table_name: String,
        #[serde(default)]
        properties: Vec<PropertyFilter>,
        #[serde(default)]
        fixed_properties: Vec<PropertyFilter>,
    },
}

impl MetricSource {
    pub fn event(name: impl Into<String>) -> Self {
        MetricSource::Event {
            event: Some(name.into()),
            properties: Vec::new(),
            fixed_properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, filter: PropertyFilter) -> Self {
        match &mut self {
            MetricSource::Event { properties, .. }
            | MetricSource::Action { properties, .. }
            | MetricSource::ExternalTable { properties, .. } => properties.push(filter),
        }
        self
    }
}

/// How a subject's matching events reduce to one number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathType {
    /// Event count
    #[default]
    Total,
    /// Sum of `math_property`
    Sum,
    Avg,
    Min,
    Max,
    /// Distinct `$session_id` values
    UniqueSession,
    /// Custom aggregation expression
    Hogql,
}

/// Property carrying the session id
pub const SESSION_ID_PROPERTY: &str = "$session_id";

/// Property names used to link rows of one trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSpec {
    #[serde(default = "default_trace_id_property")]
    pub trace_id_property: String,
    #[serde(default = "default_span_id_property")]
    pub span_id_property: String,
    #[serde(default = "default_parent_id_property")]
    pub parent_id_property: String,
}

fn default_trace_id_property() -> String {
    "$ai_trace_id".to_string()
}

fn default_span_id_property() -> String {
    "$ai_span_id".to_string()
}

fn default_parent_id_property() -> String {
    "$ai_parent_id".to_string()
}

impl Default for TraceSpec {
    fn default() -> Self {
        Self {
            trace_id_property: default_trace_id_property(),
            span_id_property: default_span_id_property(),
            parent_id_property: default_parent_id_property(),
        }
    }
}

/// Property keys to split results by
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakdownSpec {
    #[serde(default)]
    pub properties: Vec<String>,
}

impl BreakdownSpec {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// A value source: rows plus the math that reduces them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanSource {
    pub source: MetricSource,
    #[serde(default)]
    pub math: MathType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub math_property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Per-subject count or sum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanMetric {
    pub source: MetricSource,
    #[serde(default)]
    pub math: MathType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub math_property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound_percentile: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound_percentile: Option<f64>,
    /// Collapse hierarchical trace rows before summing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_window: Option<ConversionWindow>,
    #[serde(default)]
    pub breakdown: BreakdownSpec,
}

impl MeanMetric {
    /// A `Total` count of `event`
    pub fn count(event: impl Into<String>) -> Self {
        Self {
            source: MetricSource::event(event),
            math: MathType::Total,
            math_property: None,
            expression: None,
            lower_bound_percentile: None,
            upper_bound_percentile: None,
            trace: None,
            conversion_window: None,
            breakdown: BreakdownSpec::default(),
        }
    }

    /// A `Sum` of `property` over `event`
    pub fn sum(event: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            math: MathType::Sum,
            math_property: Some(property.into()),
            ..Self::count(event)
        }
    }
}

/// Step ordering rule for funnels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelOrderType {
    #[default]
    Ordered,
    Unordered,
}

/// Conversion through an ordered series of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelMetric {
    pub series: Vec<MetricSource>,
    #[serde(default)]
    pub funnel_order_type: FunnelOrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_window: Option<ConversionWindow>,
    #[serde(default)]
    pub breakdown: BreakdownSpec,
}

/// Σ numerator / Σ denominator per variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioMetric {
    pub numerator: MeanSource,
    pub denominator: MeanSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_window: Option<ConversionWindow>,
    #[serde(default)]
    pub breakdown: BreakdownSpec,
}

/// An experiment metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    Mean(MeanMetric),
    Funnel(FunnelMetric),
    Ratio(RatioMetric),
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Mean(_) => MetricKind::Mean,
            Metric::Funnel(_) => MetricKind::Funnel,
            Metric::Ratio(_) => MetricKind::Ratio,
        }
    }

    pub fn breakdown(&self) -> &BreakdownSpec {
        match self {
            Metric::Mean(m) => &m.breakdown,
            Metric::Funnel(m) => &m.breakdown,
            Metric::Ratio(m) => &m.breakdown,
        }
    }

    pub fn conversion_window(&self) -> Option<ConversionWindow> {
        match self {
            Metric::Mean(m) => m.conversion_window,
            Metric::Funnel(m) => m.conversion_window,
            Metric::Ratio(m) => m.conversion_window,
        }
    }

    /// Number of funnel steps (0 for other kinds)
    pub fn funnel_steps(&self) -> usize {
        match self {
            Metric::Funnel(m) => m.series.len(),
            _ => 0,
        }
    }

    /// Check internal consistency; fails fast on malformed definitions
    pub fn validate(&self) -> Result<(), ComputeError> {
        if let Some(window) = self.conversion_window() {
            if window.value <= 0 {
                return Err(ComputeError::InvalidConfig(format!(
                    "conversion window must be positive, got {}",
                    window.value
                )));
            }
            window.to_duration()?;
        }

        match self {
            Metric::Mean(m) => {
                validate_math(m.math, m.math_property.as_deref(), m.expression.as_deref())?;
                validate_percentiles(m.lower_bound_percentile, m.upper_bound_percentile)?;
                if m.trace.is_some() && m.math != MathType::Sum {
                    return Err(ComputeError::InvalidConfig(format!(
                        "trace reduction requires math \"sum\", got {:?}",
                        m.math
                    )));
                }
                Ok(())
            }
            Metric::Funnel(m) => {
                if m.series.is_empty() {
                    return Err(ComputeError::InvalidConfig(
                        "funnel metric needs at least one step".to_string(),
                    ));
                }
                Ok(())
            }
            Metric::Ratio(m) => {
                validate_math(
                    m.numerator.math,
                    m.numerator.math_property.as_deref(),
                    m.numerator.expression.as_deref(),
                )?;
                validate_math(
                    m.denominator.math,
                    m.denominator.math_property.as_deref(),
                    m.denominator.expression.as_deref(),
                )
            }
        }
    }
}

fn validate_math(
    math: MathType,
    math_property: Option<&str>,
    expression: Option<&str>,
) -> Result<(), ComputeError> {
    match math {
        MathType::Sum | MathType::Avg | MathType::Min | MathType::Max => {
            if math_property.map(str::trim).unwrap_or("").is_empty() {
                return Err(ComputeError::MissingField(format!(
                    "math_property (required for math {math:?})"
                )));
            }
        }
        MathType::Hogql => {
            let expression = expression.ok_or_else(|| {
                ComputeError::MissingField("expression (required for math Hogql)".to_string())
            })?;
            AggregationExpression::parse(expression)?;
        }
        MathType::Total | MathType::UniqueSession => {}
    }
    Ok(())
}

fn validate_percentiles(lower: Option<f64>, upper: Option<f64>) -> Result<(), ComputeError> {
    for p in [lower, upper].into_iter().flatten() {
        if !(p > 0.0 && p < 1.0) {
            return Err(ComputeError::InvalidConfig(format!(
                "percentile bound {p} must be strictly between 0 and 1"
            )));
        }
    }
    if let (Some(lo), Some(hi)) = (lower, upper) {
        if lo >= hi {
            return Err(ComputeError::InvalidConfig(format!(
                "lower percentile {lo} must be below upper percentile {hi}"
            )));
        }
    }
    Ok(())
}

/// Row matcher plus per-subject reduction, compiled once per run
#[derive(Debug, Clone)]
pub struct CompiledValue {
    pub matcher: SourceMatcher,
    math: MathType,
    math_property: Option<String>,
    expression: Option<AggregationExpression>,
}

impl CompiledValue {
    pub fn compile(
        source: &MetricSource,
        math: MathType,
        math_property: Option<&str>,
        expression: Option<&str>,
        config: &EngineConfig,
    ) -> Result<Self, ComputeError> {
        validate_math(math, math_property, expression)?;
        let expression = match (math, expression) {
            (MathType::Hogql, Some(e)) => Some(AggregationExpression::parse(e)?),
            _ => None,
        };
        Ok(Self {
            matcher: SourceMatcher::compile(source, config)?,
            math,
            math_property: math_property.map(str::to_string),
            expression,
        })
    }

    pub fn from_mean_source(
        source: &MeanSource,
        config: &EngineConfig,
    ) -> Result<Self, ComputeError> {
        Self::compile(
            &source.source,
            source.math,
            source.math_property.as_deref(),
            source.expression.as_deref(),
            config,
        )
    }

    pub fn matches(&self, row: &EventRow) -> bool {
        self.matcher.matches(row)
    }

    /// Numeric value of `math_property` on a row; non-numeric counts as 0
    pub fn property_value(&self, row: &EventRow) -> f64 {
        self.math_property
            .as_deref()
            .and_then(|key| row.property(key))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }

    /// Optional numeric value of `math_property`, used for trace nodes
    pub fn optional_property_value(&self, row: &EventRow) -> Option<f64> {
        self.math_property
            .as_deref()
            .and_then(|key| row.property(key))
            .and_then(|v| v.as_f64())
    }

    /// Reduce a subject's already-matched rows to one value
    pub fn reduce(&self, rows: &[&EventRow]) -> f64 {
        match self.math {
            MathType::Total => rows.len() as f64,
            MathType::Sum => self.reduce_property(rows, Aggregation::Sum),
            MathType::Avg => self.reduce_property(rows, Aggregation::Avg),
            MathType::Min => self.reduce_property(rows, Aggregation::Min),
            MathType::Max => self.reduce_property(rows, Aggregation::Max),
            MathType::UniqueSession => {
                let sessions: std::collections::BTreeSet<String> = rows
                    .iter()
                    .filter_map(|r| r.property(SESSION_ID_PROPERTY))
                    .filter_map(|v| v.to_key_string())
                    .collect();
                sessions.len() as f64
            }
            MathType::Hogql => match &self.expression {
                Some(expr) => expr.evaluate(rows.iter().copied()),
                None => 0.0,
            },
        }
    }

    fn reduce_property(&self, rows: &[&EventRow], aggregation: Aggregation) -> f64 {
        let values: Vec<f64> = rows.iter().map(|r| self.property_value(r)).collect();
        aggregation.reduce(&values)
    }
}
