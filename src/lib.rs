//! Experiment Engine - Measurement core for A/B experiments
//!
//! The engine turns a raw event stream into per-variant sufficient statistics
//! through a deterministic pipeline: exposure resolution → per-subject metric
//! evaluation → aggregation → breakdown completion → result encoding.
//!
//! ## Modules
//!
//! - **Exposures**: One decision per subject, with EXCLUDE / FIRST_SEEN handling
//!   of subjects seen in several variants
//! - **Evaluators**: Mean, funnel and ratio metrics over the conversion window
//! - **Aggregation**: Sufficient statistics per `(variant, breakdown)` bucket,
//!   zero-filled so every pair is present

pub mod aggregation;
pub mod breakdown;
pub mod config;
pub mod encoder;
pub mod error;
pub mod evaluators;
pub mod exposure;
pub mod expression;
pub mod filters;
pub mod latency_tree;
pub mod metric;
pub mod outliers;
pub mod pipeline;
pub mod schema;
pub mod timeseries;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::EngineConfig;
pub use error::{ComputeError, ExperimentValidationError, SourceError, UserFacingError};
pub use metric::{FunnelMetric, MeanMetric, Metric, MetricSource, RatioMetric};
pub use pipeline::{
    calculate_experiment_results, exposure_timeseries_json, ExperimentProcessor,
    ExperimentRequest,
};
pub use types::{Experiment, ExperimentResult, ExposureTimeseries, VariantStats};

// Schema exports
pub use schema::{EventRow, EventRowAdapter, EventSource, InMemoryEventSource};

/// Engine version stamped into every result payload
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name for result payloads
pub const ENGINE_NAME: &str = "experiment-engine";
