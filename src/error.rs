//! Error types for the experiment engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during computation
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Failed to parse input: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported metric source: {0}")]
    UnsupportedSource(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Experiment validation failed: {0}")]
    Validation(ExperimentValidationError),

    #[error("Event source failure: {0}")]
    Source(#[from] SourceError),
}

/// Business conditions that leave an experiment without results.
///
/// All flags are computed together so a caller can render every missing
/// piece at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentValidationError {
    pub no_exposures: bool,
    pub no_control_variant: bool,
    pub no_test_variant: bool,
}

impl ExperimentValidationError {
    /// True when at least one condition is set
    pub fn has_errors(&self) -> bool {
        self.no_exposures || self.no_control_variant || self.no_test_variant
    }

    /// Stable condition codes for every flag that is set
    pub fn codes(&self) -> Vec<&'static str> {
        let mut codes = Vec::new();
        if self.no_exposures {
            codes.push("NO_EXPOSURES");
        }
        if self.no_control_variant {
            codes.push("NO_CONTROL_VARIANT");
        }
        if self.no_test_variant {
            codes.push("NO_TEST_VARIANT");
        }
        codes
    }
}

impl fmt::Display for ExperimentValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.codes().join(", "))
    }
}

/// Infrastructure failures raised by the event retrieval layer.
///
/// These are not business conditions. Each maps to one retryable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("event store ran out of memory")]
    MemoryLimitExceeded,

    #[error("event store query timed out")]
    Timeout,

    #[error("too many simultaneous queries")]
    TooManyQueries,

    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Message safe to show to an end user
    pub fn user_facing_message(&self) -> &'static str {
        match self {
            SourceError::MemoryLimitExceeded => {
                "This experiment needs more memory than is available. Try a shorter date range or fewer breakdowns."
            }
            SourceError::Timeout => {
                "This experiment took too long to compute. Try a shorter date range."
            }
            SourceError::TooManyQueries => {
                "Too many queries are running right now. Please try again in a moment."
            }
            SourceError::Unavailable(_) => {
                "The event store is temporarily unavailable. Please try again shortly."
            }
            SourceError::Other(_) => "Something went wrong while loading events. Please try again.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        true
    }

    pub fn code(&self) -> &'static str {
        match self {
            SourceError::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            SourceError::Timeout => "QUERY_TIMEOUT",
            SourceError::TooManyQueries => "TOO_MANY_QUERIES",
            SourceError::Unavailable(_) => "SOURCE_UNAVAILABLE",
            SourceError::Other(_) => "SOURCE_ERROR",
        }
    }
}

/// Error shape handed to an HTTP/RPC boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

impl ComputeError {
    /// Map this error to its user-facing form, recording the original failure
    pub fn user_facing(&self) -> UserFacingError {
        match self {
            ComputeError::Validation(v) => UserFacingError {
                code: "EXPERIMENT_VALIDATION".to_string(),
                message: format!("Experiment has no results yet: {v}"),
                retryable: false,
                conditions: v.codes().iter().map(|c| c.to_string()).collect(),
            },
            ComputeError::Source(source) => {
                tracing::error!(error = %source, code = source.code(), "event source failure");
                UserFacingError {
                    code: source.code().to_string(),
                    message: source.user_facing_message().to_string(),
                    retryable: source.is_retryable(),
                    conditions: Vec::new(),
                }
            }
            other => {
                tracing::error!(error = %other, "experiment computation failed");
                UserFacingError {
                    code: "INVALID_REQUEST".to_string(),
                    message: other.to_string(),
                    retryable: false,
                    conditions: Vec::new(),
                }
            }
        }
    }
}
