//! Result encoding
//!
//! This module wraps engine output into versioned JSON payloads stamped with
//! the producing engine and the computation time.

use crate::error::ComputeError;
use crate::types::{ExperimentResult, ExposureTimeseries};
use crate::{ENGINE_NAME, ENGINE_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current result payload schema version
pub const RESULT_SCHEMA_VERSION: &str = "1.0.0";

/// Identity of the engine instance that produced a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// Envelope around a computation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload<T> {
    pub schema_version: String,
    pub engine: EngineInfo,
    pub computed_at: DateTime<Utc>,
    /// Evaluation time for open-ended experiments
    pub as_of: DateTime<Utc>,
    pub result: T,
}

/// Encoder for result payloads
pub struct ResultEncoder {
    instance_id: String,
}

impl Default for ResultEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultEncoder {
    /// Create a new encoder with a unique instance ID
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an encoder with a specific instance ID
    pub fn with_instance_id(instance_id: String) -> Self {
        Self { instance_id }
    }

    pub fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            name: ENGINE_NAME.to_string(),
            version: ENGINE_VERSION.to_string(),
            instance_id: self.instance_id.clone(),
        }
    }

    /// Wrap any result in an envelope
    pub fn encode<T>(&self, result: T, as_of: DateTime<Utc>) -> ResultPayload<T> {
        ResultPayload {
            schema_version: RESULT_SCHEMA_VERSION.to_string(),
            engine: self.engine_info(),
            computed_at: Utc::now(),
            as_of,
            result,
        }
    }

    /// Encode metric results to a JSON string
    pub fn encode_result_to_json(
        &self,
        result: &ExperimentResult,
        as_of: DateTime<Utc>,
    ) -> Result<String, ComputeError> {
        let payload = self.encode(result, as_of);
        serde_json::to_string_pretty(&payload).map_err(ComputeError::JsonError)
    }

    /// Encode an exposure timeseries to a JSON string
    pub fn encode_timeseries_to_json(
        &self,
        timeseries: &ExposureTimeseries,
        as_of: DateTime<Utc>,
    ) -> Result<String, ComputeError> {
        let payload = self.encode(timeseries, as_of);
        serde_json::to_string_pretty(&payload).map_err(ComputeError::JsonError)
    }
}
