//! Team-level engine configuration
//!
//! Everything that influences filtering beyond the experiment itself lives
//! here and is passed explicitly to every run.

use crate::error::ComputeError;
use crate::filters::PropertyFilter;
use serde::{Deserialize, Serialize};

/// Default number of rows requested per batch from the event source
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// One way an action can be matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    /// Event name; `None` matches any event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyFilter>,
}

/// A saved action: matches an event when any step matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<ActionStep>,
}

/// Engine configuration for one team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Action definitions referenced by metric sources
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
    /// Internal-traffic filter; rows must satisfy all of these when an
    /// experiment filters test accounts
    #[serde(default)]
    pub test_account_filters: Vec<PropertyFilter>,
    /// Rows requested per batch from the event source
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            test_account_filters: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    /// Look up an action by id
    pub fn action(&self, id: i64) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.batch_size == 0 {
            return Err(ComputeError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        for filter in &self.test_account_filters {
            filter.validate()?;
        }
        Ok(())
    }

    /// Load configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
