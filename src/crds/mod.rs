pub mod countermeasure;
pub mod prometheus_source;

pub use countermeasure::*;
pub use prometheus_source::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "countermeasure.io";
pub const VERSION: &str = "v1alpha1";

/// Condition reported on the status of both resources.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResourceCondition {
    /// `Ready` condition stamped with the current time.
    pub fn ready(ready: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}
