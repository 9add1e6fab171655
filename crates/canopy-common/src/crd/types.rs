//! Status conditions shared by Workspace and WorkloadCluster

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `True`, `False` or `Unknown`
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    #[allow(missing_docs)]
    True,
    #[allow(missing_docs)]
    False,
    #[allow(missing_docs)]
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// One entry of `status.conditions`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,

    #[allow(missing_docs)]
    pub status: ConditionStatus,

    /// CamelCase reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// When `status` last changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// True if `conditions` contains `type_` with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    matches!(
        conditions.iter().find(|c| c.type_ == type_),
        Some(Condition {
            status: ConditionStatus::True,
            ..
        })
    )
}
