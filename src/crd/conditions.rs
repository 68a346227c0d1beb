//! Status conditions shared by the operator's custom resources
//!
//! Conditions are keyed by type. Upserting keeps `lastTransitionTime`
//! unless the status flips.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Registry condition types
pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";
pub const CONDITION_REMOVED: &str = "Removed";

// Storage condition types, written by drivers
pub const CONDITION_STORAGE_EXISTS: &str = "StorageExists";
pub const CONDITION_STORAGE_TAGGED: &str = "StorageTagged";
pub const CONDITION_STORAGE_ENCRYPTED: &str = "StorageEncrypted";
pub const CONDITION_STORAGE_UPLOAD_CLEANUP: &str = "StorageIncompleteUploadCleanupEnabled";
pub const CONDITION_STORAGE_PUBLIC_ACCESS_BLOCKED: &str = "StoragePublicAccessBlocked";

// Pruner condition types
pub const CONDITION_PRUNER_SCHEDULED: &str = "Scheduled";
pub const CONDITION_PRUNER_FAILED: &str = "Failed";

/// Condition status values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single named health record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the status changed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl OperatorCondition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Set or update a condition, preserving lastTransitionTime when the status
/// hasn't changed.
pub fn set_condition(
    conditions: &mut Vec<OperatorCondition>,
    mut new: OperatorCondition,
    now: DateTime<Utc>,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status || existing.last_transition_time.is_none() {
            new.last_transition_time = Some(now);
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        new.last_transition_time = Some(now);
        conditions.push(new);
    }
}

pub fn find_condition<'a>(
    conditions: &'a [OperatorCondition],
    condition_type: &str,
) -> Option<&'a OperatorCondition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}
