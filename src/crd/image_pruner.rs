//! ImagePruner CRD
//!
//! Controls the CronJob that prunes unreferenced images from the registry.

use crate::crd::conditions::{set_condition, OperatorCondition};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of the image pruner
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "imageregistry.operator.openshift.io",
    version = "v1",
    kind = "ImagePruner",
    plural = "imagepruners",
    status = "ImagePrunerStatus",
    printcolumn = r#"{"name": "Schedule", "type": "string", "jsonPath": ".spec.schedule"}"#,
    printcolumn = r#"{"name": "Suspend", "type": "boolean", "jsonPath": ".spec.suspend"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ImagePrunerSpec {
    /// Cron schedule of the pruning job
    #[serde(default)]
    pub schedule: String,

    /// Stop scheduling new pruning jobs
    #[serde(default)]
    pub suspend: Option<bool>,

    /// Number of revisions per tag to keep
    #[serde(default)]
    pub keep_tag_revisions: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImagePrunerStatus {
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl ImagePruner {
    pub fn status_mut(&mut self) -> &mut ImagePrunerStatus {
        self.status.get_or_insert_with(ImagePrunerStatus::default)
    }

    pub fn conditions(&self) -> &[OperatorCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn upsert_condition(&mut self, condition: OperatorCondition, now: DateTime<Utc>) {
        set_condition(&mut self.status_mut().conditions, condition, now);
    }
}
