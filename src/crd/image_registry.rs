//! Image registry Config CRD
//!
//! The singleton `cluster` resource describing where the registry keeps its
//! blobs and reporting the health of the registry workload.

use crate::crd::conditions::{set_condition, ConditionStatus, OperatorCondition};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Volume;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Config CRD
// =============================================================================

/// Desired state of the image registry.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "imageregistry.operator.openshift.io",
    version = "v1",
    kind = "Config",
    root = "ImageRegistryConfig",
    derive = "PartialEq",
    plural = "configs",
    status = "ImageRegistryStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".spec.managementState"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistrySpec {
    /// Whether the operator manages, ignores or tears down the registry
    #[serde(default)]
    pub management_state: ManagementState,

    /// Storage backend for registry blobs
    #[serde(default)]
    pub storage: ImageRegistryConfigStorage,

    /// Desired registry replicas
    #[serde(default)]
    pub replicas: i32,

    /// Additional routes exposing the registry
    #[serde(default)]
    pub routes: Vec<ImageRegistryConfigRoute>,

    /// Expose the registry through the default route
    #[serde(default)]
    pub default_route: bool,

    /// Serve blobs directly instead of redirecting to the storage backend
    #[serde(default)]
    pub disable_redirect: bool,
}

/// Observed state of the image registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryStatus {
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,

    /// Storage the operator last reconciled successfully
    #[serde(default)]
    pub storage: ImageRegistryConfigStorage,

    /// True only for storage this operator created
    #[serde(default)]
    pub storage_managed: bool,

    /// Cloud resources created by the operator, as `kind/name`. Only these
    /// are deleted when the registry is removed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_resources: Vec<String>,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub ready_replicas: i32,
}

/// Additional route for the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryConfigRoute {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub secret_name: Option<String>,
}

// =============================================================================
// Management State
// =============================================================================

/// Management intent. Unknown values are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ManagementState {
    #[default]
    Managed,
    Unmanaged,
    Removed,
    Other(String),
}

impl ManagementState {
    pub fn as_str(&self) -> &str {
        match self {
            ManagementState::Managed => "Managed",
            ManagementState::Unmanaged => "Unmanaged",
            ManagementState::Removed => "Removed",
            ManagementState::Other(s) => s,
        }
    }
}

impl From<&str> for ManagementState {
    fn from(s: &str) -> Self {
        match s {
            "Managed" => ManagementState::Managed,
            "Unmanaged" => ManagementState::Unmanaged,
            "Removed" => ManagementState::Removed,
            other => ManagementState::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ManagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ManagementState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ManagementState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ManagementState::from(s.as_str()))
    }
}

impl JsonSchema for ManagementState {
    fn schema_name() -> String {
        "ManagementState".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

// =============================================================================
// Storage Union
// =============================================================================

/// Storage configuration. Exactly one backend payload may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryConfigStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<StorageAzure>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<StorageS3>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oss: Option<StorageOss>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ibmcos: Option<StorageIbmCos>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<StoragePvc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<StorageEmptyDir>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<StorageFilesystem>,

    /// Who owns the backing storage. Set once by the operator unless the
    /// user already chose a value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_state: Option<ManagementState>,
}

/// Discriminant of the configured storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageBackend {
    Azure,
    S3,
    Oss,
    IbmCos,
    Pvc,
    EmptyDir,
    Filesystem,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Azure => write!(f, "azure"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Oss => write!(f, "oss"),
            StorageBackend::IbmCos => write!(f, "ibmcos"),
            StorageBackend::Pvc => write!(f, "pvc"),
            StorageBackend::EmptyDir => write!(f, "emptydir"),
            StorageBackend::Filesystem => write!(f, "filesystem"),
        }
    }
}

impl ImageRegistryConfigStorage {
    /// The configured backend, `None` when no payload is set
    pub fn backend(&self) -> Result<Option<StorageBackend>> {
        let configured: Vec<StorageBackend> = [
            (self.azure.is_some(), StorageBackend::Azure),
            (self.s3.is_some(), StorageBackend::S3),
            (self.oss.is_some(), StorageBackend::Oss),
            (self.ibmcos.is_some(), StorageBackend::IbmCos),
            (self.pvc.is_some(), StorageBackend::Pvc),
            (self.empty_dir.is_some(), StorageBackend::EmptyDir),
            (self.filesystem.is_some(), StorageBackend::Filesystem),
        ]
        .into_iter()
        .filter_map(|(set, backend)| set.then_some(backend))
        .collect();

        match configured.as_slice() {
            [] => Ok(None),
            [backend] => Ok(Some(*backend)),
            many => Err(Error::MultipleStorageBackends(
                many.iter()
                    .map(|b| b.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    /// Set the storage management state unless the user already picked one
    pub fn default_management_state(&mut self, state: ManagementState) {
        if self.management_state.is_none() {
            self.management_state = Some(state);
        }
    }
}

/// Azure blob storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageAzure {
    #[serde(default)]
    pub account_name: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub cloud_name: String,
}

/// AWS S3
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageS3 {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub region_endpoint: String,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default, rename = "keyID")]
    pub key_id: String,
    #[serde(default)]
    pub virtual_hosted_style: bool,
}

/// IBM Cloud Object Storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageIbmCos {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub resource_group_name: String,
    #[serde(default, rename = "serviceInstanceCRN")]
    pub service_instance_crn: String,
    #[serde(default, rename = "resourceKeyCRN")]
    pub resource_key_crn: String,
}

/// Alibaba Cloud OSS
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageOss {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub encryption: Option<OssEncryption>,
}

/// OSS server side encryption
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OssEncryption {
    #[serde(default)]
    pub method: OssEncryptionMethod,
    #[serde(default, rename = "kmsKeyID")]
    pub kms_key_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum OssEncryptionMethod {
    #[default]
    #[serde(rename = "AES256")]
    Aes256,
    #[serde(rename = "KMS")]
    Kms,
}

/// Persistent volume claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoragePvc {
    #[serde(default)]
    pub claim: String,
}

/// Ephemeral pod storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StorageEmptyDir {}

/// User supplied volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageFilesystem {
    pub volume_source: Volume,
}

// =============================================================================
// Implementations
// =============================================================================

impl ImageRegistryConfig {
    /// Status, created on first access
    pub fn status_mut(&mut self) -> &mut ImageRegistryStatus {
        self.status.get_or_insert_with(ImageRegistryStatus::default)
    }

    pub fn conditions(&self) -> &[OperatorCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn condition(&self, condition_type: &str) -> Option<&OperatorCondition> {
        self.conditions()
            .iter()
            .find(|c| c.r#type == condition_type)
    }

    /// Upsert a condition stamped with the current time
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.set_condition_at(condition_type, status, reason, message, Utc::now());
    }

    pub fn set_condition_at(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let condition = OperatorCondition::new(condition_type, status, reason, message);
        set_condition(&mut self.status_mut().conditions, condition, now);
    }

    pub fn storage_managed(&self) -> bool {
        self.status.as_ref().map(|s| s.storage_managed).unwrap_or(false)
    }

    /// Remember that the operator created `kind/name`
    pub fn record_created(&mut self, kind: &str, name: &str) {
        let id = format!("{}/{}", kind, name);
        let status = self.status_mut();
        if !status.created_resources.contains(&id) {
            status.created_resources.push(id);
        }
        status.storage_managed = true;
    }

    /// Whether `kind/name` was created by the operator
    pub fn created(&self, kind: &str, name: &str) -> bool {
        let id = format!("{}/{}", kind, name);
        self.status
            .as_ref()
            .map_or(false, |s| s.created_resources.contains(&id))
    }

    pub fn forget_created(&mut self, kind: &str, name: &str) {
        let id = format!("{}/{}", kind, name);
        if let Some(status) = self.status.as_mut() {
            status.created_resources.retain(|r| *r != id);
        }
    }
}
