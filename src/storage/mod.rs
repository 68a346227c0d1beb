//! Storage Drivers
//!
//! Every storage backend implements [`Driver`]. The applier builds the
//! driver matching the configured backend through [`new_driver`], asks it
//! whether the storage exists, provisions it when needed and renders the
//! environment, volumes and secrets the registry workload consumes.
//!
//! Provisioning is idempotent: names are generated once, written into the
//! CR spec right away and never regenerated.

pub mod azure;
mod bucket;
pub mod envvar;
pub mod filesystem;
pub mod ibmcos;
pub mod naming;
pub mod oss;
pub mod pvc;
pub mod s3;

pub use envvar::{EnvSource, EnvVar, EnvVarList};

use crate::cache::CredentialCache;
use crate::config::CLOUD_CREDENTIALS_SECRET;
use crate::crd::{
    ConditionStatus, ImageRegistryConfig, ImageRegistryConfigStorage, ManagementState,
    StorageBackend, CONDITION_STORAGE_EXISTS,
};
use crate::domain::{AzureStorageApiRef, BucketApiRef, IbmResourceApiRef, Lister, ObjectApi};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Volume, VolumeMount};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the volume holding registry data
pub const STORAGE_VOLUME_NAME: &str = "registry-storage";

/// Mount point of the registry data volume
pub const STORAGE_MOUNT_PATH: &str = "/registry";

// =============================================================================
// Driver Contract
// =============================================================================

/// Lifecycle of one storage backend.
///
/// Methods taking the CR record their progress in it: generated names go
/// into `spec.storage`, health goes into storage conditions.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend identifier, including the resource name when known
    fn id(&self) -> String;

    /// Environment variables configuring the registry for this backend
    fn config_env(&self) -> Result<EnvVarList>;

    /// Volumes and mounts for the registry pod
    fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        Ok((Vec::new(), Vec::new()))
    }

    /// Secret values referenced from [`Driver::config_env`]
    async fn secrets(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    /// Secret values mounted as files through [`Driver::volumes`]
    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    /// Whether the configured storage exists. Sets `StorageExists`.
    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool>;

    /// Whether the desired storage differs from the last reconciled one
    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool;

    /// Provision or adopt the storage
    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()>;

    /// Delete storage created by the operator. Errors carry their own
    /// retry classification.
    async fn remove_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()>;
}

// =============================================================================
// Workload Storage Surface
// =============================================================================

/// Everything the registry workload needs to reach its storage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadStorage {
    pub env: EnvVarList,
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    /// Merged secret data for the private configuration secret
    pub secret_data: BTreeMap<String, String>,
}

impl WorkloadStorage {
    /// Render the workload surface from a driver
    pub async fn render(driver: &dyn Driver) -> Result<Self> {
        let env = driver.config_env()?;
        let (volumes, mounts) = driver.volumes()?;
        let mut secret_data = driver.secrets().await?;
        secret_data.extend(driver.volume_secrets().await?);
        Ok(Self {
            env,
            volumes,
            mounts,
            secret_data,
        })
    }
}

// =============================================================================
// Driver Context
// =============================================================================

/// Collaborators shared by every driver
#[derive(Clone)]
pub struct DriverContext {
    pub namespace: String,
    pub infrastructure_name: String,
    /// Region used when the backend payload carries none
    pub region: String,
    pub secrets: Arc<dyn Lister<Secret>>,
    pub claims: Arc<dyn ObjectApi<PersistentVolumeClaim>>,
    pub azure: Option<AzureStorageApiRef>,
    pub s3: Option<BucketApiRef>,
    pub oss: Option<BucketApiRef>,
    pub ibmcos: Option<BucketApiRef>,
    pub ibm_resources: Option<IbmResourceApiRef>,
    pub credentials: Arc<CredentialCache>,
    pub metrics: Arc<Metrics>,
}

impl DriverContext {
    /// Decoded data of the cloud credentials secret.
    ///
    /// A missing secret is transient (the credentials minter may not have
    /// run yet).
    pub fn cloud_credentials(&self) -> Result<CloudCredentials> {
        let secret = self.secrets.get(CLOUD_CREDENTIALS_SECRET).ok_or_else(|| {
            Error::CredentialsUnavailable(format!(
                "secret {}/{} not found",
                self.namespace, CLOUD_CREDENTIALS_SECRET
            ))
        })?;
        Ok(CloudCredentials::from_secret(&secret))
    }

    /// Tags applied to every resource the operator creates
    pub fn resource_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if !self.infrastructure_name.is_empty() {
            tags.insert(
                format!("kubernetes.io/cluster/{}", self.infrastructure_name),
                "owned".to_string(),
            );
        }
        tags.insert(
            "Name".to_string(),
            format!("{}-image-registry", self.infrastructure_name),
        );
        tags
    }

    fn port<T: Clone>(port: &Option<T>, backend: StorageBackend) -> Result<T> {
        port.clone().ok_or_else(|| {
            Error::Configuration(format!("no {} storage client is configured", backend))
        })
    }
}

/// String data of the cloud credentials secret
#[derive(Debug, Clone, Default)]
pub struct CloudCredentials(BTreeMap<String, String>);

impl CloudCredentials {
    pub fn from_secret(secret: &Secret) -> Self {
        let mut values = BTreeMap::new();
        if let Some(data) = &secret.data {
            for (key, value) in data {
                values.insert(key.clone(), String::from_utf8_lossy(&value.0).into_owned());
            }
        }
        if let Some(data) = &secret.string_data {
            values.extend(data.clone());
        }
        Self(values)
    }

    /// A required key; absence can only be fixed by editing the secret
    pub fn require(&self, key: &str) -> Result<String> {
        match self.0.get(key) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            _ => Err(Error::InvalidCredentials(format!(
                "{} is missing key {}",
                CLOUD_CREDENTIALS_SECRET, key
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

// =============================================================================
// Driver Factory
// =============================================================================

/// Build the driver for the single configured backend
pub fn new_driver(
    storage: &ImageRegistryConfigStorage,
    ctx: &DriverContext,
) -> Result<Box<dyn Driver>> {
    let backend = storage.backend()?.ok_or(Error::StorageNotConfigured)?;
    let ctx = ctx.clone();

    let driver: Box<dyn Driver> = match backend {
        StorageBackend::Azure => {
            let api = DriverContext::port(&ctx.azure, backend)?;
            Box::new(azure::AzureDriver::new(
                storage.azure.clone().unwrap_or_default(),
                api,
                ctx,
            ))
        }
        StorageBackend::S3 => {
            let api = DriverContext::port(&ctx.s3, backend)?;
            Box::new(s3::S3Driver::new(storage.s3.clone().unwrap_or_default(), api, ctx))
        }
        StorageBackend::IbmCos => {
            let buckets = DriverContext::port(&ctx.ibmcos, backend)?;
            let resources = DriverContext::port(&ctx.ibm_resources, backend)?;
            Box::new(ibmcos::IbmCosDriver::new(
                storage.ibmcos.clone().unwrap_or_default(),
                buckets,
                resources,
                ctx,
            ))
        }
        StorageBackend::Oss => {
            let api = DriverContext::port(&ctx.oss, backend)?;
            Box::new(oss::OssDriver::new(storage.oss.clone().unwrap_or_default(), api, ctx))
        }
        StorageBackend::Pvc => Box::new(pvc::PvcDriver::new(
            storage.pvc.clone().unwrap_or_default(),
            ctx,
        )),
        StorageBackend::EmptyDir => Box::new(filesystem::EmptyDirDriver::new()),
        StorageBackend::Filesystem => Box::new(filesystem::FilesystemDriver::new(
            storage.filesystem.clone().unwrap_or_default(),
        )),
    };

    Ok(driver)
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Record that the operator created the storage
pub(crate) fn mark_created(cr: &mut ImageRegistryConfig) {
    cr.spec
        .storage
        .default_management_state(ManagementState::Managed);
    cr.status_mut().storage_managed = true;
}

/// Record that the storage pre-existed and was adopted
pub(crate) fn mark_adopted(cr: &mut ImageRegistryConfig) {
    cr.spec
        .storage
        .default_management_state(ManagementState::Unmanaged);
}

/// Storage whose identifiers are still empty cannot exist yet
pub(crate) fn mark_not_configured(cr: &mut ImageRegistryConfig, what: &str) {
    cr.set_condition(
        CONDITION_STORAGE_EXISTS,
        ConditionStatus::False,
        "NotConfigured",
        format!("{} is not configured yet", what),
    );
}

/// Mirror the desired storage into status after a successful step
pub(crate) fn record_storage(cr: &mut ImageRegistryConfig) {
    let storage = cr.spec.storage.clone();
    cr.status_mut().storage = storage;
}

/// Whether the operator owns the storage described by the spec
pub(crate) fn is_managed(cr: &ImageRegistryConfig) -> bool {
    cr.spec.storage.management_state == Some(ManagementState::Managed)
}

/// Compare one backend payload of spec and status
pub(crate) fn payload_changed<T: PartialEq>(
    cr: &ImageRegistryConfig,
    payload: impl Fn(&ImageRegistryConfigStorage) -> &Option<T>,
) -> bool {
    match &cr.status {
        Some(status) => payload(&cr.spec.storage) != payload(&status.storage),
        None => payload(&cr.spec.storage).is_some(),
    }
}
