//! In-memory collaborators for unit tests
//!
//! `MemoryObjects` behaves like an API server collection for one kind:
//! writes stamp a new resourceVersion, stale writes conflict, `replace`
//! leaves status alone and `replace_status` touches nothing but status.

use crate::adapters::cloud::{InMemoryAzure, InMemoryBuckets, InMemoryIbmResources};
use crate::cache::CredentialCache;
use crate::config::{CLOUD_CREDENTIALS_SECRET, DEFAULT_NAMESPACE, REGISTRY_RESOURCE_NAME};
use crate::crd::{ImageRegistryConfig, ImageRegistrySpec, ManagementState};
use crate::domain::{Lister, ObjectApi, WorkloadApplier};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::storage::{DriverContext, WorkloadStorage};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::Resource;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Object Store
// =============================================================================

pub struct MemoryObjects<K> {
    kind: &'static str,
    objects: RwLock<BTreeMap<String, K>>,
    version: AtomicU64,
    writes: AtomicUsize,
}

impl<K> MemoryObjects<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn object(&self, name: &str) -> Option<K> {
        self.objects.read().get(name).cloned()
    }

    /// Seed or overwrite an object without version checks
    pub fn insert(&self, mut obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        obj.meta_mut().resource_version = Some(self.next_version());
        self.objects.write().insert(name, obj);
    }

    pub fn remove(&self, name: &str) {
        self.objects.write().remove(name);
    }

    /// Number of successful create/replace/replace_status calls
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn name_of(obj: &K) -> String {
        obj.meta().name.clone().unwrap_or_default()
    }

    fn check_version(&self, existing: &K, obj: &K) -> Result<()> {
        match &obj.meta().resource_version {
            Some(version) if Some(version) != existing.meta().resource_version.as_ref() => {
                Err(Error::Conflict {
                    kind: self.kind.to_string(),
                    name: Self::name_of(obj),
                })
            }
            _ => Ok(()),
        }
    }

    /// Write `obj` over the stored object. With `keep_status` everything
    /// but the stored status is replaced, otherwise only the status is.
    fn merge(&self, name: &str, obj: &K, keep_status: bool) -> Result<K> {
        let mut objects = self.objects.write();
        let existing = objects.get(name).ok_or_else(|| Error::ResourceNotFound {
            kind: self.kind.to_string(),
            name: name.to_string(),
        })?;
        self.check_version(existing, obj)?;

        let old = serde_json::to_value(existing)?;
        let new = serde_json::to_value(obj)?;
        let (mut merged, status_source) = if keep_status {
            (new, &old)
        } else {
            (old.clone(), &new)
        };
        match status_source.get("status") {
            Some(status) => merged["status"] = status.clone(),
            None => {
                if let Some(map) = merged.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        let mut updated: K = serde_json::from_value(merged)?;
        let spec_changed = old.get("spec") != serde_json::to_value(&updated)?.get("spec");
        let generation = existing.meta().generation.unwrap_or(1);
        updated.meta_mut().generation = Some(if spec_changed {
            generation + 1
        } else {
            generation
        });
        updated.meta_mut().resource_version = Some(self.next_version());
        objects.insert(name.to_string(), updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

impl<K> Lister<K> for MemoryObjects<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn get(&self, name: &str) -> Option<Arc<K>> {
        self.object(name).map(Arc::new)
    }

    fn list(&self, labels: &BTreeMap<String, String>) -> Vec<Arc<K>> {
        self.objects
            .read()
            .values()
            .filter(|obj| {
                let have = obj.meta().labels.clone().unwrap_or_default();
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .cloned()
            .map(Arc::new)
            .collect()
    }
}

#[async_trait]
impl<K> ObjectApi<K> for MemoryObjects<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.object(name))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = Self::name_of(obj);
        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: self.kind.to_string(),
                name,
            });
        }
        let mut created = obj.clone();
        created.meta_mut().resource_version = Some(self.next_version());
        created.meta_mut().generation = Some(1);
        objects.insert(name, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        self.merge(&Self::name_of(obj), obj, true)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        self.merge(&Self::name_of(obj), obj, false)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.objects.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::ResourceNotFound {
                kind: self.kind.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

// =============================================================================
// Workload
// =============================================================================

/// Records what the controller asked the workload to become
#[derive(Default)]
pub struct RecordingWorkload {
    pub applied: Mutex<Vec<WorkloadStorage>>,
    pub removed: AtomicUsize,
}

#[async_trait]
impl WorkloadApplier for RecordingWorkload {
    async fn apply(&self, _config: &ImageRegistryConfig, storage: &WorkloadStorage) -> Result<()> {
        self.applied.lock().push(storage.clone());
        Ok(())
    }

    async fn remove(&self, _config: &ImageRegistryConfig) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Driver Context
// =============================================================================

pub struct Harness {
    pub secrets: Arc<MemoryObjects<Secret>>,
    pub claims: Arc<MemoryObjects<PersistentVolumeClaim>>,
    pub azure: Arc<InMemoryAzure>,
    pub s3: Arc<InMemoryBuckets>,
    pub oss: Arc<InMemoryBuckets>,
    pub ibmcos: Arc<InMemoryBuckets>,
    pub ibm: Arc<InMemoryIbmResources>,
    pub metrics: Arc<Metrics>,
}

const CREDENTIALS: &[(&str, &str)] = &[
    ("aws_access_key_id", "AKIAEXAMPLE"),
    ("aws_secret_access_key", "aws-secret"),
    ("azure_resourcegroup", "mycluster-rg"),
    ("azure_region", "eastus"),
    ("ibmcloud_api_key", "ibm-api-key"),
    ("ibmcloud_resource_group", "mycluster-rg"),
    ("alibabacloud_access_key_id", "LTAIEXAMPLE"),
    ("alibabacloud_access_key_secret", "alibaba-secret"),
];

impl Harness {
    /// Replace the cloud credentials secret content
    pub fn set_credentials(&self, values: &[(&str, &str)]) {
        self.secrets.insert(credentials_secret(values));
    }

    pub fn remove_credentials(&self) {
        self.secrets.remove(CLOUD_CREDENTIALS_SECRET);
    }
}

fn credentials_secret(values: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(CLOUD_CREDENTIALS_SECRET.to_string()),
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(
            values
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Driver context backed by in-memory collaborators with valid credentials
pub fn driver_context() -> (DriverContext, Harness) {
    let metrics = Arc::new(Metrics::new().unwrap());
    let harness = Harness {
        secrets: Arc::new(MemoryObjects::new("Secret")),
        claims: Arc::new(MemoryObjects::new("PersistentVolumeClaim")),
        azure: Arc::new(InMemoryAzure::new()),
        s3: Arc::new(InMemoryBuckets::new("s3")),
        oss: Arc::new(InMemoryBuckets::new("oss")),
        ibmcos: Arc::new(InMemoryBuckets::new("ibmcos")),
        ibm: Arc::new(InMemoryIbmResources::new()),
        metrics: metrics.clone(),
    };
    harness.set_credentials(CREDENTIALS);

    let ctx = DriverContext {
        namespace: DEFAULT_NAMESPACE.to_string(),
        infrastructure_name: "mycluster-x7k2".to_string(),
        region: "us-east-1".to_string(),
        secrets: harness.secrets.clone(),
        claims: harness.claims.clone(),
        azure: Some(harness.azure.clone()),
        s3: Some(harness.s3.clone()),
        oss: Some(harness.oss.clone()),
        ibmcos: Some(harness.ibmcos.clone()),
        ibm_resources: Some(harness.ibm.clone()),
        credentials: Arc::new(CredentialCache::new(
            Duration::from_secs(1200),
            8,
            metrics.clone(),
        )),
        metrics,
    };
    (ctx, harness)
}

/// The `cluster` Config in Managed state with no storage configured
pub fn registry_config() -> ImageRegistryConfig {
    let mut cr = ImageRegistryConfig::new(
        REGISTRY_RESOURCE_NAME,
        ImageRegistrySpec {
            management_state: ManagementState::Managed,
            replicas: 2,
            ..Default::default()
        },
    );
    cr.metadata.generation = Some(1);
    cr
}

// =============================================================================
// Deployments
// =============================================================================

/// Registry deployment with the given replica counts
pub fn deployment(desired: i32, updated: i32, available: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(crate::config::DEPLOYMENT_NAME.to_string()),
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            generation: Some(3),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(desired),
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(desired),
            updated_replicas: Some(updated),
            available_replicas: Some(available),
            observed_generation: Some(3),
            ..Default::default()
        }),
    }
}

/// Mark a deployment as having exceeded its progress deadline
pub fn with_progress_deadline_exceeded(mut deployment: Deployment, message: &str) -> Deployment {
    let status = deployment.status.get_or_insert_with(Default::default);
    status.conditions = Some(vec![DeploymentCondition {
        type_: "Progressing".to_string(),
        status: "False".to_string(),
        reason: Some("ProgressDeadlineExceeded".to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    }]);
    deployment
}
