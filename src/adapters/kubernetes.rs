//! Kubernetes adapters
//!
//! Listers read from `kube::runtime::reflector` stores kept warm by the
//! controllers' watches; writes go straight to the API server.

use crate::config::{DEPLOYMENT_NAME, FIELD_MANAGER, REGISTRY_PORT};
use crate::crd::ImageRegistryConfig;
use crate::domain::{Lister, ObjectApi, WorkloadApplier};
use crate::error::{Error, Result};
use crate::storage::WorkloadStorage;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar as KubeEnvVar, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Lister
// =============================================================================

/// Lister over a reflector store, optionally scoped to one namespace
pub struct StoreLister<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    namespace: Option<String>,
}

impl<K> StoreLister<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn cluster(store: Store<K>) -> Self {
        Self {
            store,
            namespace: None,
        }
    }

    pub fn namespaced(store: Store<K>, namespace: &str) -> Self {
        Self {
            store,
            namespace: Some(namespace.to_string()),
        }
    }
}

impl<K> Lister<K> for StoreLister<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, name: &str) -> Option<Arc<K>> {
        let mut reference = ObjectRef::new(name);
        if let Some(ns) = &self.namespace {
            reference = reference.within(ns);
        }
        self.store.get(&reference)
    }

    fn list(&self, labels: &BTreeMap<String, String>) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| match &self.namespace {
                Some(ns) => obj.namespace().as_deref() == Some(ns.as_str()),
                None => true,
            })
            .filter(|obj| {
                let have = obj.labels();
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .collect()
    }
}

// =============================================================================
// Typed Client
// =============================================================================

pub struct KubeObjectApi<K> {
    api: Api<K>,
    kind: &'static str,
}

impl<K> KubeObjectApi<K> {
    pub fn new(api: Api<K>, kind: &'static str) -> Self {
        Self { api, kind }
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeObjectApi<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, self.kind, name))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .create(&post_params(), obj)
            .await
            .map_err(|e| match Error::from_kube(e, self.kind, &name) {
                Error::Conflict { kind, name } => Error::ResourceExists { kind, name },
                other => other,
            })
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .replace(&name, &post_params(), obj)
            .await
            .map_err(|e| Error::from_kube(e, self.kind, &name))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        self.api
            .replace_status(&name, &post_params(), data)
            .await
            .map_err(|e| Error::from_kube(e, self.kind, &name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, self.kind, name))
    }
}

// =============================================================================
// Registry Deployment
// =============================================================================

/// Realizes the registry as a Deployment through server side apply
pub struct DeploymentApplier {
    api: Api<Deployment>,
    namespace: String,
    image: String,
}

impl DeploymentApplier {
    pub fn new(api: Api<Deployment>, namespace: &str, image: &str) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
            image: image.to_string(),
        }
    }
}

#[async_trait]
impl WorkloadApplier for DeploymentApplier {
    async fn apply(&self, config: &ImageRegistryConfig, storage: &WorkloadStorage) -> Result<()> {
        let deployment = registry_deployment(config, storage, &self.namespace, &self.image)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api
            .patch(DEPLOYMENT_NAME, &params, &Patch::Apply(&deployment))
            .await
            .map_err(|e| Error::from_kube(e, "Deployment", DEPLOYMENT_NAME))?;
        debug!(deployment = DEPLOYMENT_NAME, "applied");
        Ok(())
    }

    async fn remove(&self, _config: &ImageRegistryConfig) -> Result<()> {
        match self.api.delete(DEPLOYMENT_NAME, &DeleteParams::foreground()).await {
            Ok(_) => {
                info!(deployment = DEPLOYMENT_NAME, "deleting registry deployment");
                Ok(())
            }
            Err(e) => match Error::from_kube(e, "Deployment", DEPLOYMENT_NAME) {
                e if e.is_not_found() => Ok(()),
                e => Err(e),
            },
        }
    }
}

/// Desired registry Deployment for the rendered storage surface
pub fn registry_deployment(
    config: &ImageRegistryConfig,
    storage: &WorkloadStorage,
    namespace: &str,
    image: &str,
) -> Result<Deployment> {
    let labels = BTreeMap::from([("docker-registry".to_string(), "default".to_string())]);

    let mut env = storage.env.to_kube()?;
    env.push(KubeEnvVar {
        name: "REGISTRY_HTTP_ADDR".to_string(),
        value: Some(format!(":{}", REGISTRY_PORT)),
        value_from: None,
    });
    if config.spec.disable_redirect {
        env.push(KubeEnvVar {
            name: "REGISTRY_STORAGE_REDIRECT_DISABLE".to_string(),
            value: Some("true".to_string()),
            value_from: None,
        });
    }

    let container = Container {
        name: "registry".to_string(),
        image: Some(image.to_string()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: REGISTRY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(storage.mounts.clone()),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(config.spec.replicas.max(1)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(storage.volumes.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EnvVarList, STORAGE_MOUNT_PATH};
    use crate::testing::registry_config;
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Volume, VolumeMount};

    fn storage() -> WorkloadStorage {
        let mut env = EnvVarList::new();
        env.push_value("REGISTRY_STORAGE", "filesystem").unwrap();
        env.push_secret(
            "REGISTRY_STORAGE_S3_ACCESSKEY",
            "image-registry-private-configuration",
            "REGISTRY_STORAGE_S3_ACCESSKEY",
        );
        WorkloadStorage {
            env,
            volumes: vec![Volume {
                name: "registry-storage".into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }],
            mounts: vec![VolumeMount {
                name: "registry-storage".into(),
                mount_path: STORAGE_MOUNT_PATH.into(),
                ..Default::default()
            }],
            secret_data: BTreeMap::new(),
        }
    }

    #[test]
    fn test_registry_deployment() {
        let mut cr = registry_config();
        cr.spec.disable_redirect = true;
        let deployment =
            registry_deployment(&cr, &storage(), "openshift-image-registry", "registry:1").unwrap();

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.volumes.unwrap()[0].name, "registry-storage");

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry:1"));
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, "/registry");

        let env = container.env.as_ref().unwrap();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "REGISTRY_STORAGE",
                "REGISTRY_STORAGE_S3_ACCESSKEY",
                "REGISTRY_HTTP_ADDR",
                "REGISTRY_STORAGE_REDIRECT_DISABLE",
            ]
        );
        assert!(env[1].value_from.is_some());
    }

    #[test]
    fn test_zero_replicas_runs_one() {
        let mut cr = registry_config();
        cr.spec.replicas = 0;
        let deployment = registry_deployment(&cr, &storage(), "ns", "registry:1").unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(1));
    }
}
