//! Image registry controller
//!
//! Syncs the singleton `cluster` Config: bootstraps it when absent, applies
//! storage and the workload, recomputes the registry conditions and writes
//! back only what changed. Spec and status are written separately, each
//! guarded by the resourceVersion the object was read with.

use crate::config::{Platform, DEFAULT_ROUTE_NAME, DEPLOYMENT_NAME, REGISTRY_RESOURCE_NAME};
use crate::controller::applier::StorageApplier;
use crate::controller::{log_write_error, Reconciler, SyncAction};
use crate::crd::{
    ImageRegistryConfig, ImageRegistryConfigStorage, ImageRegistrySpec, ManagementState, Route,
    StorageAzure, StorageIbmCos, StorageOss, StorageS3,
};
use crate::domain::{Lister, ObjectApi};
use crate::error::{ApplyError, Error, Result};
use crate::status::{evaluate_registry, unavailable_recheck, RegistryInputs};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct RegistryController {
    configs: Arc<dyn Lister<ImageRegistryConfig>>,
    config_api: Arc<dyn ObjectApi<ImageRegistryConfig>>,
    deployments: Arc<dyn Lister<Deployment>>,
    routes: Arc<dyn Lister<Route>>,
    applier: StorageApplier,
    platform: Platform,
}

impl RegistryController {
    pub fn new(
        configs: Arc<dyn Lister<ImageRegistryConfig>>,
        config_api: Arc<dyn ObjectApi<ImageRegistryConfig>>,
        deployments: Arc<dyn Lister<Deployment>>,
        routes: Arc<dyn Lister<Route>>,
        applier: StorageApplier,
        platform: Platform,
    ) -> Self {
        Self {
            configs,
            config_api,
            deployments,
            routes,
            applier,
            platform,
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        let cr = bootstrap_config(self.platform);
        info!(
            platform = %self.platform,
            state = %cr.spec.management_state,
            "creating default registry configuration"
        );
        match self.config_api.create(&cr).await {
            Ok(_) => Ok(()),
            Err(Error::ResourceExists { .. }) => {
                debug!("registry configuration appeared concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Routes the registry is exposed through, in configuration order
    fn configured_routes(&self, cr: &ImageRegistryConfig) -> Vec<Arc<Route>> {
        let default_route = cr.spec.default_route.then_some(DEFAULT_ROUTE_NAME);
        default_route
            .into_iter()
            .chain(cr.spec.routes.iter().map(|r| r.name.as_str()))
            .filter_map(|name| self.routes.get(name))
            .collect()
    }
}

#[async_trait]
impl Reconciler for RegistryController {
    fn name(&self) -> &'static str {
        "imageregistry"
    }

    async fn sync(&self) -> Result<SyncAction> {
        let cached = match self.configs.get(REGISTRY_RESOURCE_NAME) {
            Some(cr) => cr,
            None => {
                self.bootstrap().await?;
                return Ok(SyncAction::AwaitChange);
            }
        };

        let mut cr = (*cached).clone();
        let (previous_metadata, previous_spec) = (cr.metadata.clone(), cr.spec.clone());
        let previous_status = cr.status.clone();

        let apply_error = self.applier.apply(&mut cr).await.err();

        let deployment = self.deployments.get(DEPLOYMENT_NAME);
        let routes = self.configured_routes(&cr);
        let previous_conditions = previous_status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        let now = Utc::now();
        let conditions = evaluate_registry(
            &previous_conditions,
            &RegistryInputs {
                management_state: &cr.spec.management_state,
                deployment: deployment.as_deref(),
                routes: &routes,
                apply_error: apply_error.as_ref(),
            },
            now,
        );

        let generation = cr.metadata.generation;
        let ready_replicas = deployment
            .as_ref()
            .and_then(|d| d.status.as_ref())
            .and_then(|s| s.available_replicas)
            .unwrap_or(0);
        let status = cr.status_mut();
        conditions.apply(&mut status.conditions, now);
        status.observed_generation = generation;
        status.ready_replicas = ready_replicas;

        if cr.metadata != previous_metadata || cr.spec != previous_spec {
            let updated = self
                .config_api
                .replace(&cr)
                .await
                .map_err(log_write_error("registry configuration", "spec"))?;
            // the status write must carry the version the spec write produced
            cr.metadata.resource_version = updated.metadata.resource_version;
            cr.metadata.generation = updated.metadata.generation;
            cr.status_mut().observed_generation = updated.metadata.generation;
        }
        if cr.status != previous_status {
            self.config_api
                .replace_status(&cr)
                .await
                .map_err(log_write_error("registry configuration", "status"))?;
        }

        // Available flips to Degraded only once the grace window lapses,
        // which no watch event announces
        let next = unavailable_recheck(cr.conditions(), now)
            .map_or(SyncAction::AwaitChange, SyncAction::RequeueAfter);
        match apply_error {
            None => {
                debug!("registry configuration synced");
                Ok(next)
            }
            Some(ApplyError::Fatal(e)) => {
                warn!(error = %e, reason = e.reason(), "registry storage cannot be applied");
                Ok(next)
            }
            Some(ApplyError::Retryable(e)) => {
                if e.is_conflict() {
                    debug!(error = %e, "conflict while applying, retrying");
                } else {
                    error!(error = %e, "unable to apply registry configuration");
                }
                Err(e)
            }
        }
    }
}

/// Default Config for a cluster on `platform`
pub fn bootstrap_config(platform: Platform) -> ImageRegistryConfig {
    let storage = match platform {
        Platform::Aws => Some(ImageRegistryConfigStorage {
            s3: Some(StorageS3::default()),
            ..Default::default()
        }),
        Platform::Azure => Some(ImageRegistryConfigStorage {
            azure: Some(StorageAzure::default()),
            ..Default::default()
        }),
        Platform::IbmCloud => Some(ImageRegistryConfigStorage {
            ibmcos: Some(StorageIbmCos::default()),
            ..Default::default()
        }),
        Platform::AlibabaCloud => Some(ImageRegistryConfigStorage {
            oss: Some(StorageOss::default()),
            ..Default::default()
        }),
        Platform::None => None,
    };

    let spec = match storage {
        Some(storage) => ImageRegistrySpec {
            management_state: ManagementState::Managed,
            storage,
            replicas: 2,
            ..Default::default()
        },
        None => ImageRegistrySpec {
            management_state: ManagementState::Removed,
            replicas: 1,
            ..Default::default()
        },
    };
    ImageRegistryConfig::new(REGISTRY_RESOURCE_NAME, spec)
}
