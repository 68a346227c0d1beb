//! Storage applier
//!
//! One apply step per sync: realize the configured storage through its
//! driver, write the private configuration secret and hand the rendered
//! storage surface to the workload applier.

use crate::config::PRIVATE_CONFIGURATION_SECRET;
use crate::crd::{ImageRegistryConfig, ImageRegistryConfigStorage, ManagementState};
use crate::domain::{ObjectApi, WorkloadApplierRef};
use crate::error::{ApplyError, Result};
use crate::metrics::Metrics;
use crate::storage::{new_driver, record_storage, DriverContext, WorkloadStorage};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct StorageApplier {
    ctx: DriverContext,
    secrets: Arc<dyn ObjectApi<Secret>>,
    workload: WorkloadApplierRef,
    metrics: Arc<Metrics>,
}

impl StorageApplier {
    pub fn new(
        ctx: DriverContext,
        secrets: Arc<dyn ObjectApi<Secret>>,
        workload: WorkloadApplierRef,
    ) -> Self {
        let metrics = ctx.metrics.clone();
        Self {
            ctx,
            secrets,
            workload,
            metrics,
        }
    }

    /// Apply the CR. Progress is recorded in `cr` even when this fails.
    pub async fn apply(&self, cr: &mut ImageRegistryConfig) -> std::result::Result<(), ApplyError> {
        match cr.spec.management_state.clone() {
            ManagementState::Unmanaged => Ok(()),
            ManagementState::Removed => self.remove(cr).await.map_err(ApplyError::from),
            ManagementState::Managed => self.reconcile(cr).await.map_err(ApplyError::from),
            ManagementState::Other(state) => {
                debug!(state = %state, "unknown management state, treating as Managed");
                self.reconcile(cr).await.map_err(ApplyError::from)
            }
        }
    }

    async fn reconcile(&self, cr: &mut ImageRegistryConfig) -> Result<()> {
        let mut driver = new_driver(&cr.spec.storage, &self.ctx)?;

        let exists = driver.storage_exists(cr).await?;
        let changed = driver.storage_changed(cr);
        if !exists || changed {
            if changed && previously_configured(cr) {
                info!(storage = %driver.id(), "storage configuration changed");
                self.metrics.record_storage_reconfigured();
            }
            driver.create_storage(cr).await?;
        }
        record_storage(cr);

        let storage = WorkloadStorage::render(driver.as_ref()).await?;
        self.write_secret(&storage.secret_data).await?;
        self.workload.apply(cr, &storage).await
    }

    async fn remove(&self, cr: &mut ImageRegistryConfig) -> Result<()> {
        if cr.storage_managed() {
            let storage = if cr.spec.storage.backend()?.is_some() {
                cr.spec.storage.clone()
            } else {
                cr.status
                    .as_ref()
                    .map(|s| s.storage.clone())
                    .unwrap_or_default()
            };
            let mut driver = new_driver(&storage, &self.ctx)?;
            info!(storage = %driver.id(), "removing managed storage");
            driver.remove_storage(cr).await?;

            let status = cr.status_mut();
            status.storage = ImageRegistryConfigStorage::default();
            status.storage_managed = false;
            status.created_resources.clear();
        }

        match self.secrets.delete(PRIVATE_CONFIGURATION_SECRET).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.workload.remove(cr).await
    }

    /// Create or update the private configuration secret
    async fn write_secret(&self, data: &BTreeMap<String, String>) -> Result<()> {
        let desired: BTreeMap<String, ByteString> = data
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
            .collect();

        match self.secrets.get(PRIVATE_CONFIGURATION_SECRET).await? {
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(PRIVATE_CONFIGURATION_SECRET.to_string()),
                        namespace: Some(self.ctx.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(desired),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                };
                self.secrets.create(&secret).await?;
                debug!(secret = PRIVATE_CONFIGURATION_SECRET, "created");
            }
            Some(mut existing) if existing.data.as_ref() != Some(&desired) => {
                existing.data = Some(desired);
                existing.string_data = None;
                self.secrets.replace(&existing).await?;
                debug!(secret = PRIVATE_CONFIGURATION_SECRET, "updated");
            }
            Some(_) => {}
        }
        Ok(())
    }
}

fn previously_configured(cr: &ImageRegistryConfig) -> bool {
    cr.status
        .as_ref()
        .map_or(false, |s| matches!(s.storage.backend(), Ok(Some(_))))
}
