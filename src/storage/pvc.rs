//! Persistent volume claim driver
//!
//! The registry stores blobs on a filesystem backed by a claim. A claim
//! created by the operator is annotated so it is never confused with a
//! claim the user made.

use crate::config::{DEFAULT_PVC_NAME, PVC_OWNER_ANNOTATION};
use crate::crd::{
    ConditionStatus, ImageRegistryConfig, ManagementState, StoragePvc, CONDITION_STORAGE_EXISTS,
};
use crate::error::{Error, Result};
use crate::storage::{
    mark_adopted, mark_created, mark_not_configured, payload_changed, record_storage, Driver,
    DriverContext, EnvVarList, STORAGE_MOUNT_PATH, STORAGE_VOLUME_NAME,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::info;

/// Size requested for claims the operator creates
pub const DEFAULT_CLAIM_SIZE: &str = "100Gi";

pub struct PvcDriver {
    config: StoragePvc,
    ctx: DriverContext,
}

impl PvcDriver {
    pub fn new(config: StoragePvc, ctx: DriverContext) -> Self {
        Self { config, ctx }
    }

    fn claim_name(&self) -> &str {
        if self.config.claim.is_empty() {
            DEFAULT_PVC_NAME
        } else {
            &self.config.claim
        }
    }

    fn persist(&self, cr: &mut ImageRegistryConfig) {
        cr.spec.storage.pvc = Some(self.config.clone());
    }

    fn new_claim(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.claim_name().to_string()),
                namespace: Some(self.ctx.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    PVC_OWNER_ANNOTATION.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(DEFAULT_CLAIM_SIZE.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Whether the claim carries the operator's ownership annotation
pub fn is_owned(claim: &PersistentVolumeClaim) -> bool {
    claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PVC_OWNER_ANNOTATION))
        .map_or(false, |v| v == "true")
}

#[async_trait]
impl Driver for PvcDriver {
    fn id(&self) -> String {
        format!("pvc {}", self.claim_name())
    }

    fn config_env(&self) -> Result<EnvVarList> {
        let mut env = EnvVarList::new();
        env.push_value("REGISTRY_STORAGE", "filesystem")?;
        env.push_value("REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY", STORAGE_MOUNT_PATH)?;
        Ok(env)
    }

    fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let volume = Volume {
            name: STORAGE_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.claim_name().to_string(),
                read_only: None,
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: STORAGE_VOLUME_NAME.to_string(),
            mount_path: STORAGE_MOUNT_PATH.to_string(),
            ..Default::default()
        };
        Ok((vec![volume], vec![mount]))
    }

    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        if self.config.claim.is_empty() {
            mark_not_configured(cr, "PVC");
            return Ok(false);
        }
        match self.ctx.claims.get(self.claim_name()).await? {
            Some(_) => {
                cr.set_condition(
                    CONDITION_STORAGE_EXISTS,
                    ConditionStatus::True,
                    "PVCExists",
                    format!("PVC {} exists", self.claim_name()),
                );
                Ok(true)
            }
            None => {
                cr.set_condition(
                    CONDITION_STORAGE_EXISTS,
                    ConditionStatus::False,
                    "PVCNotFound",
                    format!("PVC {} does not exist", self.claim_name()),
                );
                Ok(false)
            }
        }
    }

    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool {
        payload_changed(cr, |s| &s.pvc)
    }

    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        let name = self.claim_name().to_string();

        match self.ctx.claims.get(&name).await? {
            Some(claim) if is_owned(&claim) => {
                mark_created(cr);
            }
            Some(_) if cr.spec.storage.management_state == Some(ManagementState::Unmanaged) => {
                mark_adopted(cr);
            }
            Some(_) => {
                let err = Error::StorageUnavailable {
                    kind: "PersistentVolumeClaim".to_string(),
                    name: format!("{}/{}", self.ctx.namespace, name),
                    reason: "already exists and is not owned by the operator".to_string(),
                };
                cr.set_condition(
                    CONDITION_STORAGE_EXISTS,
                    ConditionStatus::False,
                    "PVCNotOwned",
                    err.to_string(),
                );
                return Err(err);
            }
            None => {
                match self.ctx.claims.create(&self.new_claim()).await {
                    Ok(_) => info!(claim = %name, "created persistent volume claim"),
                    Err(e) => {
                        cr.set_condition(
                            CONDITION_STORAGE_EXISTS,
                            ConditionStatus::False,
                            "CreationFailed",
                            e.to_string(),
                        );
                        return Err(e);
                    }
                }
                mark_created(cr);
            }
        }

        if self.config.claim.is_empty() {
            self.config.claim = name.clone();
        }
        self.persist(cr);
        cr.set_condition(
            CONDITION_STORAGE_EXISTS,
            ConditionStatus::True,
            "PVCExists",
            format!("PVC {} exists", name),
        );
        record_storage(cr);
        Ok(())
    }

    async fn remove_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        let name = self.claim_name().to_string();
        let claim = match self.ctx.claims.get(&name).await? {
            Some(claim) => claim,
            None => return Ok(()),
        };
        if !is_owned(&claim) {
            return Ok(());
        }

        match self.ctx.claims.delete(&name).await {
            Ok(()) => info!(claim = %name, "deleted persistent volume claim"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        cr.set_condition(
            CONDITION_STORAGE_EXISTS,
            ConditionStatus::False,
            "PVCDeleted",
            format!("PVC {} has been deleted", name),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ObjectApi;
    use crate::testing::{driver_context, registry_config};
    use assert_matches::assert_matches;

    fn user_claim(name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("openshift-image-registry".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_default_claim() {
        let (ctx, harness) = driver_context();
        let mut cr = registry_config();
        let mut driver = PvcDriver::new(StoragePvc::default(), ctx);

        driver.create_storage(&mut cr).await.unwrap();

        assert_eq!(cr.spec.storage.pvc.as_ref().unwrap().claim, DEFAULT_PVC_NAME);
        assert_eq!(cr.spec.storage.management_state, Some(ManagementState::Managed));
        let claim = harness.claims.object(DEFAULT_PVC_NAME).unwrap();
        assert!(is_owned(&claim));
        let spec = claim.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), ["ReadWriteMany"]);
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            Quantity("100Gi".into())
        );
    }

    #[tokio::test]
    async fn test_storage_exists_without_claim_name() {
        let (ctx, _) = driver_context();
        let mut cr = registry_config();
        cr.set_condition(CONDITION_STORAGE_EXISTS, ConditionStatus::True, "PVCExists", "");

        let driver = PvcDriver::new(StoragePvc::default(), ctx);
        assert!(!driver.storage_exists(&mut cr).await.unwrap());
        assert_eq!(
            cr.condition(CONDITION_STORAGE_EXISTS).unwrap().reason,
            "NotConfigured"
        );
    }

    #[tokio::test]
    async fn test_unowned_claim_is_refused() {
        let (ctx, harness) = driver_context();
        harness.claims.create(&user_claim("user-claim")).await.unwrap();
        let mut cr = registry_config();
        let mut driver = PvcDriver::new(
            StoragePvc {
                claim: "user-claim".into(),
            },
            ctx,
        );

        let err = driver.create_storage(&mut cr).await.unwrap_err();

        assert!(err
            .to_string()
            .contains("already exists and is not owned by the operator"));
        assert_matches!(err, Error::StorageUnavailable { .. });
        assert_eq!(cr.spec.storage.management_state, None);
        assert_eq!(
            cr.condition(CONDITION_STORAGE_EXISTS).unwrap().status,
            ConditionStatus::False
        );
    }

    #[tokio::test]
    async fn test_unowned_claim_adopted_when_unmanaged() {
        let (ctx, harness) = driver_context();
        harness.claims.create(&user_claim("user-claim")).await.unwrap();
        let mut cr = registry_config();
        cr.spec.storage.management_state = Some(ManagementState::Unmanaged);
        let mut driver = PvcDriver::new(
            StoragePvc {
                claim: "user-claim".into(),
            },
            ctx,
        );

        driver.create_storage(&mut cr).await.unwrap();
        assert!(!cr.storage_managed());

        driver.remove_storage(&mut cr).await.unwrap();
        assert!(harness.claims.object("user-claim").is_some());
    }

    #[tokio::test]
    async fn test_idempotent_and_removable() {
        let (ctx, harness) = driver_context();
        let mut cr = registry_config();
        PvcDriver::new(StoragePvc::default(), ctx.clone())
            .create_storage(&mut cr)
            .await
            .unwrap();
        let first = cr.clone();

        let mut driver = PvcDriver::new(cr.spec.storage.pvc.clone().unwrap(), ctx);
        assert!(driver.storage_exists(&mut cr).await.unwrap());
        assert!(!driver.storage_changed(&cr));
        driver.create_storage(&mut cr).await.unwrap();
        assert_eq!(cr.spec, first.spec);
        assert_eq!(cr.status, first.status);

        driver.remove_storage(&mut cr).await.unwrap();
        assert!(harness.claims.object(DEFAULT_PVC_NAME).is_none());
    }

    #[test]
    fn test_volumes_and_env() {
        let (ctx, _) = driver_context();
        let driver = PvcDriver::new(StoragePvc::default(), ctx);
        let (volumes, mounts) = driver.volumes().unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            DEFAULT_PVC_NAME
        );
        assert_eq!(mounts[0].mount_path, "/registry");
        assert_eq!(driver.config_env().unwrap().len(), 2);
    }
}
