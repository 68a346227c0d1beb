//! Drivers for storage that needs no provisioning: an `emptyDir` volume and
//! a volume supplied by the user.

use crate::crd::{
    ConditionStatus, ImageRegistryConfig, StorageFilesystem, CONDITION_STORAGE_EXISTS,
};
use crate::error::Result;
use crate::storage::{
    mark_adopted, mark_created, payload_changed, record_storage, Driver, EnvVarList,
    STORAGE_MOUNT_PATH, STORAGE_VOLUME_NAME,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Volume, VolumeMount};

fn filesystem_env() -> Result<EnvVarList> {
    let mut env = EnvVarList::new();
    env.push_value("REGISTRY_STORAGE", "filesystem")?;
    env.push_value("REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY", STORAGE_MOUNT_PATH)?;
    Ok(env)
}

fn storage_mount() -> VolumeMount {
    VolumeMount {
        name: STORAGE_VOLUME_NAME.to_string(),
        mount_path: STORAGE_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

fn mark_exists(cr: &mut ImageRegistryConfig, reason: &str) {
    cr.set_condition(CONDITION_STORAGE_EXISTS, ConditionStatus::True, reason, "");
}

/// Ephemeral storage, lost with the pod
#[derive(Debug, Default)]
pub struct EmptyDirDriver;

impl EmptyDirDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for EmptyDirDriver {
    fn id(&self) -> String {
        "emptydir".to_string()
    }

    fn config_env(&self) -> Result<EnvVarList> {
        filesystem_env()
    }

    fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let volume = Volume {
            name: STORAGE_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };
        Ok((vec![volume], vec![storage_mount()]))
    }

    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        mark_exists(cr, "EmptyDirAlwaysExists");
        Ok(true)
    }

    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool {
        payload_changed(cr, |s| &s.empty_dir)
    }

    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        mark_created(cr);
        mark_exists(cr, "EmptyDirAlwaysExists");
        record_storage(cr);
        Ok(())
    }

    async fn remove_storage(&mut self, _cr: &mut ImageRegistryConfig) -> Result<()> {
        Ok(())
    }
}

/// Volume source provided by the user
#[derive(Debug)]
pub struct FilesystemDriver {
    config: StorageFilesystem,
}

impl FilesystemDriver {
    pub fn new(config: StorageFilesystem) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Driver for FilesystemDriver {
    fn id(&self) -> String {
        "filesystem".to_string()
    }

    fn config_env(&self) -> Result<EnvVarList> {
        filesystem_env()
    }

    fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let volume = Volume {
            name: STORAGE_VOLUME_NAME.to_string(),
            ..self.config.volume_source.clone()
        };
        Ok((vec![volume], vec![storage_mount()]))
    }

    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        mark_exists(cr, "VolumeExists");
        Ok(true)
    }

    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool {
        payload_changed(cr, |s| &s.filesystem)
    }

    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        mark_adopted(cr);
        mark_exists(cr, "VolumeExists");
        record_storage(cr);
        Ok(())
    }

    async fn remove_storage(&mut self, _cr: &mut ImageRegistryConfig) -> Result<()> {
        Ok(())
    }
}
