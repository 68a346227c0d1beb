//! Amazon S3 driver
//!
//! The registry reaches S3 with a shared credentials file mounted from the
//! private configuration secret.

use crate::config::PRIVATE_CONFIGURATION_SECRET;
use crate::crd::{ConditionStatus, ImageRegistryConfig, StorageS3, CONDITION_STORAGE_EXISTS};
use crate::domain::{BucketApiRef, BucketEncryption};
use crate::error::{Error, Result};
use crate::storage::bucket::{self, BucketHardening, BucketOutcome};
use crate::storage::naming::{self, BUCKET};
use crate::storage::{
    is_managed, mark_adopted, mark_created, payload_changed, record_storage, Driver,
    DriverContext, EnvVarList,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{KeyToPath, SecretVolumeSource, Volume, VolumeMount};
use std::collections::BTreeMap;
use tracing::info;

/// Directory the credentials file is mounted into
pub const CREDENTIALS_MOUNT_PATH: &str = "/var/run/secrets/cloud";

/// Key of the credentials file in the private configuration secret
pub const CREDENTIALS_KEY: &str = "credentials";

const CREDENTIALS_VOLUME: &str = "image-registry-private-configuration";

pub struct S3Driver {
    config: StorageS3,
    api: BucketApiRef,
    ctx: DriverContext,
}

impl S3Driver {
    pub fn new(config: StorageS3, api: BucketApiRef, ctx: DriverContext) -> Self {
        Self { config, api, ctx }
    }

    fn region(&self) -> Result<String> {
        if !self.config.region.is_empty() {
            return Ok(self.config.region.clone());
        }
        if !self.ctx.region.is_empty() {
            return Ok(self.ctx.region.clone());
        }
        Err(Error::RegionUnavailable {
            backend: "s3".to_string(),
        })
    }

    fn encryption(&self) -> BucketEncryption {
        if self.config.key_id.is_empty() {
            BucketEncryption::Aes256
        } else {
            BucketEncryption::Kms {
                key_id: self.config.key_id.clone(),
            }
        }
    }

    fn persist(&self, cr: &mut ImageRegistryConfig) {
        cr.spec.storage.s3 = Some(self.config.clone());
    }
}

#[async_trait]
impl Driver for S3Driver {
    fn id(&self) -> String {
        format!("s3 {}", self.config.bucket)
    }

    fn config_env(&self) -> Result<EnvVarList> {
        let mut env = EnvVarList::new();
        env.push_value("REGISTRY_STORAGE", "s3")?;
        env.push_value("REGISTRY_STORAGE_S3_BUCKET", &self.config.bucket)?;
        env.push_value("REGISTRY_STORAGE_S3_REGION", &self.config.region)?;
        if !self.config.region_endpoint.is_empty() {
            env.push_value(
                "REGISTRY_STORAGE_S3_REGIONENDPOINT",
                &self.config.region_endpoint,
            )?;
        }
        env.push_value("REGISTRY_STORAGE_S3_ENCRYPT", self.config.encrypt)?;
        if !self.config.key_id.is_empty() {
            env.push_value("REGISTRY_STORAGE_S3_KEYID", &self.config.key_id)?;
        }
        env.push_value(
            "REGISTRY_STORAGE_S3_VIRTUALHOSTEDSTYLE",
            self.config.virtual_hosted_style,
        )?;
        env.push_value(
            "REGISTRY_STORAGE_S3_CREDENTIALSCONFIGPATH",
            format!("{}/{}", CREDENTIALS_MOUNT_PATH, CREDENTIALS_KEY),
        )?;
        Ok(env)
    }

    fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let volume = Volume {
            name: CREDENTIALS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(PRIVATE_CONFIGURATION_SECRET.to_string()),
                items: Some(vec![KeyToPath {
                    key: CREDENTIALS_KEY.to_string(),
                    path: CREDENTIALS_KEY.to_string(),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: CREDENTIALS_VOLUME.to_string(),
            mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        };
        Ok((vec![volume], vec![mount]))
    }

    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>> {
        let credentials = self.ctx.cloud_credentials()?;
        let file = format!(
            "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\n",
            credentials.require("aws_access_key_id")?,
            credentials.require("aws_secret_access_key")?,
        );
        Ok(BTreeMap::from([(CREDENTIALS_KEY.to_string(), file)]))
    }

    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        bucket::bucket_exists(self.api.as_ref(), cr, &self.config.bucket).await
    }

    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool {
        payload_changed(cr, |s| &s.s3)
    }

    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        // fail early on unusable credentials
        self.ctx.cloud_credentials()?.require("aws_access_key_id")?;

        if self.config.region.is_empty() {
            self.config.region = self.region()?;
            self.persist(cr);
        }

        let prefix = naming::bucket_prefix(&self.ctx.infrastructure_name, &self.config.region);
        let region = self.config.region.clone();
        let outcome = bucket::ensure_bucket(
            self.api.as_ref(),
            cr,
            &mut self.config.bucket,
            &prefix,
            &region,
            &BUCKET,
        )
        .await?;
        self.persist(cr);

        match outcome {
            BucketOutcome::Created => mark_created(cr),
            BucketOutcome::Adopted => mark_adopted(cr),
        }

        if is_managed(cr) {
            let tags = self.ctx.resource_tags();
            let encryption = self.encryption();
            bucket::harden_bucket(
                self.api.as_ref(),
                cr,
                &self.config.bucket,
                BucketHardening {
                    tags: &tags,
                    encryption: Some(encryption),
                },
            )
            .await?;
            if !self.config.encrypt {
                self.config.encrypt = true;
                self.persist(cr);
            }
        }

        bucket::bucket_exists(self.api.as_ref(), cr, &self.config.bucket).await?;
        record_storage(cr);
        info!(bucket = %self.config.bucket, ?outcome, "s3 storage ready");
        Ok(())
    }

    async fn remove_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        if !is_managed(cr) || self.config.bucket.is_empty() {
            return Ok(());
        }

        bucket::delete_bucket(self.api.as_ref(), &self.config.bucket).await?;
        info!(bucket = %self.config.bucket, "deleted s3 bucket");

        self.config.bucket.clear();
        self.persist(cr);
        cr.set_condition(
            CONDITION_STORAGE_EXISTS,
            ConditionStatus::False,
            "BucketDeleted",
            "S3 bucket has been deleted",
        );
        Ok(())
    }
}
