//! Alibaba Cloud OSS driver

use crate::config::PRIVATE_CONFIGURATION_SECRET;
use crate::crd::{
    ConditionStatus, ImageRegistryConfig, OssEncryptionMethod, StorageOss,
    CONDITION_STORAGE_EXISTS,
};
use crate::domain::{BucketApiRef, BucketEncryption};
use crate::error::{Error, Result};
use crate::storage::bucket::{self, BucketHardening, BucketOutcome};
use crate::storage::naming::{self, BUCKET};
use crate::storage::{
    is_managed, mark_adopted, mark_created, payload_changed, record_storage, Driver,
    DriverContext, EnvVarList,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

const ACCESS_KEY_ID_ENV: &str = "REGISTRY_STORAGE_OSS_ACCESSKEYID";
const ACCESS_KEY_SECRET_ENV: &str = "REGISTRY_STORAGE_OSS_ACCESSKEYSECRET";

pub struct OssDriver {
    config: StorageOss,
    api: BucketApiRef,
    ctx: DriverContext,
}

impl OssDriver {
    pub fn new(config: StorageOss, api: BucketApiRef, ctx: DriverContext) -> Self {
        Self { config, api, ctx }
    }

    fn persist(&self, cr: &mut ImageRegistryConfig) {
        cr.spec.storage.oss = Some(self.config.clone());
    }

    fn encryption(&self) -> BucketEncryption {
        match &self.config.encryption {
            Some(enc) if enc.method == OssEncryptionMethod::Kms => BucketEncryption::Kms {
                key_id: enc.kms_key_id.clone(),
            },
            _ => BucketEncryption::Aes256,
        }
    }
}

#[async_trait]
impl Driver for OssDriver {
    fn id(&self) -> String {
        format!("oss {}", self.config.bucket)
    }

    fn config_env(&self) -> Result<EnvVarList> {
        let mut env = EnvVarList::new();
        env.push_value("REGISTRY_STORAGE", "oss")?;
        env.push_value("REGISTRY_STORAGE_OSS_BUCKET", &self.config.bucket)?;
        env.push_value("REGISTRY_STORAGE_OSS_REGION", format!("oss-{}", self.config.region))?;
        env.push_value("REGISTRY_STORAGE_OSS_INTERNAL", self.config.internal)?;
        env.push_value("REGISTRY_STORAGE_OSS_ENCRYPT", true)?;
        if let BucketEncryption::Kms { key_id } = self.encryption() {
            env.push_value("REGISTRY_STORAGE_OSS_ENCRYPTIONKEYID", key_id)?;
        }
        env.push_secret(ACCESS_KEY_ID_ENV, PRIVATE_CONFIGURATION_SECRET, ACCESS_KEY_ID_ENV);
        env.push_secret(
            ACCESS_KEY_SECRET_ENV,
            PRIVATE_CONFIGURATION_SECRET,
            ACCESS_KEY_SECRET_ENV,
        );
        Ok(env)
    }

    async fn secrets(&self) -> Result<BTreeMap<String, String>> {
        let credentials = self.ctx.cloud_credentials()?;
        Ok(BTreeMap::from([
            (
                ACCESS_KEY_ID_ENV.to_string(),
                credentials.require("alibabacloud_access_key_id")?,
            ),
            (
                ACCESS_KEY_SECRET_ENV.to_string(),
                credentials.require("alibabacloud_access_key_secret")?,
            ),
        ]))
    }

    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        bucket::bucket_exists(self.api.as_ref(), cr, &self.config.bucket).await
    }

    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool {
        payload_changed(cr, |s| &s.oss)
    }

    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        self.secrets().await?;

        if self.config.region.is_empty() {
            if self.ctx.region.is_empty() {
                return Err(Error::RegionUnavailable {
                    backend: "oss".to_string(),
                });
            }
            self.config.region = self.ctx.region.clone();
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
            bucket::harden_bucket(
                self.api.as_ref(),
                cr,
                &self.config.bucket,
                BucketHardening {
                    tags: &tags,
                    encryption: Some(self.encryption()),
                },
            )
            .await?;
        }

        bucket::bucket_exists(self.api.as_ref(), cr, &self.config.bucket).await?;
        record_storage(cr);
        info!(bucket = %self.config.bucket, ?outcome, "oss storage ready");
        Ok(())
    }

    async fn remove_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        if !is_managed(cr) || self.config.bucket.is_empty() {
            return Ok(());
        }

        bucket::delete_bucket(self.api.as_ref(), &self.config.bucket).await?;
        info!(bucket = %self.config.bucket, "deleted oss bucket");
        self.config.bucket.clear();
        self.persist(cr);
        cr.set_condition(
            CONDITION_STORAGE_EXISTS,
            ConditionStatus::False,
            "BucketDeleted",
            "OSS bucket has been deleted",
        );
        Ok(())
    }
}
