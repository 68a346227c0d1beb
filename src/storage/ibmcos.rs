//! IBM Cloud Object Storage driver
//!
//! Provisioning runs in three steps, each persisted into the spec before
//! the next starts: a COS service instance, an HMAC resource key on that
//! instance, then the bucket itself through the S3 compatible API.

use crate::config::PRIVATE_CONFIGURATION_SECRET;
use crate::crd::{ConditionStatus, ImageRegistryConfig, StorageIbmCos, CONDITION_STORAGE_EXISTS};
use crate::domain::{BucketApiRef, IbmResourceApiRef};
use crate::error::{Error, Result};
use crate::storage::bucket::{self, BucketOutcome};
use crate::storage::naming::{self, BUCKET};
use crate::storage::{
    mark_adopted, mark_created, mark_not_configured, payload_changed, record_storage, Driver,
    DriverContext, EnvVarList,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

const ACCESS_KEY_ENV: &str = "REGISTRY_STORAGE_S3_ACCESSKEY";
const SECRET_KEY_ENV: &str = "REGISTRY_STORAGE_S3_SECRETKEY";

// Kinds recorded in status for resources the operator created
const INSTANCE_RESOURCE: &str = "ibmcos-instance";
const BUCKET_RESOURCE: &str = "ibmcos-bucket";

/// Public S3 endpoint of a COS location
pub fn endpoint(location: &str) -> String {
    format!("https://s3.{}.cloud-object-storage.appdomain.cloud", location)
}

pub struct IbmCosDriver {
    config: StorageIbmCos,
    buckets: BucketApiRef,
    resources: IbmResourceApiRef,
    ctx: DriverContext,
}

impl IbmCosDriver {
    pub fn new(
        config: StorageIbmCos,
        buckets: BucketApiRef,
        resources: IbmResourceApiRef,
        ctx: DriverContext,
    ) -> Self {
        Self {
            config,
            buckets,
            resources,
            ctx,
        }
    }

    fn persist(&self, cr: &mut ImageRegistryConfig) {
        cr.spec.storage.ibmcos = Some(self.config.clone());
    }

    fn resource_group(&self) -> Result<String> {
        if !self.config.resource_group_name.is_empty() {
            return Ok(self.config.resource_group_name.clone());
        }
        self.ctx
            .cloud_credentials()?
            .require("ibmcloud_resource_group")
    }

    fn instance_name(&self) -> String {
        format!("{}-image-registry", self.ctx.infrastructure_name)
    }

    /// Step 1: the COS service instance. Returns whether it was created.
    async fn ensure_instance(&mut self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        if !self.config.service_instance_crn.is_empty() {
            if self
                .resources
                .instance_exists(&self.config.service_instance_crn)
                .await?
            {
                return Ok(false);
            }
            let err = Error::StorageUnavailable {
                kind: "service instance".to_string(),
                name: self.config.service_instance_crn.clone(),
                reason: "does not exist".to_string(),
            };
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::False,
                "InstanceNotFound",
                err.to_string(),
            );
            return Err(err);
        }

        let crn = self
            .resources
            .create_instance(&self.instance_name(), &self.config.resource_group_name)
            .await?;
        info!(crn = %crn, "created COS service instance");
        cr.record_created(INSTANCE_RESOURCE, &crn);
        self.config.service_instance_crn = crn;
        self.persist(cr);
        Ok(true)
    }

    /// Step 2: HMAC credentials, recreated when revoked
    async fn ensure_hmac_key(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        if !self.config.resource_key_crn.is_empty()
            && self
                .resources
                .get_hmac_key(&self.config.resource_key_crn)
                .await?
                .is_some()
        {
            return Ok(());
        }

        let key = self
            .resources
            .create_hmac_key(
                &self.config.service_instance_crn,
                &format!("{}-hmac", self.instance_name()),
            )
            .await?;
        info!(crn = %key.crn, "created COS HMAC key");
        self.config.resource_key_crn = key.crn;
        self.persist(cr);
        Ok(())
    }
}

#[async_trait]
impl Driver for IbmCosDriver {
    fn id(&self) -> String {
        format!("ibmcos {}", self.config.bucket)
    }

    fn config_env(&self) -> Result<EnvVarList> {
        let mut env = EnvVarList::new();
        env.push_value("REGISTRY_STORAGE", "s3")?;
        env.push_value("REGISTRY_STORAGE_S3_BUCKET", &self.config.bucket)?;
        env.push_value("REGISTRY_STORAGE_S3_REGION", &self.config.location)?;
        env.push_value(
            "REGISTRY_STORAGE_S3_REGIONENDPOINT",
            endpoint(&self.config.location),
        )?;
        env.push_value("REGISTRY_STORAGE_S3_ENCRYPT", false)?;
        env.push_value("REGISTRY_STORAGE_S3_VIRTUALHOSTEDSTYLE", false)?;
        env.push_secret(ACCESS_KEY_ENV, PRIVATE_CONFIGURATION_SECRET, ACCESS_KEY_ENV);
        env.push_secret(SECRET_KEY_ENV, PRIVATE_CONFIGURATION_SECRET, SECRET_KEY_ENV);
        Ok(env)
    }

    async fn secrets(&self) -> Result<BTreeMap<String, String>> {
        if self.config.resource_key_crn.is_empty() {
            return Ok(BTreeMap::new());
        }
        let hmac = self
            .resources
            .get_hmac_key(&self.config.resource_key_crn)
            .await?
            .ok_or_else(|| {
                Error::CredentialsUnavailable(format!(
                    "resource key {} not found",
                    self.config.resource_key_crn
                ))
            })?;
        Ok(BTreeMap::from([
            (ACCESS_KEY_ENV.to_string(), hmac.access_key_id),
            (SECRET_KEY_ENV.to_string(), hmac.secret_access_key),
        ]))
    }

    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        if self.config.service_instance_crn.is_empty()
            || self.config.resource_key_crn.is_empty()
            || self.config.bucket.is_empty()
        {
            mark_not_configured(cr, "COS bucket");
            return Ok(false);
        }
        bucket::bucket_exists(self.buckets.as_ref(), cr, &self.config.bucket).await
    }

    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool {
        payload_changed(cr, |s| &s.ibmcos)
    }

    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        self.ctx.cloud_credentials()?.require("ibmcloud_api_key")?;

        if self.config.location.is_empty() {
            if self.ctx.region.is_empty() {
                return Err(Error::RegionUnavailable {
                    backend: "ibmcos".to_string(),
                });
            }
            self.config.location = self.ctx.region.clone();
        }
        if self.config.resource_group_name.is_empty() {
            self.config.resource_group_name = self.resource_group()?;
        }
        self.persist(cr);

        self.ensure_instance(cr).await?;
        self.ensure_hmac_key(cr).await?;

        let prefix = naming::bucket_prefix(&self.ctx.infrastructure_name, &self.config.location);
        let location = self.config.location.clone();
        let outcome = bucket::ensure_bucket(
            self.buckets.as_ref(),
            cr,
            &mut self.config.bucket,
            &prefix,
            &location,
            &BUCKET,
        )
        .await?;
        self.persist(cr);

        // the bucket holds the data, so its origin decides the management state
        match outcome {
            BucketOutcome::Created => {
                cr.record_created(BUCKET_RESOURCE, &self.config.bucket);
                mark_created(cr);
            }
            BucketOutcome::Adopted => mark_adopted(cr),
        }

        bucket::bucket_exists(self.buckets.as_ref(), cr, &self.config.bucket).await?;
        record_storage(cr);
        Ok(())
    }

    async fn remove_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        if !self.config.bucket.is_empty() && cr.created(BUCKET_RESOURCE, &self.config.bucket) {
            bucket::delete_bucket(self.buckets.as_ref(), &self.config.bucket).await?;
            info!(bucket = %self.config.bucket, "deleted COS bucket");
            cr.forget_created(BUCKET_RESOURCE, &self.config.bucket);
            self.config.bucket.clear();
            self.persist(cr);
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::False,
                "BucketDeleted",
                "COS bucket has been deleted",
            );
        }

        if !self.config.service_instance_crn.is_empty()
            && cr.created(INSTANCE_RESOURCE, &self.config.service_instance_crn)
        {
            match self
                .resources
                .delete_instance(&self.config.service_instance_crn)
                .await
            {
                Ok(()) => info!(crn = %self.config.service_instance_crn, "deleted COS instance"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            cr.forget_created(INSTANCE_RESOURCE, &self.config.service_instance_crn);
            self.config.service_instance_crn.clear();
            self.config.resource_key_crn.clear();
            self.persist(cr);
        }
        Ok(())
    }
}
