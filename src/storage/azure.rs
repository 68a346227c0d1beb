//! Azure Blob Storage driver
//!
//! Provisions a storage account and a blob container. Account names are
//! global across Azure, so generated names are checked for availability
//! before creation. Account keys go through the shared credential cache.

use crate::cache::{CredentialFetcher, CredentialKey};
use crate::config::PRIVATE_CONFIGURATION_SECRET;
use crate::crd::{ConditionStatus, ImageRegistryConfig, StorageAzure, CONDITION_STORAGE_EXISTS};
use crate::domain::{AzureStorageApi, AzureStorageApiRef};
use crate::error::{CloudErrorKind, Error, Result};
use crate::storage::naming::{self, AZURE_ACCOUNT};
use crate::storage::{
    mark_adopted, mark_created, mark_not_configured, payload_changed, record_storage, Driver,
    DriverContext, EnvVarList,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

const ACCOUNT_KEY_ENV: &str = "REGISTRY_STORAGE_AZURE_ACCOUNTKEY";

// Kinds recorded in status for resources the operator created
const ACCOUNT_RESOURCE: &str = "azure-account";
const CONTAINER_RESOURCE: &str = "azure-container";

// =============================================================================
// Cloud Environments
// =============================================================================

/// Azure cloud environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureCloud {
    Public,
    UsGovernment,
    China,
    German,
}

impl AzureCloud {
    /// Resolve a cloud name; empty means the public cloud
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_uppercase().as_str() {
            "" | "AZUREPUBLICCLOUD" => Ok(AzureCloud::Public),
            "AZUREUSGOVERNMENTCLOUD" => Ok(AzureCloud::UsGovernment),
            "AZURECHINACLOUD" => Ok(AzureCloud::China),
            "AZUREGERMANCLOUD" => Ok(AzureCloud::German),
            _ => Err(Error::InvalidCloudName(name.to_string())),
        }
    }

    /// Storage endpoint suffix
    pub fn realm(&self) -> &'static str {
        match self {
            AzureCloud::Public => "core.windows.net",
            AzureCloud::UsGovernment => "core.usgovcloudapi.net",
            AzureCloud::China => "core.chinacloudapi.cn",
            AzureCloud::German => "core.cloudapi.de",
        }
    }
}

// =============================================================================
// Account Key Fetcher
// =============================================================================

struct AccountKeyFetcher<'a> {
    api: &'a dyn AzureStorageApi,
}

#[async_trait]
impl CredentialFetcher for AccountKeyFetcher<'_> {
    async fn fetch(&self, key: &CredentialKey) -> Result<String> {
        let keys = self.api.list_keys(&key.resource_group, &key.account).await?;
        keys.into_iter().next().ok_or_else(|| {
            Error::cloud(
                "azure",
                "ListKeys",
                CloudErrorKind::NotFound,
                format!("storage account {} has no keys", key.account),
            )
        })
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Resource group and location the operator provisions into
#[derive(Debug, Clone)]
struct Placement {
    resource_group: String,
    location: String,
}

pub struct AzureDriver {
    config: StorageAzure,
    api: AzureStorageApiRef,
    ctx: DriverContext,
}

impl AzureDriver {
    pub fn new(config: StorageAzure, api: AzureStorageApiRef, ctx: DriverContext) -> Self {
        Self { config, api, ctx }
    }

    fn placement(&self) -> Result<Placement> {
        let credentials = self.ctx.cloud_credentials()?;
        Ok(Placement {
            resource_group: credentials.require("azure_resourcegroup")?,
            location: credentials.require("azure_region")?,
        })
    }

    async fn account_key(&self, resource_group: &str) -> Result<String> {
        let fetcher = AccountKeyFetcher {
            api: self.api.as_ref(),
        };
        self.ctx
            .credentials
            .get(
                &fetcher,
                &CredentialKey::new(resource_group, &self.config.account_name),
            )
            .await
    }

    fn persist(&self, cr: &mut ImageRegistryConfig) {
        cr.spec.storage.azure = Some(self.config.clone());
    }

    /// Ensure the storage account exists, returning whether it was created
    async fn ensure_account(
        &mut self,
        cr: &mut ImageRegistryConfig,
        placement: &Placement,
    ) -> Result<bool> {
        if !self.config.account_name.is_empty() {
            let name = self.config.account_name.clone();
            if self
                .api
                .get_account(&placement.resource_group, &name)
                .await?
                .is_some()
            {
                return Ok(false);
            }

            return match self
                .api
                .create_account(
                    &placement.resource_group,
                    &name,
                    &placement.location,
                    &self.ctx.resource_tags(),
                )
                .await
            {
                Ok(()) => {
                    info!(account = %name, "created storage account");
                    cr.record_created(ACCOUNT_RESOURCE, &name);
                    Ok(true)
                }
                Err(Error::Cloud {
                    kind: CloudErrorKind::AlreadyExists | CloudErrorKind::AccessDenied,
                    message,
                    ..
                }) => {
                    let err = Error::StorageUnavailable {
                        kind: "storage account".to_string(),
                        name,
                        reason: format!("already exists but is not accessible: {}", message),
                    };
                    cr.set_condition(
                        CONDITION_STORAGE_EXISTS,
                        ConditionStatus::False,
                        "AccountUnavailable",
                        err.to_string(),
                    );
                    Err(err)
                }
                Err(e) => Err(e),
            };
        }

        let prefix = naming::account_prefix(&self.ctx.infrastructure_name);
        for attempt in 1..=AZURE_ACCOUNT.attempts {
            let candidate = AZURE_ACCOUNT.generate(&prefix);
            let availability = self.api.check_name_availability(&candidate).await?;
            if !availability.available {
                debug!(account = %candidate, attempt, reason = %availability.reason, "account name unavailable");
                continue;
            }

            match self
                .api
                .create_account(
                    &placement.resource_group,
                    &candidate,
                    &placement.location,
                    &self.ctx.resource_tags(),
                )
                .await
            {
                Ok(()) => {
                    info!(account = %candidate, "created storage account");
                    cr.record_created(ACCOUNT_RESOURCE, &candidate);
                    self.config.account_name = candidate;
                    self.persist(cr);
                    return Ok(true);
                }
                Err(Error::Cloud {
                    kind: CloudErrorKind::AlreadyExists,
                    ..
                }) => continue,
                Err(e) => return Err(e),
            }
        }

        let err = Error::NameGenerationExhausted {
            kind: AZURE_ACCOUNT.kind.to_string(),
            attempts: AZURE_ACCOUNT.attempts,
        };
        cr.set_condition(
            CONDITION_STORAGE_EXISTS,
            ConditionStatus::False,
            err.reason(),
            err.to_string(),
        );
        Err(err)
    }

    fn container_id(&self) -> String {
        format!("{}/{}", self.config.account_name, self.config.container)
    }
}

#[async_trait]
impl Driver for AzureDriver {
    fn id(&self) -> String {
        format!("azure {}/{}", self.config.account_name, self.config.container)
    }

    fn config_env(&self) -> Result<EnvVarList> {
        let cloud = AzureCloud::from_name(&self.config.cloud_name)?;
        let mut env = EnvVarList::new();
        env.push_value("REGISTRY_STORAGE", "azure")?;
        env.push_value("REGISTRY_STORAGE_AZURE_CONTAINER", &self.config.container)?;
        env.push_value("REGISTRY_STORAGE_AZURE_ACCOUNTNAME", &self.config.account_name)?;
        env.push_value("REGISTRY_STORAGE_AZURE_REALM", cloud.realm())?;
        env.push_secret(ACCOUNT_KEY_ENV, PRIVATE_CONFIGURATION_SECRET, ACCOUNT_KEY_ENV);
        Ok(env)
    }

    async fn secrets(&self) -> Result<BTreeMap<String, String>> {
        if self.config.account_name.is_empty() {
            return Ok(BTreeMap::new());
        }
        let placement = self.placement()?;
        let key = self.account_key(&placement.resource_group).await?;
        Ok(BTreeMap::from([(ACCOUNT_KEY_ENV.to_string(), key)]))
    }

    async fn storage_exists(&self, cr: &mut ImageRegistryConfig) -> Result<bool> {
        if self.config.account_name.is_empty() || self.config.container.is_empty() {
            mark_not_configured(cr, "Storage container");
            return Ok(false);
        }

        let placement = self.placement()?;
        if self
            .api
            .get_account(&placement.resource_group, &self.config.account_name)
            .await?
            .is_none()
        {
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::False,
                "AccountDoesNotExist",
                format!("Storage account {} does not exist", self.config.account_name),
            );
            return Ok(false);
        }

        let key = self.account_key(&placement.resource_group).await?;
        let exists = match self
            .api
            .container_exists(&self.config.account_name, &key, &self.config.container)
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                cr.set_condition(
                    CONDITION_STORAGE_EXISTS,
                    ConditionStatus::Unknown,
                    e.reason(),
                    e.to_string(),
                );
                return Err(e);
            }
        };

        if exists {
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::True,
                "ContainerExists",
                format!("Storage container {} exists", self.config.container),
            );
        } else {
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::False,
                "ContainerDoesNotExist",
                format!("Storage container {} does not exist", self.config.container),
            );
        }
        Ok(exists)
    }

    fn storage_changed(&self, cr: &ImageRegistryConfig) -> bool {
        payload_changed(cr, |s| &s.azure)
    }

    async fn create_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        if let Err(e) = AzureCloud::from_name(&self.config.cloud_name) {
            cr.set_condition(
                CONDITION_STORAGE_EXISTS,
                ConditionStatus::False,
                e.reason(),
                e.to_string(),
            );
            return Err(e);
        }
        let placement = self.placement()?;

        let account_created = self.ensure_account(cr, &placement).await?;
        self.persist(cr);

        if self.config.container.is_empty() {
            self.config.container = naming::container_name(&self.ctx.infrastructure_name);
            self.persist(cr);
        }

        let key = self.account_key(&placement.resource_group).await?;
        if !self
            .api
            .container_exists(&self.config.account_name, &key, &self.config.container)
            .await?
        {
            self.api
                .create_container(&self.config.account_name, &key, &self.config.container)
                .await?;
            info!(
                account = %self.config.account_name,
                container = %self.config.container,
                "created storage container"
            );
            cr.record_created(CONTAINER_RESOURCE, &self.container_id());
        }

        cr.set_condition(
            CONDITION_STORAGE_EXISTS,
            ConditionStatus::True,
            "ContainerExists",
            format!("Storage container {} exists", self.config.container),
        );
        if account_created {
            mark_created(cr);
        } else {
            mark_adopted(cr);
        }
        record_storage(cr);
        Ok(())
    }

    async fn remove_storage(&mut self, cr: &mut ImageRegistryConfig) -> Result<()> {
        if self.config.account_name.is_empty() {
            return Ok(());
        }
        let account_created = cr.created(ACCOUNT_RESOURCE, &self.config.account_name);
        let container_created =
            !self.config.container.is_empty() && cr.created(CONTAINER_RESOURCE, &self.container_id());
        if !account_created && !container_created {
            debug!(account = %self.config.account_name, "storage was adopted, nothing to remove");
            return Ok(());
        }

        let placement = self.placement()?;
        let cache_key = CredentialKey::new(&placement.resource_group, &self.config.account_name);

        if account_created {
            match self
                .api
                .delete_account(&placement.resource_group, &self.config.account_name)
                .await
            {
                Ok(()) => info!(account = %self.config.account_name, "deleted storage account"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        } else {
            let key = self.account_key(&placement.resource_group).await?;
            match self
                .api
                .delete_container(&self.config.account_name, &key, &self.config.container)
                .await
            {
                Ok(()) => info!(container = %self.config.container, "deleted storage container"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.ctx.credentials.invalidate(&cache_key).await;
        cr.forget_created(CONTAINER_RESOURCE, &self.container_id());
        self.config.container.clear();
        if account_created {
            cr.forget_created(ACCOUNT_RESOURCE, &self.config.account_name);
            self.config.account_name.clear();
        }
        self.persist(cr);
        cr.set_condition(
            CONDITION_STORAGE_EXISTS,
            ConditionStatus::False,
            "ContainerDeleted",
            "Storage container has been deleted",
        );
        Ok(())
    }
}
