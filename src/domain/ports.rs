//! Domain Ports - Core trait definitions for the registry operator
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems: the Kubernetes object store and the cloud storage APIs.
//! Adapters implement these traits to provide concrete functionality.

use crate::crd::ImageRegistryConfig;
use crate::error::Result;
use crate::storage::WorkloadStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Object Store Ports
// =============================================================================

/// Point reads from a shared informer cache.
///
/// Returned objects are shared with the cache and must be cloned before
/// any field is written.
pub trait Lister<K>: Send + Sync {
    /// Get an object by name
    fn get(&self, name: &str) -> Option<Arc<K>>;

    /// List objects carrying all of the given labels
    fn list(&self, labels: &BTreeMap<String, String>) -> Vec<Arc<K>>;
}

/// Typed client with optimistic concurrency on writes.
///
/// `replace` and `replace_status` fail with a conflict when the object's
/// resourceVersion is stale.
#[async_trait]
pub trait ObjectApi<K: Send + Sync>: Send + Sync {
    /// Read straight from the API server
    async fn get(&self, name: &str) -> Result<Option<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Write metadata and spec
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Write the status subresource
    async fn replace_status(&self, obj: &K) -> Result<K>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Realizes the registry workload from the rendered storage surface.
#[async_trait]
pub trait WorkloadApplier: Send + Sync {
    async fn apply(&self, config: &ImageRegistryConfig, storage: &WorkloadStorage) -> Result<()>;

    /// Tear the workload down when the registry is Removed
    async fn remove(&self, config: &ImageRegistryConfig) -> Result<()>;
}

// =============================================================================
// Azure Port
// =============================================================================

/// Result of a global storage account name check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAvailability {
    pub available: bool,
    pub reason: String,
}

/// Storage account as reported by Azure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccount {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub tags: BTreeMap<String, String>,
}

/// Azure storage management and blob container operations
#[async_trait]
pub trait AzureStorageApi: Send + Sync {
    async fn check_name_availability(&self, account: &str) -> Result<NameAvailability>;

    async fn get_account(
        &self,
        resource_group: &str,
        account: &str,
    ) -> Result<Option<StorageAccount>>;

    async fn create_account(
        &self,
        resource_group: &str,
        account: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn delete_account(&self, resource_group: &str, account: &str) -> Result<()>;

    /// Access keys of the account, primary first
    async fn list_keys(&self, resource_group: &str, account: &str) -> Result<Vec<String>>;

    async fn container_exists(&self, account: &str, key: &str, container: &str) -> Result<bool>;

    async fn create_container(&self, account: &str, key: &str, container: &str) -> Result<()>;

    async fn delete_container(&self, account: &str, key: &str, container: &str) -> Result<()>;
}

// =============================================================================
// Bucket Port (S3, IBM COS, OSS)
// =============================================================================

/// Server side encryption applied to a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketEncryption {
    Aes256,
    Kms { key_id: String },
}

/// S3-style bucket operations
#[async_trait]
pub trait BucketApi: Send + Sync {
    /// Succeeds when the bucket exists and is reachable with our credentials
    async fn head_bucket(&self, bucket: &str) -> Result<()>;

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    /// Delete the bucket together with its objects
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    async fn put_tags(&self, bucket: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    async fn put_encryption(&self, bucket: &str, encryption: &BucketEncryption) -> Result<()>;

    /// Abort incomplete multipart uploads after `days`
    async fn put_abort_multipart_rule(&self, bucket: &str, days: u32) -> Result<()>;

    /// Block public access (private ACL on backends without access blocks)
    async fn block_public_access(&self, bucket: &str) -> Result<()>;
}

// =============================================================================
// IBM Resource Controller Port
// =============================================================================

/// HMAC credentials of an IBM COS resource key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmacKeys {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Resource key with HMAC credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub crn: String,
    pub hmac: HmacKeys,
}

/// IBM Cloud resource controller
#[async_trait]
pub trait IbmResourceApi: Send + Sync {
    /// Whether the service instance exists and is active
    async fn instance_exists(&self, crn: &str) -> Result<bool>;

    /// Create a Cloud Object Storage instance, returning its CRN
    async fn create_instance(&self, name: &str, resource_group: &str) -> Result<String>;

    async fn delete_instance(&self, crn: &str) -> Result<()>;

    async fn create_hmac_key(&self, instance_crn: &str, name: &str) -> Result<ResourceKey>;

    async fn get_hmac_key(&self, key_crn: &str) -> Result<Option<HmacKeys>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type AzureStorageApiRef = Arc<dyn AzureStorageApi>;
pub type BucketApiRef = Arc<dyn BucketApi>;
pub type IbmResourceApiRef = Arc<dyn IbmResourceApi>;
pub type WorkloadApplierRef = Arc<dyn WorkloadApplier>;
