//! In-process cloud backends
//!
//! Simulated implementations of the cloud ports, keeping state in memory.
//! Only compiled for tests: a process-local backend must never stand in for
//! real storage.
//! They follow the error behaviour of the real services closely enough to
//! exercise every provisioning path: global name collisions, names owned
//! by another account, throttling and missing resources.

use crate::domain::ports::{
    AzureStorageApi, BucketApi, BucketEncryption, HmacKeys, IbmResourceApi, NameAvailability,
    ResourceKey, StorageAccount,
};
use crate::error::{CloudErrorKind, Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// =============================================================================
// Fault Injection
// =============================================================================

/// Queue of errors returned by upcoming calls, one per call. An entry bound
/// to an operation waits until that operation runs.
#[derive(Debug, Default)]
struct Faults {
    pending: Mutex<VecDeque<(Option<&'static str>, CloudErrorKind)>>,
}

impl Faults {
    fn push(&self, operation: Option<&'static str>, kind: CloudErrorKind) {
        self.pending.lock().push_back((operation, kind));
    }

    fn check(&self, backend: &str, operation: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        match pending.front() {
            Some((target, kind)) if target.map_or(true, |t| t == operation) => {
                let kind = *kind;
                pending.pop_front();
                Err(Error::cloud(backend, operation, kind, "injected failure"))
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Buckets (S3, IBM COS, OSS)
// =============================================================================

/// Configuration recorded on a simulated bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketState {
    pub region: String,
    pub tags: BTreeMap<String, String>,
    pub encryption: Option<BucketEncryption>,
    pub abort_multipart_days: Option<u32>,
    pub public_access_blocked: bool,
}

/// Simulated S3-compatible object store
#[derive(Debug)]
pub struct InMemoryBuckets {
    backend: &'static str,
    buckets: RwLock<BTreeMap<String, BucketState>>,
    /// Names owned by other accounts
    reserved: RwLock<BTreeSet<String>>,
    collisions: AtomicUsize,
    create_calls: AtomicUsize,
    faults: Faults,
}

impl InMemoryBuckets {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            buckets: RwLock::new(BTreeMap::new()),
            reserved: RwLock::new(BTreeSet::new()),
            collisions: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            faults: Faults::default(),
        }
    }

    /// Mark a bucket name as owned by another account
    pub fn reserve(&self, bucket: &str) {
        self.reserved.write().insert(bucket.to_string());
    }

    /// Make the next `n` creations fail with a global name collision
    pub fn collide_next_creates(&self, n: usize) {
        self.collisions.store(n, Ordering::SeqCst);
    }

    /// Fail the next call with the given error kind
    pub fn fail_next(&self, kind: CloudErrorKind) {
        self.faults.push(None, kind);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn bucket(&self, bucket: &str) -> Option<BucketState> {
        self.buckets.read().get(bucket).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.read().keys().cloned().collect()
    }

    fn not_found(&self, operation: &str, bucket: &str) -> Error {
        Error::cloud(
            self.backend,
            operation,
            CloudErrorKind::NotFound,
            format!("bucket {} does not exist", bucket),
        )
    }

    fn update(
        &self,
        operation: &str,
        bucket: &str,
        f: impl FnOnce(&mut BucketState),
    ) -> Result<()> {
        self.faults.check(self.backend, operation)?;
        let mut buckets = self.buckets.write();
        let state = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.not_found(operation, bucket))?;
        f(state);
        Ok(())
    }
}

#[async_trait]
impl BucketApi for InMemoryBuckets {
    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        self.faults.check(self.backend, "HeadBucket")?;
        if self.reserved.read().contains(bucket) {
            return Err(Error::cloud(
                self.backend,
                "HeadBucket",
                CloudErrorKind::AccessDenied,
                format!("access to bucket {} is forbidden", bucket),
            ));
        }
        if self.buckets.read().contains_key(bucket) {
            Ok(())
        } else {
            Err(self.not_found("HeadBucket", bucket))
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.faults.check(self.backend, "CreateBucket")?;

        let collide = self
            .collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if collide || self.reserved.read().contains(bucket) {
            return Err(Error::cloud(
                self.backend,
                "CreateBucket",
                CloudErrorKind::AlreadyExists,
                format!("bucket {} already exists", bucket),
            ));
        }

        let mut buckets = self.buckets.write();
        if buckets.contains_key(bucket) {
            return Err(Error::cloud(
                self.backend,
                "CreateBucket",
                CloudErrorKind::AlreadyOwned,
                format!("bucket {} is already owned by you", bucket),
            ));
        }

        info!(backend = self.backend, bucket, region, "creating simulated bucket");
        buckets.insert(
            bucket.to_string(),
            BucketState {
                region: region.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.faults.check(self.backend, "DeleteBucket")?;
        match self.buckets.write().remove(bucket) {
            Some(_) => {
                info!(backend = self.backend, bucket, "deleted simulated bucket");
                Ok(())
            }
            None => Err(self.not_found("DeleteBucket", bucket)),
        }
    }

    async fn put_tags(&self, bucket: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.update("PutBucketTagging", bucket, |state| state.tags = tags.clone())
    }

    async fn put_encryption(&self, bucket: &str, encryption: &BucketEncryption) -> Result<()> {
        self.update("PutBucketEncryption", bucket, |state| {
            state.encryption = Some(encryption.clone())
        })
    }

    async fn put_abort_multipart_rule(&self, bucket: &str, days: u32) -> Result<()> {
        self.update("PutBucketLifecycle", bucket, |state| {
            state.abort_multipart_days = Some(days)
        })
    }

    async fn block_public_access(&self, bucket: &str) -> Result<()> {
        self.update("PutPublicAccessBlock", bucket, |state| {
            state.public_access_blocked = true
        })
    }
}

// =============================================================================
// Azure
// =============================================================================

/// Simulated storage account
#[derive(Debug, Clone)]
pub struct AccountState {
    pub account: StorageAccount,
    pub keys: Vec<String>,
    pub containers: BTreeSet<String>,
}

/// Simulated Azure storage management plane and blob service
#[derive(Debug, Default)]
pub struct InMemoryAzure {
    accounts: RwLock<BTreeMap<String, AccountState>>,
    /// Account names taken in other subscriptions
    reserved: RwLock<BTreeSet<String>>,
    unavailable_checks: AtomicUsize,
    list_keys_calls: AtomicUsize,
    faults: Faults,
}

impl InMemoryAzure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, account: &str) {
        self.reserved.write().insert(account.to_string());
    }

    /// Report the next `n` generated names as taken
    pub fn reject_next_names(&self, n: usize) {
        self.unavailable_checks.store(n, Ordering::SeqCst);
    }

    pub fn fail_next(&self, kind: CloudErrorKind) {
        self.faults.push(None, kind);
    }

    pub fn list_keys_calls(&self) -> usize {
        self.list_keys_calls.load(Ordering::SeqCst)
    }

    pub fn account(&self, account: &str) -> Option<AccountState> {
        self.accounts.read().get(account).cloned()
    }

    pub fn account_names(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }

    fn error(operation: &str, kind: CloudErrorKind, message: String) -> Error {
        Error::cloud("azure", operation, kind, message)
    }

    /// Run `f` against an account after validating the access key
    fn with_account<T>(
        &self,
        operation: &str,
        account: &str,
        key: &str,
        f: impl FnOnce(&mut AccountState) -> T,
    ) -> Result<T> {
        self.faults.check("azure", operation)?;
        let mut accounts = self.accounts.write();
        let state = accounts.get_mut(account).ok_or_else(|| {
            Self::error(
                operation,
                CloudErrorKind::NotFound,
                format!("storage account {} not found", account),
            )
        })?;
        if !state.keys.iter().any(|k| k == key) {
            return Err(Self::error(
                operation,
                CloudErrorKind::AccessDenied,
                "server failed to authenticate the request".to_string(),
            ));
        }
        Ok(f(state))
    }
}

#[async_trait]
impl AzureStorageApi for InMemoryAzure {
    async fn check_name_availability(&self, account: &str) -> Result<NameAvailability> {
        self.faults.check("azure", "CheckNameAvailability")?;
        let forced = self
            .unavailable_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let taken = forced
            || self.reserved.read().contains(account)
            || self.accounts.read().contains_key(account);
        Ok(NameAvailability {
            available: !taken,
            reason: if taken { "AlreadyExists".to_string() } else { String::new() },
        })
    }

    async fn get_account(
        &self,
        resource_group: &str,
        account: &str,
    ) -> Result<Option<StorageAccount>> {
        self.faults.check("azure", "GetProperties")?;
        Ok(self
            .accounts
            .read()
            .get(account)
            .filter(|state| state.account.resource_group == resource_group)
            .map(|state| state.account.clone()))
    }

    async fn create_account(
        &self,
        resource_group: &str,
        account: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.faults.check("azure", "CreateAccount")?;
        if self.reserved.read().contains(account) {
            return Err(Self::error(
                "CreateAccount",
                CloudErrorKind::AlreadyExists,
                format!("storage account {} is already taken", account),
            ));
        }

        let mut accounts = self.accounts.write();
        if let Some(existing) = accounts.get(account) {
            if existing.account.resource_group == resource_group {
                return Ok(());
            }
            return Err(Self::error(
                "CreateAccount",
                CloudErrorKind::AlreadyExists,
                format!("storage account {} is already taken", account),
            ));
        }

        info!(account, resource_group, location, "creating simulated storage account");
        accounts.insert(
            account.to_string(),
            AccountState {
                account: StorageAccount {
                    name: account.to_string(),
                    resource_group: resource_group.to_string(),
                    location: location.to_string(),
                    tags: tags.clone(),
                },
                keys: vec![random_token(44), random_token(44)],
                containers: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn delete_account(&self, resource_group: &str, account: &str) -> Result<()> {
        self.faults.check("azure", "DeleteAccount")?;
        let mut accounts = self.accounts.write();
        match accounts.get(account) {
            Some(state) if state.account.resource_group == resource_group => {
                accounts.remove(account);
                info!(account, "deleted simulated storage account");
                Ok(())
            }
            _ => Err(Self::error(
                "DeleteAccount",
                CloudErrorKind::NotFound,
                format!("storage account {} not found", account),
            )),
        }
    }

    async fn list_keys(&self, resource_group: &str, account: &str) -> Result<Vec<String>> {
        self.list_keys_calls.fetch_add(1, Ordering::SeqCst);
        self.faults.check("azure", "ListKeys")?;
        self.accounts
            .read()
            .get(account)
            .filter(|state| state.account.resource_group == resource_group)
            .map(|state| state.keys.clone())
            .ok_or_else(|| {
                Self::error(
                    "ListKeys",
                    CloudErrorKind::NotFound,
                    format!("storage account {} not found", account),
                )
            })
    }

    async fn container_exists(&self, account: &str, key: &str, container: &str) -> Result<bool> {
        self.with_account("GetContainerProperties", account, key, |state| {
            state.containers.contains(container)
        })
    }

    async fn create_container(&self, account: &str, key: &str, container: &str) -> Result<()> {
        self.with_account("CreateContainer", account, key, |state| {
            debug!(account, container, "creating simulated container");
            state.containers.insert(container.to_string());
        })
    }

    async fn delete_container(&self, account: &str, key: &str, container: &str) -> Result<()> {
        let removed = self.with_account("DeleteContainer", account, key, |state| {
            state.containers.remove(container)
        })?;
        if removed {
            Ok(())
        } else {
            Err(Self::error(
                "DeleteContainer",
                CloudErrorKind::NotFound,
                format!("container {} not found", container),
            ))
        }
    }
}

// =============================================================================
// IBM Resource Controller
// =============================================================================

#[derive(Debug, Clone)]
struct InstanceState {
    name: String,
    resource_group: String,
}

/// Simulated IBM Cloud resource controller
#[derive(Debug, Default)]
pub struct InMemoryIbmResources {
    instances: RwLock<BTreeMap<String, InstanceState>>,
    /// Resource key CRN to (instance CRN, credentials)
    keys: RwLock<BTreeMap<String, (String, HmacKeys)>>,
    next_id: AtomicU64,
    faults: Faults,
}

impl InMemoryIbmResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, kind: CloudErrorKind) {
        self.faults.push(None, kind);
    }

    /// Fail the next call of `operation`, e.g. `CreateResourceKey`
    pub fn fail_operation(&self, operation: &'static str, kind: CloudErrorKind) {
        self.faults.push(Some(operation), kind);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    /// Revoke a key behind the operator's back
    pub fn revoke_key(&self, key_crn: &str) {
        self.keys.write().remove(key_crn);
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl IbmResourceApi for InMemoryIbmResources {
    async fn instance_exists(&self, crn: &str) -> Result<bool> {
        self.faults.check("ibmcos", "GetResourceInstance")?;
        Ok(self.instances.read().contains_key(crn))
    }

    async fn create_instance(&self, name: &str, resource_group: &str) -> Result<String> {
        self.faults.check("ibmcos", "CreateResourceInstance")?;
        let crn = format!(
            "crn:v1:bluemix:public:cloud-object-storage:global:a/{}:{}::",
            resource_group,
            self.id()
        );
        info!(name, resource_group, crn = %crn, "creating simulated COS instance");
        self.instances.write().insert(
            crn.clone(),
            InstanceState {
                name: name.to_string(),
                resource_group: resource_group.to_string(),
            },
        );
        Ok(crn)
    }

    async fn delete_instance(&self, crn: &str) -> Result<()> {
        self.faults.check("ibmcos", "DeleteResourceInstance")?;
        let removed = self.instances.write().remove(crn);
        match removed {
            Some(instance) => {
                self.keys.write().retain(|_, (owner, _)| owner != crn);
                info!(name = %instance.name, group = %instance.resource_group, "deleted simulated COS instance");
                Ok(())
            }
            None => Err(Error::cloud(
                "ibmcos",
                "DeleteResourceInstance",
                CloudErrorKind::NotFound,
                format!("instance {} not found", crn),
            )),
        }
    }

    async fn create_hmac_key(&self, instance_crn: &str, name: &str) -> Result<ResourceKey> {
        self.faults.check("ibmcos", "CreateResourceKey")?;
        if !self.instances.read().contains_key(instance_crn) {
            return Err(Error::cloud(
                "ibmcos",
                "CreateResourceKey",
                CloudErrorKind::NotFound,
                format!("instance {} not found", instance_crn),
            ));
        }

        let crn = format!("{}resource-key:{}", instance_crn, self.id());
        let hmac = HmacKeys {
            access_key_id: random_token(32).to_lowercase(),
            secret_access_key: random_token(48).to_lowercase(),
        };
        debug!(name, crn = %crn, "creating simulated HMAC key");
        self.keys
            .write()
            .insert(crn.clone(), (instance_crn.to_string(), hmac.clone()));
        Ok(ResourceKey { crn, hmac })
    }

    async fn get_hmac_key(&self, key_crn: &str) -> Result<Option<HmacKeys>> {
        self.faults.check("ibmcos", "GetResourceKey")?;
        Ok(self.keys.read().get(key_crn).map(|(_, hmac)| hmac.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let s3 = InMemoryBuckets::new("s3");
        assert!(s3.head_bucket("b").await.unwrap_err().is_not_found());

        s3.create_bucket("b", "us-east-1").await.unwrap();
        s3.head_bucket("b").await.unwrap();
        assert_matches!(
            s3.create_bucket("b", "us-east-1").await,
            Err(Error::Cloud { kind: CloudErrorKind::AlreadyOwned, .. })
        );

        s3.delete_bucket("b").await.unwrap();
        assert!(s3.delete_bucket("b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reserved_bucket() {
        let s3 = InMemoryBuckets::new("s3");
        s3.reserve("theirs");
        assert_matches!(
            s3.head_bucket("theirs").await,
            Err(Error::Cloud { kind: CloudErrorKind::AccessDenied, .. })
        );
        assert_matches!(
            s3.create_bucket("theirs", "r").await,
            Err(Error::Cloud { kind: CloudErrorKind::AlreadyExists, .. })
        );
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let s3 = InMemoryBuckets::new("s3");
        s3.fail_next(CloudErrorKind::Throttled);
        assert!(s3.create_bucket("b", "r").await.unwrap_err().is_retryable());
        s3.create_bucket("b", "r").await.unwrap();
    }

    #[tokio::test]
    async fn test_azure_account_and_container() {
        let azure = InMemoryAzure::new();
        azure
            .create_account("rg", "acct", "eastus", &BTreeMap::new())
            .await
            .unwrap();
        let keys = azure.list_keys("rg", "acct").await.unwrap();
        assert_eq!(keys.len(), 2);

        assert!(!azure.container_exists("acct", &keys[0], "c").await.unwrap());
        azure.create_container("acct", &keys[0], "c").await.unwrap();
        assert!(azure.container_exists("acct", &keys[1], "c").await.unwrap());

        assert_matches!(
            azure.container_exists("acct", "wrong", "c").await,
            Err(Error::Cloud { kind: CloudErrorKind::AccessDenied, .. })
        );

        let availability = azure.check_name_availability("acct").await.unwrap();
        assert!(!availability.available);
        assert!(azure.get_account("other-rg", "acct").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ibm_instance_owns_keys() {
        let ibm = InMemoryIbmResources::new();
        let crn = ibm.create_instance("cos", "rg").await.unwrap();
        let key = ibm.create_hmac_key(&crn, "hmac").await.unwrap();
        assert_eq!(ibm.get_hmac_key(&key.crn).await.unwrap(), Some(key.hmac));

        ibm.delete_instance(&crn).await.unwrap();
        assert!(!ibm.instance_exists(&crn).await.unwrap());
        assert_eq!(ibm.key_count(), 0);
    }
}
