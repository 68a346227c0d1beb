//! TTL cache for cloud credentials
//!
//! One instance is shared by every driver of the process. The lock is held
//! across the remote fetch so concurrent misses for the same key fetch once.

use crate::error::Result;
use crate::metrics::Metrics;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Identifies a cached credential
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub resource_group: String,
    pub account: String,
}

impl CredentialKey {
    pub fn new(resource_group: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            resource_group: resource_group.into(),
            account: account.into(),
        }
    }
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.account)
    }
}

/// Remote source of a credential
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self, key: &CredentialKey) -> Result<String>;
}

#[derive(Debug)]
struct CachedCredential {
    value: String,
    expire_at: Instant,
}

/// Bounded TTL cache keyed by `(resourceGroup, account)`.
///
/// Holds at most `capacity` keys; inserting past capacity evicts the
/// oldest insertion. A capacity of one reproduces a single-slot cache where
/// switching keys evicts the previous entry.
#[derive(Debug)]
pub struct CredentialCache {
    entries: Mutex<IndexMap<CredentialKey, CachedCredential>>,
    ttl: Duration,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl CredentialCache {
    pub fn new(ttl: Duration, capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            ttl,
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Return the cached value for `key`, fetching it on a miss or expiry
    pub async fn get(&self, fetcher: &dyn CredentialFetcher, key: &CredentialKey) -> Result<String> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            if Instant::now() < entry.expire_at {
                self.metrics.record_cache_hit();
                return Ok(entry.value.clone());
            }
        }

        self.metrics.record_cache_miss();
        debug!(key = %key, "credential cache miss");

        let value = fetcher.fetch(key).await?;
        let now = Instant::now();

        entries.shift_remove(key);
        entries.retain(|_, entry| now < entry.expire_at);
        while entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(
            key.clone(),
            CachedCredential {
                value: value.clone(),
                expire_at: now + self.ttl,
            },
        );

        Ok(value)
    }

    /// Drop a credential, e.g. after the account was deleted
    pub async fn invalidate(&self, key: &CredentialKey) {
        self.entries.lock().await.shift_remove(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialFetcher for CountingFetcher {
        async fn fetch(&self, key: &CredentialKey) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{}", key.account, n))
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl CredentialFetcher for FailingFetcher {
        async fn fetch(&self, _key: &CredentialKey) -> Result<String> {
            Err(Error::Internal("remote unavailable".into()))
        }
    }

    fn cache(ttl_secs: u64, capacity: usize) -> (CredentialCache, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        (
            CredentialCache::new(Duration::from_secs(ttl_secs), capacity, metrics.clone()),
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_fetches_once() {
        let (cache, metrics) = cache(60, 8);
        let fetcher = CountingFetcher::default();
        let key = CredentialKey::new("rg", "account");

        let first = cache.get(&fetcher, &key).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let second = cache.get(&fetcher, &key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.cache_hits(), 1);
        assert_eq!(metrics.cache_misses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_refetches() {
        let (cache, _) = cache(60, 8);
        let fetcher = CountingFetcher::default();
        let key = CredentialKey::new("rg", "account");

        cache.get(&fetcher, &key).await.unwrap();
        cache.get(&fetcher, &key).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let refreshed = cache.get(&fetcher, &key).await.unwrap();

        assert_eq!(refreshed, "account-1");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_key_fetches() {
        let (cache, _) = cache(60, 8);
        let fetcher = CountingFetcher::default();

        cache.get(&fetcher, &CredentialKey::new("rg", "a")).await.unwrap();
        cache.get(&fetcher, &CredentialKey::new("rg", "a")).await.unwrap();
        cache.get(&fetcher, &CredentialKey::new("other", "a")).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_switching_keys_evicts() {
        let (cache, _) = cache(60, 1);
        let fetcher = CountingFetcher::default();
        let a = CredentialKey::new("rg", "a");
        let b = CredentialKey::new("rg", "b");

        cache.get(&fetcher, &a).await.unwrap();
        cache.get(&fetcher, &b).await.unwrap();
        cache.get(&fetcher, &a).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_is_not_cached() {
        let (cache, _) = cache(60, 8);
        let key = CredentialKey::new("rg", "a");

        assert!(cache.get(&FailingFetcher, &key).await.is_err());
        assert_eq!(cache.len().await, 0);

        let fetcher = CountingFetcher::default();
        assert_eq!(cache.get(&fetcher, &key).await.unwrap(), "a-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let (cache, _) = cache(60, 8);
        let fetcher = CountingFetcher::default();
        let key = CredentialKey::new("rg", "a");

        cache.get(&fetcher, &key).await.unwrap();
        cache.invalidate(&key).await;
        cache.get(&fetcher, &key).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
