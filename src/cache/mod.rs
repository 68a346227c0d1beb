//! Credential Caching
//!
//! Cloud drivers need secrets that are slow and rate limited to fetch, such
//! as storage account keys. The cache keeps them for a fixed TTL and checks
//! expiry lazily on access; there is no background eviction.
//!
//! # Usage
//!
//! ```ignore
//! use image_registry_operator::cache::{CredentialCache, CredentialKey};
//!
//! let cache = CredentialCache::new(Duration::from_secs(1200), 8, metrics);
//! let key = CredentialKey::new("my-resource-group", "myaccount");
//! let account_key = cache.get(&fetcher, &key).await?;
//! ```

pub mod credentials;

pub use credentials::{CredentialCache, CredentialFetcher, CredentialKey};
