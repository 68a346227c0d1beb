//! Image Registry Operator - Storage Control Plane
//!
//! A Kubernetes operator that provisions the backing storage of a managed
//! image registry (Azure, S3, IBM COS, Alibaba OSS, PVC, EmptyDir or a user
//! volume) and reports the registry's health through status conditions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Informers (reflector stores)                          │
//! │   Config · Deployment · Route · Secret · PVC · ImagePruner · CronJob · Job   │
//! └───────────────────────────────────┬─────────────────────────────────────────┘
//!                                     │ one coalesced key per controller
//! ┌───────────────────────────────────┴─────────────────────────────────────────┐
//! │                      Rate-limited Work Queue + Worker                        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  sync():  Storage Applier ──► Condition Engine ──► spec / status writes      │
//! │                 │                                                            │
//! │        ┌────────┴──────────────────────────────────────────┐                │
//! │        │                 Storage Drivers                     │                │
//! │        │  Azure · S3 · IBM COS · OSS · PVC · EmptyDir · FS   │                │
//! │        └────────┬──────────────────────────────────────────┘                │
//! │                 │                                                            │
//! │        ┌────────┴────────┐                                                   │
//! │        │ Credential Cache│  (account keys, TTL bounded)                      │
//! │        └─────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: work queue, event handlers and the sync loops
//! - [`storage`]: driver contract and backend drivers
//! - [`status`]: registry and pruner condition engines
//! - [`cache`]: credential cache
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: ports implemented by [`adapters`]
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod status;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{OperatorConfig, Platform};

pub use controller::{
    run_worker, EventHandler, PrunerController, Reconciler, RegistryController, StorageApplier,
    SyncAction, WorkQueue,
};

pub use crd::{
    ImagePruner, ImageRegistryConfig, ImageRegistryConfigStorage, ImageRegistrySpec,
    ImageRegistryStatus, ManagementState, OperatorCondition, Route, StorageBackend,
};

pub use domain::ports::{
    AzureStorageApi, BucketApi, IbmResourceApi, Lister, ObjectApi, WorkloadApplier,
};

pub use error::{ApplyError, Error, ErrorAction, Result};

pub use cache::{CredentialCache, CredentialFetcher, CredentialKey};
pub use metrics::Metrics;
pub use storage::{new_driver, Driver, DriverContext, WorkloadStorage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
