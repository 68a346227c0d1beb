//! Adapters - concrete implementations of the domain ports
//!
//! - [`kubernetes`]: reflector-backed listers, typed clients and the
//!   registry Deployment applier
//! - `cloud`: in-process storage backends, test builds only

#[cfg(test)]
pub mod cloud;
pub mod kubernetes;

#[cfg(test)]
pub use cloud::{InMemoryAzure, InMemoryBuckets, InMemoryIbmResources};
pub use kubernetes::{DeploymentApplier, KubeObjectApi, StoreLister};
