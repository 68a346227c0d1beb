//! Custom Resource Definitions for the Image Registry Operator
//!
//! This module contains all CRD types:
//! - ImageRegistryConfig: registry storage and health (`configs`)
//! - ImagePruner: pruning CronJob settings and status
//! - Route: the OpenShift route fields read for health reporting

pub mod conditions;
pub mod image_pruner;
pub mod image_registry;
pub mod route;

pub use conditions::*;
pub use image_pruner::*;
pub use image_registry::*;
pub use route::*;
