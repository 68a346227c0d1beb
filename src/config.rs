//! Operator configuration and well-known object names

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Well-known names
// =============================================================================

/// Name of the singleton image registry Config
pub const REGISTRY_RESOURCE_NAME: &str = "cluster";

/// Name of the singleton ImagePruner
pub const PRUNER_RESOURCE_NAME: &str = "cluster";

/// Default operator namespace
pub const DEFAULT_NAMESPACE: &str = "openshift-image-registry";

/// Registry workload deployment
pub const DEPLOYMENT_NAME: &str = "image-registry";

/// Route created when `spec.defaultRoute` is enabled
pub const DEFAULT_ROUTE_NAME: &str = "default-route";

/// Secret minted with cloud credentials for the operator
pub const CLOUD_CREDENTIALS_SECRET: &str = "installer-cloud-credentials";

/// Secret consumed by the registry workload
pub const PRIVATE_CONFIGURATION_SECRET: &str = "image-registry-private-configuration";

/// Claim created when the PVC backend has no claim name
pub const DEFAULT_PVC_NAME: &str = "image-registry-storage";

/// Annotation marking claims created by the operator
pub const PVC_OWNER_ANNOTATION: &str = "imageregistry.openshift.io";

/// Pruner CronJob
pub const PRUNER_CRONJOB_NAME: &str = "image-pruner";

/// Label selecting jobs spawned by the pruner CronJob
pub const PRUNER_JOB_LABEL: (&str, &str) = ("created-by", "image-pruner");

/// Registry image used when none is configured
pub const DEFAULT_REGISTRY_IMAGE: &str = "quay.io/openshift/origin-docker-registry:latest";

/// Port the registry listens on
pub const REGISTRY_PORT: i32 = 5000;

/// Field manager used for writes
pub const FIELD_MANAGER: &str = "image-registry-operator";

// =============================================================================
// Platform
// =============================================================================

/// Infrastructure platform the cluster runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Aws,
    Azure,
    IbmCloud,
    AlibabaCloud,
    #[default]
    None,
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Platform::Aws),
            "azure" => Ok(Platform::Azure),
            "ibmcloud" | "ibm" => Ok(Platform::IbmCloud),
            "alibabacloud" | "alibaba" => Ok(Platform::AlibabaCloud),
            "none" | "" | "baremetal" => Ok(Platform::None),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Aws => write!(f, "aws"),
            Platform::Azure => write!(f, "azure"),
            Platform::IbmCloud => write!(f, "ibmcloud"),
            Platform::AlibabaCloud => write!(f, "alibabacloud"),
            Platform::None => write!(f, "none"),
        }
    }
}

// =============================================================================
// Operator Configuration
// =============================================================================

/// Configuration for the operator
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace holding the registry workload and its secrets
    pub namespace: String,
    /// Platform used to pick the bootstrap storage backend
    pub platform: Platform,
    /// Default cloud region when the CR does not carry one
    pub region: String,
    /// Cluster infrastructure name, prefix for generated resource names
    pub infrastructure_name: String,
    /// How long a fetched storage account key stays valid
    pub credential_cache_ttl: Duration,
    /// Number of distinct accounts whose keys are cached
    pub credential_cache_capacity: usize,
    /// First requeue delay after a failed sync
    pub queue_initial_backoff: Duration,
    /// Requeue delay cap
    pub queue_max_backoff: Duration,
    /// Image of the registry workload
    pub registry_image: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            platform: Platform::None,
            region: String::new(),
            infrastructure_name: String::new(),
            credential_cache_ttl: Duration::from_secs(20 * 60),
            credential_cache_capacity: 8,
            queue_initial_backoff: Duration::from_millis(5),
            queue_max_backoff: Duration::from_secs(1000),
            registry_image: DEFAULT_REGISTRY_IMAGE.to_string(),
        }
    }
}
