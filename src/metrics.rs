//! Operator Metrics
//!
//! Counters and gauges observed by the reconciliation loop. They are a pure
//! sink: nothing reads them back to make decisions.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "image_registry_operator";

/// Install state reported for the pruner CronJob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunerInstallStatus {
    Absent = 0,
    Suspended = 1,
    Scheduled = 2,
}

/// Operator metrics registered against a private registry
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    storage_reconfigured: IntCounter,
    credential_cache_requests: IntCounterVec,
    pruner_install_status: IntGauge,
    pruner_job_failed: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let storage_reconfigured = IntCounter::with_opts(
            Opts::new(
                "storage_reconfigured_total",
                "Number of times the registry storage was reconfigured",
            )
            .namespace(NAMESPACE),
        )?;
        let credential_cache_requests = IntCounterVec::new(
            Opts::new(
                "azure_key_cache_requests_total",
                "Storage account key cache lookups by result",
            )
            .namespace(NAMESPACE),
            &["result"],
        )?;
        let pruner_install_status = IntGauge::with_opts(
            Opts::new(
                "image_pruner_install_status",
                "Pruner CronJob state: 0 absent, 1 suspended, 2 scheduled",
            )
            .namespace(NAMESPACE),
        )?;
        let pruner_job_failed = IntGauge::with_opts(
            Opts::new(
                "image_pruner_job_failed",
                "Whether the most recent pruner job failed",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(storage_reconfigured.clone()))?;
        registry.register(Box::new(credential_cache_requests.clone()))?;
        registry.register(Box::new(pruner_install_status.clone()))?;
        registry.register(Box::new(pruner_job_failed.clone()))?;

        Ok(Self {
            registry,
            storage_reconfigured,
            credential_cache_requests,
            pruner_install_status,
            pruner_job_failed,
        })
    }

    #[inline]
    pub fn record_storage_reconfigured(&self) {
        self.storage_reconfigured.inc();
    }

    #[inline]
    pub fn record_cache_hit(&self) {
        self.credential_cache_requests.with_label_values(&["hit"]).inc();
    }

    #[inline]
    pub fn record_cache_miss(&self) {
        self.credential_cache_requests.with_label_values(&["miss"]).inc();
    }

    pub fn set_pruner_install_status(&self, status: PrunerInstallStatus) {
        self.pruner_install_status.set(status as i64);
    }

    pub fn set_pruner_job_failed(&self, failed: bool) {
        self.pruner_job_failed.set(i64::from(failed));
    }

    pub fn storage_reconfigured(&self) -> u64 {
        self.storage_reconfigured.get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.credential_cache_requests.with_label_values(&["hit"]).get()
    }

    pub fn cache_misses(&self) -> u64 {
        self.credential_cache_requests.with_label_values(&["miss"]).get()
    }

    pub fn pruner_install_status(&self) -> i64 {
        self.pruner_install_status.get()
    }

    /// Text exposition of every metric
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
