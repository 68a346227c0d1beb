//! Image pruner controller
//!
//! Reports the health of the pruning CronJob on the `cluster` ImagePruner.
//! Only status is written.

use crate::config::{PRUNER_CRONJOB_NAME, PRUNER_JOB_LABEL, PRUNER_RESOURCE_NAME};
use crate::controller::{log_write_error, Reconciler, SyncAction};
use crate::crd::ImagePruner;
use crate::domain::{Lister, ObjectApi};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::status::{evaluate_pruner, PrunerInputs};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct PrunerController {
    pruners: Arc<dyn Lister<ImagePruner>>,
    pruner_api: Arc<dyn ObjectApi<ImagePruner>>,
    cronjobs: Arc<dyn Lister<CronJob>>,
    jobs: Arc<dyn Lister<Job>>,
    metrics: Arc<Metrics>,
}

impl PrunerController {
    pub fn new(
        pruners: Arc<dyn Lister<ImagePruner>>,
        pruner_api: Arc<dyn ObjectApi<ImagePruner>>,
        cronjobs: Arc<dyn Lister<CronJob>>,
        jobs: Arc<dyn Lister<Job>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pruners,
            pruner_api,
            cronjobs,
            jobs,
            metrics,
        }
    }
}

#[async_trait]
impl Reconciler for PrunerController {
    fn name(&self) -> &'static str {
        "imagepruner"
    }

    async fn sync(&self) -> Result<SyncAction> {
        let cronjob = self.cronjobs.get(PRUNER_CRONJOB_NAME);
        let selector = BTreeMap::from([(
            PRUNER_JOB_LABEL.0.to_string(),
            PRUNER_JOB_LABEL.1.to_string(),
        )]);
        let jobs = self.jobs.list(&selector);

        let evaluation = evaluate_pruner(&PrunerInputs {
            cronjob: cronjob.as_deref(),
            jobs: &jobs,
        });
        self.metrics
            .set_pruner_install_status(evaluation.install_status);
        self.metrics.set_pruner_job_failed(evaluation.job_failed);

        let cached = match self.pruners.get(PRUNER_RESOURCE_NAME) {
            Some(pruner) => pruner,
            None => {
                debug!("no image pruner configuration");
                return Ok(SyncAction::AwaitChange);
            }
        };

        let mut pruner = (*cached).clone();
        let previous_status = pruner.status.clone();
        let now = Utc::now();
        for condition in evaluation.conditions {
            pruner.upsert_condition(condition, now);
        }
        pruner.status_mut().observed_generation = pruner.metadata.generation;

        if pruner.status != previous_status {
            self.pruner_api
                .replace_status(&pruner)
                .await
                .map_err(log_write_error("image pruner", "status"))?;
            debug!("image pruner status updated");
        }
        Ok(SyncAction::AwaitChange)
    }
}
