//! Image pruner health
//!
//! The pruner is a CronJob; its health is whether it exists, whether it is
//! scheduled and whether the most recent job it spawned failed.

use crate::crd::{
    ConditionStatus, OperatorCondition, CONDITION_AVAILABLE, CONDITION_PRUNER_FAILED,
    CONDITION_PRUNER_SCHEDULED,
};
use crate::metrics::PrunerInstallStatus;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use std::sync::Arc;

pub struct PrunerInputs<'a> {
    pub cronjob: Option<&'a CronJob>,
    /// Jobs spawned by the pruner CronJob
    pub jobs: &'a [Arc<Job>],
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrunerEvaluation {
    pub conditions: Vec<OperatorCondition>,
    pub install_status: PrunerInstallStatus,
    pub job_failed: bool,
}

pub fn evaluate_pruner(inputs: &PrunerInputs<'_>) -> PrunerEvaluation {
    let mut conditions = Vec::with_capacity(3);

    let install_status = match inputs.cronjob {
        None => {
            conditions.push(OperatorCondition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::False,
                "NotFound",
                "The pruner CronJob does not exist",
            ));
            conditions.push(OperatorCondition::new(
                CONDITION_PRUNER_SCHEDULED,
                ConditionStatus::False,
                "NotFound",
                "The pruner CronJob does not exist",
            ));
            PrunerInstallStatus::Absent
        }
        Some(cronjob) => {
            conditions.push(OperatorCondition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::True,
                "AsExpected",
                "The pruner CronJob exists",
            ));
            let suspended = cronjob
                .spec
                .as_ref()
                .and_then(|s| s.suspend)
                .unwrap_or(false);
            if suspended {
                conditions.push(OperatorCondition::new(
                    CONDITION_PRUNER_SCHEDULED,
                    ConditionStatus::False,
                    "Suspended",
                    "The pruner job has been suspended",
                ));
                PrunerInstallStatus::Suspended
            } else {
                let schedule = cronjob
                    .spec
                    .as_ref()
                    .map(|s| s.schedule.as_str())
                    .unwrap_or_default();
                conditions.push(OperatorCondition::new(
                    CONDITION_PRUNER_SCHEDULED,
                    ConditionStatus::True,
                    "Scheduled",
                    format!("The pruner job has been scheduled: {}", schedule),
                ));
                PrunerInstallStatus::Scheduled
            }
        }
    };

    let failure = latest_job(inputs.jobs).and_then(failed_message);
    let job_failed = failure.is_some();
    conditions.push(match failure {
        Some(message) => OperatorCondition::new(
            CONDITION_PRUNER_FAILED,
            ConditionStatus::True,
            "JobFailed",
            message,
        ),
        None => OperatorCondition::new(
            CONDITION_PRUNER_FAILED,
            ConditionStatus::False,
            "Complete",
            "The last pruner job did not fail",
        ),
    });

    PrunerEvaluation {
        conditions,
        install_status,
        job_failed,
    }
}

fn latest_job(jobs: &[Arc<Job>]) -> Option<&Job> {
    jobs.iter()
        .max_by_key(|job| job.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .map(|job| job.as_ref())
}

fn failed_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Failed" && c.status == "True")
        .map(|c| c.message.clone().unwrap_or_else(|| "job failed".to_string()))
}
