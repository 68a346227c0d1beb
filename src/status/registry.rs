//! Registry health
//!
//! Computes `Available`, `Progressing`, `Degraded` and `Removed` from the
//! management state, the registry deployment, its routes and the result of
//! the last apply step. Each condition is decided by its own priority
//! chain; the route overlay runs last and can only escalate `Degraded`.

use crate::crd::{
    find_condition, set_condition, ConditionStatus, ManagementState, OperatorCondition, Route,
    CONDITION_AVAILABLE, CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_REMOVED,
    ROUTE_CONDITION_ADMITTED,
};
use crate::error::ApplyError;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;

/// How long the registry may stay unavailable before it is degraded
pub const UNAVAILABLE_GRACE_SECS: i64 = 60;

const NO_REPLICAS_AVAILABLE: &str = "NoReplicasAvailable";

/// Everything the registry conditions depend on
pub struct RegistryInputs<'a> {
    pub management_state: &'a ManagementState,
    pub deployment: Option<&'a Deployment>,
    /// Routes the registry is configured with, in configuration order
    pub routes: &'a [Arc<Route>],
    pub apply_error: Option<&'a ApplyError>,
}

/// The four registry conditions
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConditions {
    pub available: OperatorCondition,
    pub progressing: OperatorCondition,
    pub degraded: OperatorCondition,
    pub removed: OperatorCondition,
}

impl RegistryConditions {
    /// Upsert into a condition list
    pub fn apply(self, conditions: &mut Vec<OperatorCondition>, now: DateTime<Utc>) {
        for condition in [self.available, self.progressing, self.degraded, self.removed] {
            set_condition(conditions, condition, now);
        }
    }
}

fn condition(
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> OperatorCondition {
    OperatorCondition::new(condition_type, status, reason, message)
}

// =============================================================================
// Deployment Rollout
// =============================================================================

#[derive(Debug, PartialEq)]
enum Rollout {
    Missing,
    Deleting,
    Complete,
    Partial { deadline_exceeded: Option<String> },
    Unavailable,
}

fn rollout(deployment: Option<&Deployment>) -> Rollout {
    let deployment = match deployment {
        Some(d) => d,
        None => return Rollout::Missing,
    };
    if deployment.metadata.deletion_timestamp.is_some() {
        return Rollout::Deleting;
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    let replicas = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if replicas == desired
        && updated == desired
        && available == desired
        && status.observed_generation == deployment.metadata.generation
    {
        return Rollout::Complete;
    }
    if available > 0 {
        let deadline_exceeded = status
            .conditions
            .unwrap_or_default()
            .into_iter()
            .find(|c| {
                c.type_ == "Progressing"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
            })
            .map(|c| c.message.unwrap_or_default());
        return Rollout::Partial { deadline_exceeded };
    }
    Rollout::Unavailable
}

// =============================================================================
// Evaluation
// =============================================================================

/// Compute the registry conditions.
///
/// `previous` are the conditions stored before this pass; they decide how
/// long the registry has been unavailable.
pub fn evaluate_registry(
    previous: &[OperatorCondition],
    inputs: &RegistryInputs<'_>,
    now: DateTime<Utc>,
) -> RegistryConditions {
    match inputs.management_state {
        ManagementState::Removed => return removed(inputs.deployment.is_some()),
        ManagementState::Unmanaged => return unmanaged(),
        ManagementState::Managed | ManagementState::Other(_) => {}
    }

    let rollout = rollout(inputs.deployment);
    let fatal = inputs.apply_error.filter(|e| e.is_fatal());

    let available = match (&fatal, &rollout) {
        (Some(err), _) => condition(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            err.error().reason(),
            err.to_string(),
        ),
        (None, Rollout::Missing) => condition(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            "DeploymentNotFound",
            "The deployment does not exist",
        ),
        (None, Rollout::Deleting) => condition(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            "DeploymentDeleted",
            "The deployment is being deleted",
        ),
        (None, Rollout::Complete) => condition(
            CONDITION_AVAILABLE,
            ConditionStatus::True,
            "Ready",
            "The registry is ready",
        ),
        (None, Rollout::Partial { .. }) => condition(
            CONDITION_AVAILABLE,
            ConditionStatus::True,
            "MinimumAvailability",
            "The registry has minimum availability",
        ),
        (None, Rollout::Unavailable) => condition(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            NO_REPLICAS_AVAILABLE,
            "The deployment does not have available replicas",
        ),
    };

    let progressing = match (inputs.apply_error, &rollout) {
        (Some(err), _) => condition(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "Error",
            format!("Unable to apply resources: {}", err),
        ),
        (None, Rollout::Missing) => condition(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "WaitingForDeployment",
            "All resources are successfully applied, but the deployment does not exist",
        ),
        (None, Rollout::Deleting) => condition(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "FinalizingDeployment",
            "The deployment is being deleted",
        ),
        (None, Rollout::Complete) => condition(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            "Ready",
            "The registry is ready",
        ),
        (None, Rollout::Partial { .. }) => condition(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            "MinimumAvailability",
            "The deployment has minimum availability",
        ),
        (None, Rollout::Unavailable) => condition(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "DeploymentNotCompleted",
            "The deployment has not completed",
        ),
    };

    let mut degraded = match (&fatal, &rollout) {
        (Some(err), _) => condition(
            CONDITION_DEGRADED,
            ConditionStatus::True,
            err.error().reason(),
            err.to_string(),
        ),
        (
            None,
            Rollout::Partial {
                deadline_exceeded: Some(message),
            },
        ) => condition(
            CONDITION_DEGRADED,
            ConditionStatus::True,
            "ProgressDeadlineExceeded",
            format!("Registry deployment has timed out progressing: {}", message),
        ),
        (None, Rollout::Unavailable) if unavailable_too_long(previous, now) => condition(
            CONDITION_DEGRADED,
            ConditionStatus::True,
            "Unavailable",
            "The deployment does not have available replicas",
        ),
        _ => condition(CONDITION_DEGRADED, ConditionStatus::False, "AsExpected", ""),
    };

    if !degraded.is_true() {
        if let Some(message) = first_route_failure(inputs.routes) {
            degraded = condition(
                CONDITION_DEGRADED,
                ConditionStatus::True,
                "RouteDegraded",
                message,
            );
        }
    }

    RegistryConditions {
        available,
        progressing,
        degraded,
        removed: condition(CONDITION_REMOVED, ConditionStatus::False, "AsExpected", ""),
    }
}

fn removed(deployment_present: bool) -> RegistryConditions {
    if deployment_present {
        RegistryConditions {
            available: condition(
                CONDITION_AVAILABLE,
                ConditionStatus::True,
                "Ready",
                "The registry is ready",
            ),
            progressing: condition(
                CONDITION_PROGRESSING,
                ConditionStatus::True,
                "DeletingDeployment",
                "The deployment is being removed",
            ),
            degraded: condition(CONDITION_DEGRADED, ConditionStatus::False, "AsExpected", ""),
            removed: condition(
                CONDITION_REMOVED,
                ConditionStatus::False,
                "DeletingDeployment",
                "The deployment is being removed",
            ),
        }
    } else {
        let message = "The registry is removed";
        RegistryConditions {
            available: condition(CONDITION_AVAILABLE, ConditionStatus::True, "Removed", message),
            progressing: condition(
                CONDITION_PROGRESSING,
                ConditionStatus::False,
                "Removed",
                message,
            ),
            degraded: condition(CONDITION_DEGRADED, ConditionStatus::False, "Removed", message),
            removed: condition(CONDITION_REMOVED, ConditionStatus::True, "Removed", message),
        }
    }
}

fn unmanaged() -> RegistryConditions {
    let message = "The registry configuration is set to unmanaged mode";
    RegistryConditions {
        available: condition(CONDITION_AVAILABLE, ConditionStatus::True, "Unmanaged", message),
        progressing: condition(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            "Unmanaged",
            message,
        ),
        degraded: condition(CONDITION_DEGRADED, ConditionStatus::False, "Unmanaged", message),
        removed: condition(CONDITION_REMOVED, ConditionStatus::False, "Unmanaged", message),
    }
}

/// Whether `Available` has been False for longer than the grace window
fn unavailable_too_long(previous: &[OperatorCondition], now: DateTime<Utc>) -> bool {
    match find_condition(previous, CONDITION_AVAILABLE) {
        Some(c) if c.status == ConditionStatus::False => c
            .last_transition_time
            .map_or(false, |t| now - t > Duration::seconds(UNAVAILABLE_GRACE_SECS)),
        _ => false,
    }
}

/// Time until a registry without replicas crosses the grace window, so the
/// caller can evaluate again even if nothing else changes.
///
/// `None` unless `conditions` (as just written) report no available
/// replicas and `Degraded` is not yet True.
pub fn unavailable_recheck(
    conditions: &[OperatorCondition],
    now: DateTime<Utc>,
) -> Option<std::time::Duration> {
    let available = find_condition(conditions, CONDITION_AVAILABLE)?;
    if available.is_true() || available.reason != NO_REPLICAS_AVAILABLE {
        return None;
    }
    if find_condition(conditions, CONDITION_DEGRADED).map_or(false, |c| c.is_true()) {
        return None;
    }
    let since = available.last_transition_time?;
    // one second past the window, which must be strictly exceeded
    let remaining = since + Duration::seconds(UNAVAILABLE_GRACE_SECS + 1) - now;
    remaining.to_std().ok().filter(|d| !d.is_zero())
}

/// Message for the first route whose matching ingress is not admitted
fn first_route_failure(routes: &[Arc<Route>]) -> Option<String> {
    routes.iter().find_map(|route| {
        let name = route.metadata.name.as_deref().unwrap_or_default();
        let host = &route.spec.host;
        let ingress = route.status.as_ref()?.ingress.iter();
        ingress
            .filter(|ingress| &ingress.host == host)
            .find_map(|ingress| {
                ingress
                    .conditions
                    .iter()
                    .find(|c| c.r#type == ROUTE_CONDITION_ADMITTED && c.status == "False")
                    .map(|c| {
                        format!(
                            "route {} (host {}, router {}) is not admitted: {}",
                            name,
                            host,
                            ingress.router_name,
                            c.message.as_deref().unwrap_or_default()
                        )
                    })
            })
    })
}
