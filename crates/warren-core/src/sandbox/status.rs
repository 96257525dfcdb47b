//! Ready-condition aggregation and expiry arithmetic.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use std::time::Duration;
use warren_api::sandbox::{reasons, CONDITION_READY};
use warren_api::{Condition, ConditionStatus, Pod, PodPhase, Sandbox, Service};

/// Outcome of checking a Sandbox's shutdown time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No shutdown time set.
    Never,
    /// Shutdown time has passed.
    Expired,
    /// Not yet expired; check again after this delay.
    Pending(Duration),
}

/// Compare `shutdown_time` against `now`. Pending delays are never shorter
/// than `min_requeue`.
pub fn check_expiry(
    shutdown_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    min_requeue: Duration,
) -> Expiry {
    let Some(shutdown_time) = shutdown_time else {
        return Expiry::Never;
    };
    if now > shutdown_time {
        return Expiry::Expired;
    }
    let remaining = (shutdown_time - now).to_std().unwrap_or_default();
    Expiry::Pending(remaining.max(min_requeue))
}

/// Derive the Sandbox's Ready condition from what this pass observed.
pub fn compute_ready_condition(
    sandbox: &Sandbox,
    error: Option<&CoreError>,
    pod: Option<&Pod>,
    service: Option<&Service>,
) -> Condition {
    let generation = sandbox.metadata.generation;
    let condition = |status, reason: &str, message: String| {
        Condition::new(CONDITION_READY, status, reason, message).with_observed_generation(generation)
    };

    if let Some(err) = error {
        return condition(
            ConditionStatus::False,
            reasons::RECONCILER_ERROR,
            format!("Error seen: {err}"),
        );
    }

    let (pod_message, pod_ready) = match pod {
        Some(pod) if pod.status.phase != PodPhase::Running => {
            (format!("Pod exists with phase: {}", pod.status.phase), false)
        }
        Some(pod) if !pod.is_ready() => ("Pod is Running but not Ready".to_string(), false),
        Some(_) => ("Pod is Ready".to_string(), true),
        None if sandbox.desired_replicas() == 0 => {
            return condition(
                ConditionStatus::True,
                reasons::DEPENDENCIES_READY,
                "Pod does not exist, replicas is 0".to_string(),
            );
        }
        None => ("Pod does not exist".to_string(), false),
    };

    let service_message = if service.is_some() {
        "Service Exists"
    } else {
        "Service does not exist"
    };
    let message = format!("{pod_message}; {service_message}");

    if pod_ready && service.is_some() {
        condition(ConditionStatus::True, reasons::DEPENDENCIES_READY, message)
    } else {
        condition(ConditionStatus::False, reasons::DEPENDENCIES_NOT_READY, message)
    }
}

/// Ready condition for a Sandbox whose shutdown time has passed.
pub fn expired_condition(sandbox: &Sandbox) -> Condition {
    Condition::new(
        CONDITION_READY,
        ConditionStatus::False,
        reasons::EXPIRED,
        "Sandbox has expired",
    )
    .with_observed_generation(sandbox.metadata.generation)
}

/// Ready condition for a replica count that can never be realized.
pub fn invalid_spec_condition(sandbox: &Sandbox, message: String) -> Condition {
    Condition::new(
        CONDITION_READY,
        ConditionStatus::False,
        reasons::INVALID_SPEC,
        message,
    )
    .with_observed_generation(sandbox.metadata.generation)
}
