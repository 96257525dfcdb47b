//! Sandbox reconciler.
//!
//! Drives each Sandbox toward one Pod, one headless Service and one
//! PersistentVolumeClaim per storage template, then folds what it observed
//! into the Sandbox's `Ready` condition. Status is written only when it
//! differs from what was read, so a converged Sandbox costs no writes.

mod children;
mod status;

pub use children::{build_pod, build_pvc, build_service, pvc_name};
pub use status::{check_expiry, compute_ready_condition, Expiry};

use crate::config::ControllerConfig;
use crate::error::{CoreError, Result};
use crate::hash::name_hash;
use crate::runtime::{Action, Reconciler};
use crate::telemetry::{Instrumenter, Telemetry};
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::Context;
use std::sync::Arc;
use warren_api::keys::SANDBOX_NAME_HASH_LABEL;
use warren_api::sandbox::SandboxStatus;
use warren_api::{
    set_condition, Api, LabelSelector, ObjectKey, ObjectMeta, ObjectStore, PersistentVolumeClaim,
    Pod, Resource, Sandbox, Service, WatchEvent,
};

pub struct SandboxReconciler {
    sandboxes: Api<Sandbox>,
    pods: Api<Pod>,
    services: Api<Service>,
    pvcs: Api<PersistentVolumeClaim>,
    telemetry: Arc<Telemetry>,
    config: ControllerConfig,
}

impl SandboxReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, telemetry: Arc<Telemetry>, config: ControllerConfig) -> Self {
        Self {
            sandboxes: Api::new(Arc::clone(&store)),
            pods: Api::new(Arc::clone(&store)),
            services: Api::new(Arc::clone(&store)),
            pvcs: Api::new(store),
            telemetry,
            config,
        }
    }

    /// Reconcile storage, compute and network, then recompute Ready. Errors
    /// from each step are collected, not short-circuited.
    async fn reconcile_children(&self, sandbox: &mut Sandbox) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.reconcile_pvcs(sandbox).await {
            errors.push(e);
        }
        let pod = match self.reconcile_pod(sandbox).await {
            Ok(pod) => pod,
            Err(e) => {
                errors.push(e);
                None
            }
        };
        let service = match self.reconcile_service(sandbox).await {
            Ok(service) => Some(service),
            Err(e) => {
                errors.push(e);
                None
            }
        };

        sandbox.status.replicas = i32::from(pod.is_some());
        sandbox.status.label_selector = LabelSelector::everything()
            .eq(SANDBOX_NAME_HASH_LABEL, name_hash(&sandbox.metadata.name))
            .to_string();
        if let Some(service) = &service {
            sandbox.status.service = service.metadata.name.clone();
            sandbox.status.service_fqdn = self
                .config
                .service_fqdn(&service.metadata.name, &sandbox.metadata.namespace);
        }

        let error = CoreError::join(errors);
        let ready = compute_ready_condition(sandbox, error.as_ref(), pod.as_ref(), service.as_ref());
        set_condition(&mut sandbox.status.conditions, ready);
        error.map_or(Ok(()), Err)
    }

    /// Delete the Pod and Service of an expired Sandbox. Already-deleted
    /// children are fine.
    async fn handle_expiry(&self, sandbox: &mut Sandbox) -> Result<()> {
        let mut errors = Vec::new();

        let pod_key = ObjectKey::new(&sandbox.metadata.namespace, sandbox.pod_name());
        match self.pods.delete_opt(&pod_key).await {
            Ok(true) => tracing::info!(sandbox = %sandbox.key(), pod = %pod_key.name, "Deleted pod of expired sandbox"),
            Ok(false) => {}
            Err(e) => errors.push(CoreError::context("failed to delete pod")(e)),
        }

        match self.services.delete_opt(&sandbox.key()).await {
            Ok(true) => tracing::info!(sandbox = %sandbox.key(), "Deleted service of expired sandbox"),
            Ok(false) => {}
            Err(e) => errors.push(CoreError::context("failed to delete service")(e)),
        }

        sandbox.status.replicas = 0;
        sandbox.status.label_selector.clear();
        let expired = status::expired_condition(sandbox);
        set_condition(&mut sandbox.status.conditions, expired);
        CoreError::join(errors).map_or(Ok(()), Err)
    }

    async fn write_status(&self, old: &SandboxStatus, sandbox: &Sandbox) -> Result<()> {
        if *old == sandbox.status {
            return Ok(());
        }
        self.sandboxes
            .replace_status(sandbox)
            .await
            .map_err(CoreError::context("failed to update sandbox status"))?;
        tracing::debug!(sandbox = %sandbox.key(), "Updated sandbox status");
        Ok(())
    }
}

/// Sandbox that controls the object described by `meta`, if any.
pub(crate) fn owning_sandbox(meta: &ObjectMeta) -> Option<ObjectKey> {
    meta.controller()
        .filter(|owner| owner.kind == Sandbox::KIND)
        .map(|owner| ObjectKey::new(&meta.namespace, &owner.name))
}

#[async_trait]
impl Reconciler for SandboxReconciler {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn kind(&self) -> &'static str {
        Sandbox::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut sandbox) = self
            .sandboxes
            .get_opt(key)
            .await
            .map_err(CoreError::context("failed to get sandbox"))?
        else {
            tracing::debug!(sandbox = %key, "Sandbox not found, ignoring since it must have been deleted");
            return Ok(Action::done());
        };

        let (cx, _span) = self.telemetry.start_span(
            &Context::current(),
            Some(&sandbox.metadata),
            "ReconcileSandbox",
            &[("sandbox", key.to_string())],
        );

        if sandbox.metadata.is_being_deleted() {
            tracing::debug!(sandbox = %key, "Sandbox is being deleted");
            return Ok(Action::done());
        }

        if sandbox.spec.replicas.is_none() {
            sandbox.spec.replicas = Some(1);
        }
        let old_status = sandbox.status.clone();
        let was_ready = sandbox.is_ready();

        let mut errors = Vec::new();
        let mut action = Action::done();
        match check_expiry(sandbox.spec.shutdown_time, Utc::now(), self.config.min_expiry_requeue) {
            Expiry::Expired => {
                tracing::info!(sandbox = %key, "Sandbox expired, deleting pod and service");
                if let Err(e) = self.handle_expiry(&mut sandbox).await {
                    errors.push(e);
                }
            }
            expiry => {
                if let Expiry::Pending(delay) = expiry {
                    action = Action::requeue(delay);
                }
                let replicas = sandbox.desired_replicas();
                if !(0..=1).contains(&replicas) {
                    tracing::warn!(sandbox = %key, replicas, "Invalid replica count");
                    let condition = status::invalid_spec_condition(
                        &sandbox,
                        format!("replicas must be 0 or 1, got {replicas}"),
                    );
                    set_condition(&mut sandbox.status.conditions, condition);
                } else if let Err(e) = self.reconcile_children(&mut sandbox).await {
                    errors.push(e);
                }
            }
        }

        if let Err(e) = self.write_status(&old_status, &sandbox).await {
            errors.push(e);
        }

        if !was_ready && sandbox.is_ready() {
            tracing::info!(sandbox = %key, "Sandbox is ready");
            self.telemetry
                .add_event(&cx, "SandboxReady", &[("sandbox", key.to_string())]);
        }

        match CoreError::join(errors) {
            Some(err) => Err(err),
            None => Ok(action),
        }
    }

    /// Sandboxes map to themselves; Pods and Services map to the Sandbox
    /// that controls them, looking at both the old and new object so label or
    /// ownership changes are seen.
    fn map_event(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        let kind = event.kind();
        if kind == Sandbox::KIND {
            return vec![event.object.key()];
        }
        if kind != Pod::KIND && kind != Service::KIND {
            return Vec::new();
        }

        let mut keys: Vec<ObjectKey> = event
            .objects()
            .filter(|object| object.metadata.labels.contains_key(SANDBOX_NAME_HASH_LABEL))
            .filter_map(|object| owning_sandbox(&object.metadata))
            .collect();
        keys.dedup();
        keys
    }
}
