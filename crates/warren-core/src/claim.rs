//! Claim and adoption controller.
//!
//! A [`SandboxClaim`] asks for one Sandbox built from a named template. The
//! claim owns the Sandbox it creates and mirrors the Sandbox's readiness into
//! its own status.
//!
//! # Adoption
//!
//! When the template has unclaimed warm pool pods, the Sandbox is created
//! with the pending-adoption marker so the sandbox controller does not start
//! a pod of its own. The claim then takes a pool pod with a conditional
//! update (the pod's last-observed resource version): pool labels are
//! replaced by the Sandbox fingerprint and the Sandbox becomes the pod's
//! controller. Losing that race re-lists and tries again, a bounded number
//! of times, before settling for a fresh pod. The outcome is recorded on the
//! Sandbox as the pod-name annotation and the marker is cleared.
//!
//! A claim that finds its Sandbox still marked pending resumes the protocol,
//! first looking for a pod the Sandbox already controls.

use crate::config::ControllerConfig;
use crate::error::{CoreError, Result};
use crate::hash::name_hash;
use crate::pool::{is_unclaimed, PoolStats};
use crate::runtime::{Action, Reconciler};
use crate::sandbox::{check_expiry, Expiry};
use crate::telemetry::{Instrumenter, Telemetry};
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::Context;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use warren_api::extensions::{reasons, ClaimedSandbox, SandboxClaimStatus};
use warren_api::keys::{
    CLAIM_UID_LABEL, PENDING_ADOPTION_ANNOTATION, POD_NAME_ANNOTATION, POOL_LABEL,
    SANDBOX_NAME_HASH_LABEL, TEMPLATE_REF_HASH_LABEL, TRACE_CONTEXT_ANNOTATION,
};
use warren_api::platform::{NetworkPolicySpec, PodSelector};
use warren_api::sandbox::{reasons as sandbox_reasons, CONDITION_READY};
use warren_api::{
    set_condition, set_controller_reference, Api, Condition, ConditionStatus, LabelSelector,
    NetworkPolicy, NetworkPolicyRules, ObjectKey, ObjectMeta, ObjectStore, Pod, Resource, Sandbox,
    SandboxClaim, SandboxTemplate, ShutdownPolicy, WatchEvent,
};

/// Name of the NetworkPolicy guarding a claim's sandbox.
pub fn network_policy_name(claim: &SandboxClaim) -> String {
    format!("{}-network-policy", claim.metadata.name)
}

/// NetworkPolicy applying `rules` to the pod serving `claim`, selected by
/// the claim-uid label.
pub fn build_network_policy(
    claim: &SandboxClaim,
    rules: &NetworkPolicyRules,
) -> Result<NetworkPolicy> {
    let mut policy = NetworkPolicy {
        metadata: ObjectMeta::new(&claim.metadata.namespace, network_policy_name(claim)),
        spec: NetworkPolicySpec {
            pod_selector: PodSelector {
                match_labels: [(CLAIM_UID_LABEL.to_string(), claim.metadata.uid.clone())].into(),
            },
            policy_types: vec!["Ingress".to_string(), "Egress".to_string()],
            ingress: rules.ingress.clone(),
            egress: rules.egress.clone(),
        },
    };
    set_controller_reference(claim, &mut policy.metadata)?;
    Ok(policy)
}

/// Sandbox for `claim` built from `template`.
///
/// `pending` marks the Sandbox as waiting for a pool pod.
pub fn build_sandbox(claim: &SandboxClaim, template: &SandboxTemplate, pending: bool) -> Result<Sandbox> {
    let mut metadata = ObjectMeta::new(&claim.metadata.namespace, &claim.metadata.name);
    set_controller_reference(claim, &mut metadata)?;
    if let Some(trace) = claim.metadata.annotation(TRACE_CONTEXT_ANNOTATION) {
        metadata
            .annotations
            .insert(TRACE_CONTEXT_ANNOTATION.to_string(), trace.to_string());
    }
    if pending {
        metadata
            .annotations
            .insert(PENDING_ADOPTION_ANNOTATION.to_string(), "true".to_string());
    }

    let mut pod_template = template.spec.pod_template.clone();
    pod_template
        .metadata
        .labels
        .insert(CLAIM_UID_LABEL.to_string(), claim.metadata.uid.clone());
    if pod_template.spec.automount_service_account_token.is_none() {
        pod_template.spec.automount_service_account_token = Some(false);
    }

    let mut sandbox = Sandbox {
        metadata,
        ..Default::default()
    };
    sandbox.spec.pod_template = pod_template;
    sandbox.spec.replicas = Some(1);
    Ok(sandbox)
}

/// Rewrite a pool pod's labels and ownership so that it belongs to `sandbox`.
fn claim_pod(pod: &mut Pod, sandbox: &Sandbox, claim: &SandboxClaim) -> Result<()> {
    let labels = &mut pod.metadata.labels;
    labels.remove(POOL_LABEL);
    labels.remove(TEMPLATE_REF_HASH_LABEL);
    labels.insert(
        SANDBOX_NAME_HASH_LABEL.to_string(),
        name_hash(&sandbox.metadata.name),
    );
    labels.insert(CLAIM_UID_LABEL.to_string(), claim.metadata.uid.clone());
    set_controller_reference(sandbox, &mut pod.metadata)?;
    Ok(())
}

/// Claim Ready derived from the active reconcile's outcome.
fn ready_condition(claim: &SandboxClaim, outcome: &Result<Option<Sandbox>>) -> Condition {
    let generation = claim.metadata.generation;
    let condition = |status, reason: &str, message: String| {
        Condition::new(CONDITION_READY, status, reason, message).with_observed_generation(generation)
    };

    match outcome {
        Err(err @ CoreError::TemplateNotFound(_)) => condition(
            ConditionStatus::False,
            reasons::TEMPLATE_NOT_FOUND,
            err.to_string(),
        ),
        Err(err) => condition(
            ConditionStatus::False,
            sandbox_reasons::RECONCILER_ERROR,
            format!("Error seen: {err}"),
        ),
        Ok(None) => condition(
            ConditionStatus::False,
            reasons::SANDBOX_MISSING,
            "Sandbox is being deleted".to_string(),
        ),
        Ok(Some(sandbox)) => match sandbox.ready_condition() {
            Some(ready) if ready.reason == sandbox_reasons::EXPIRED => condition(
                ConditionStatus::False,
                sandbox_reasons::EXPIRED,
                "Underlying Sandbox resource has expired independently of the Claim.".to_string(),
            ),
            Some(ready) => condition(ready.status, &ready.reason, ready.message.clone()),
            None => condition(
                ConditionStatus::False,
                reasons::SANDBOX_NOT_READY,
                "Sandbox has not reported readiness yet".to_string(),
            ),
        },
    }
}

fn expired_condition(claim: &SandboxClaim) -> Condition {
    Condition::new(
        CONDITION_READY,
        ConditionStatus::False,
        reasons::CLAIM_EXPIRED,
        "Claim expired. Sandbox resources deleted.",
    )
    .with_observed_generation(claim.metadata.generation)
}

pub struct ClaimReconciler {
    claims: Api<SandboxClaim>,
    sandboxes: Api<Sandbox>,
    templates: Api<SandboxTemplate>,
    pods: Api<Pod>,
    network_policies: Api<NetworkPolicy>,
    telemetry: Arc<Telemetry>,
    stats: Arc<PoolStats>,
    config: ControllerConfig,
}

impl ClaimReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        telemetry: Arc<Telemetry>,
        stats: Arc<PoolStats>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            claims: Api::new(Arc::clone(&store)),
            sandboxes: Api::new(Arc::clone(&store)),
            templates: Api::new(Arc::clone(&store)),
            pods: Api::new(Arc::clone(&store)),
            network_policies: Api::new(store),
            telemetry,
            stats,
            config,
        }
    }

    /// Make the claim's NetworkPolicy match the template: created or updated
    /// when the template has rules, removed when it has none.
    async fn reconcile_network_policy(
        &self,
        claim: &SandboxClaim,
        template: &SandboxTemplate,
    ) -> Result<()> {
        let key = ObjectKey::new(&claim.metadata.namespace, network_policy_name(claim));
        let Some(rules) = &template.spec.network_policy else {
            let deleted = self
                .network_policies
                .delete_opt(&key)
                .await
                .map_err(CoreError::context("failed to delete network policy"))?;
            if deleted {
                tracing::info!(claim = %claim.key(), policy = %key, "Deleted disabled network policy");
            }
            return Ok(());
        };

        let desired = build_network_policy(claim, rules)?;
        match self
            .network_policies
            .get_opt(&key)
            .await
            .map_err(CoreError::context("failed to get network policy"))?
        {
            None => {
                self.network_policies
                    .create(&desired)
                    .await
                    .map_err(CoreError::context("failed to create network policy"))?;
                tracing::info!(claim = %claim.key(), policy = %key, "Created network policy");
            }
            Some(mut existing) => {
                let owned = existing.metadata.is_controlled_by(&claim.metadata);
                if !owned || existing.spec != desired.spec {
                    set_controller_reference(claim, &mut existing.metadata)
                        .map_err(CoreError::context("failed to own network policy"))?;
                    existing.spec = desired.spec;
                    self.network_policies
                        .replace(&existing)
                        .await
                        .map_err(CoreError::context("failed to update network policy"))?;
                    tracing::info!(claim = %claim.key(), policy = %key, "Updated network policy");
                }
            }
        }
        Ok(())
    }

    /// Unclaimed pool pods built from `template`, ready ones first, then
    /// oldest first.
    async fn list_candidates(&self, namespace: &str, template: &str) -> Result<Vec<Pod>> {
        let selector = LabelSelector::everything()
            .eq(TEMPLATE_REF_HASH_LABEL, name_hash(template))
            .exists(POOL_LABEL);
        let mut pods: Vec<Pod> = self
            .pods
            .list(namespace, &selector)
            .await
            .map_err(CoreError::context("failed to list pool pods"))?
            .into_iter()
            .filter(is_unclaimed)
            .collect();
        pods.sort_by(|a, b| {
            b.is_ready()
                .cmp(&a.is_ready())
                .then_with(|| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
        });
        Ok(pods)
    }

    /// Ensure the claim's Sandbox exists and has finished adoption.
    async fn reconcile_sandbox(&self, claim: &SandboxClaim) -> Result<Option<Sandbox>> {
        let key = claim.key();
        let template_name = &claim.spec.template_ref.name;
        let template = self
            .templates
            .get_opt(&ObjectKey::new(&key.namespace, template_name))
            .await
            .map_err(CoreError::context("failed to get sandbox template"))?;
        if let Some(template) = &template {
            self.reconcile_network_policy(claim, template).await?;
        }

        if let Some(sandbox) = self
            .sandboxes
            .get_opt(&key)
            .await
            .map_err(CoreError::context("failed to get sandbox"))?
        {
            if !sandbox.metadata.is_controlled_by(&claim.metadata) {
                return Err(CoreError::NotControlled {
                    kind: Sandbox::KIND,
                    name: sandbox.metadata.name,
                    owner: format!("{} {:?}", SandboxClaim::KIND, claim.metadata.name),
                });
            }
            if sandbox.metadata.is_being_deleted() {
                tracing::debug!(claim = %key, "Sandbox is being deleted");
                return Ok(None);
            }
            if sandbox.metadata.annotations.contains_key(PENDING_ADOPTION_ANNOTATION) {
                tracing::info!(claim = %key, "Resuming pending adoption");
                return self.finish_adoption(claim, sandbox).await.map(Some);
            }
            return Ok(Some(sandbox));
        }

        let template = template.ok_or_else(|| CoreError::TemplateNotFound(template_name.clone()))?;
        let candidates = self.list_candidates(&key.namespace, template_name).await?;
        let pending = !candidates.is_empty();
        let sandbox = build_sandbox(claim, &template, pending)?;
        let created = self
            .sandboxes
            .create(&sandbox)
            .await
            .map_err(CoreError::context("failed to create sandbox"))?;
        tracing::info!(claim = %key, candidates = candidates.len(), "Created sandbox");

        if pending {
            self.finish_adoption(claim, created).await.map(Some)
        } else {
            self.stats.cold_misses.fetch_add(1, Ordering::Relaxed);
            Ok(Some(created))
        }
    }

    /// Adopt a pool pod for `sandbox` (or settle for none) and clear the
    /// pending marker.
    async fn finish_adoption(&self, claim: &SandboxClaim, sandbox: Sandbox) -> Result<Sandbox> {
        let adopted = match self.find_adopted_pod(&sandbox).await? {
            Some(pod) => Some(pod.metadata.name),
            None => self.adopt_from_pool(claim, &sandbox).await?,
        };

        let recorded = self.record_adoption(&sandbox.key(), adopted.as_deref()).await?;
        // Warm hits are counted when the pod is won; a retried pass must not
        // count again.
        if adopted.is_none() {
            self.stats.cold_misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(recorded)
    }

    /// A pod already controlled by `sandbox`, left by an interrupted pass.
    async fn find_adopted_pod(&self, sandbox: &Sandbox) -> Result<Option<Pod>> {
        let selector = LabelSelector::everything()
            .eq(SANDBOX_NAME_HASH_LABEL, name_hash(&sandbox.metadata.name));
        let pods = self
            .pods
            .list(&sandbox.metadata.namespace, &selector)
            .await
            .map_err(CoreError::context("failed to list pods"))?;
        Ok(pods
            .into_iter()
            .find(|pod| pod.metadata.is_controlled_by(&sandbox.metadata)))
    }

    /// Take one pool pod by conditional update. Returns the adopted pod's
    /// name, or `None` when no candidate could be won.
    async fn adopt_from_pool(&self, claim: &SandboxClaim, sandbox: &Sandbox) -> Result<Option<String>> {
        let key = claim.key();
        let template_name = &claim.spec.template_ref.name;

        for attempt in 1..=self.config.max_adoption_attempts {
            let candidates = self.list_candidates(&key.namespace, template_name).await?;
            let Some(mut pod) = candidates.into_iter().next() else {
                tracing::debug!(claim = %key, attempt, "No pool pods left to adopt");
                return Ok(None);
            };
            let pod_name = pod.metadata.name.clone();
            claim_pod(&mut pod, sandbox, claim)?;

            match self.pods.replace(&pod).await {
                Ok(_) => {
                    self.stats.warm_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(claim = %key, pod = %pod_name, attempt, "Adopted pool pod");
                    return Ok(Some(pod_name));
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    tracing::debug!(claim = %key, pod = %pod_name, attempt, error = %e, "Lost adoption race");
                }
                Err(e) => return Err(CoreError::context("failed to adopt pool pod")(e)),
            }
        }

        tracing::warn!(
            claim = %key,
            attempts = self.config.max_adoption_attempts,
            "Adoption attempts exhausted, falling back to a fresh pod"
        );
        Ok(None)
    }

    /// Record the adopted pod on the Sandbox and clear the pending marker,
    /// re-reading on conflict.
    async fn record_adoption(&self, key: &ObjectKey, pod_name: Option<&str>) -> Result<Sandbox> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut sandbox = self
                .sandboxes
                .get(key)
                .await
                .map_err(CoreError::context("failed to get sandbox"))?;
            if let Some(name) = pod_name {
                sandbox
                    .metadata
                    .annotations
                    .insert(POD_NAME_ANNOTATION.to_string(), name.to_string());
            }
            sandbox.metadata.annotations.remove(PENDING_ADOPTION_ANNOTATION);

            match self.sandboxes.replace(&sandbox).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() && attempt < self.config.max_adoption_attempts => {
                    tracing::debug!(sandbox = %key, attempt, "Conflict recording adoption, retrying");
                }
                Err(e) => return Err(CoreError::context("failed to record adoption")(e)),
            }
        }
    }

    /// Apply the claim's shutdown policy once it has expired. Returns whether
    /// the claim itself was deleted.
    async fn handle_expiry(&self, claim: &mut SandboxClaim) -> Result<bool> {
        let key = claim.key();
        if claim.shutdown_policy() == ShutdownPolicy::Delete {
            tracing::info!(claim = %key, "Claim expired, deleting it");
            self.claims
                .delete_opt(&key)
                .await
                .map_err(CoreError::context("failed to delete claim"))?;
            return Ok(true);
        }

        let sandbox = self
            .sandboxes
            .get_opt(&key)
            .await
            .map_err(CoreError::context("failed to get sandbox"))?;
        if let Some(sandbox) = sandbox.filter(|s| s.metadata.is_controlled_by(&claim.metadata)) {
            tracing::info!(claim = %key, sandbox = %sandbox.key(), "Claim expired, deleting its sandbox");
            self.sandboxes
                .delete_opt(&sandbox.key())
                .await
                .map_err(CoreError::context("failed to delete sandbox"))?;
        }

        claim.status.sandbox = ClaimedSandbox::default();
        let expired = expired_condition(claim);
        set_condition(&mut claim.status.conditions, expired);
        Ok(false)
    }

    async fn write_status(&self, old: &SandboxClaimStatus, claim: &SandboxClaim) -> Result<()> {
        if *old == claim.status {
            return Ok(());
        }
        self.claims
            .replace_status(claim)
            .await
            .map_err(CoreError::context("failed to update claim status"))?;
        tracing::debug!(claim = %claim.key(), "Updated claim status");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ClaimReconciler {
    fn name(&self) -> &'static str {
        "sandbox-claim"
    }

    fn kind(&self) -> &'static str {
        SandboxClaim::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut claim) = self
            .claims
            .get_opt(key)
            .await
            .map_err(CoreError::context("failed to get claim"))?
        else {
            tracing::debug!(claim = %key, "Claim not found, ignoring since it must have been deleted");
            return Ok(Action::done());
        };

        let (cx, _span) = self.telemetry.start_span(
            &Context::current(),
            Some(&claim.metadata),
            "ReconcileSandboxClaim",
            &[("claim", key.to_string())],
        );

        if claim.metadata.is_being_deleted() {
            return Ok(Action::done());
        }

        // Store the trace before creating anything; the update event starts
        // the next pass under it.
        let trace_context = self.telemetry.trace_context(&cx);
        if !trace_context.is_empty() && claim.metadata.annotation(TRACE_CONTEXT_ANNOTATION).is_none() {
            claim
                .metadata
                .annotations
                .insert(TRACE_CONTEXT_ANNOTATION.to_string(), trace_context);
            self.claims
                .replace(&claim)
                .await
                .map_err(CoreError::context("failed to store trace context"))?;
            return Ok(Action::done());
        }

        let old_status = claim.status.clone();
        let mut action = Action::done();
        let expiry = check_expiry(claim.shutdown_time(), Utc::now(), self.config.min_expiry_requeue);

        let outcome = if expiry == Expiry::Expired {
            if self.handle_expiry(&mut claim).await? {
                return Ok(Action::done());
            }
            Ok(())
        } else {
            if let Expiry::Pending(delay) = expiry {
                action = Action::requeue(delay);
            }
            let outcome = self.reconcile_sandbox(&claim).await;
            let ready = ready_condition(&claim, &outcome);
            set_condition(&mut claim.status.conditions, ready);
            if let Ok(Some(sandbox)) = &outcome {
                claim.status.sandbox = ClaimedSandbox {
                    name: sandbox.metadata.name.clone(),
                    service: sandbox.status.service.clone(),
                    service_fqdn: sandbox.status.service_fqdn.clone(),
                };
            }
            outcome.map(|_| ())
        };

        let mut errors = Vec::new();
        match outcome {
            Err(e) if e.is_permanent() => {
                tracing::warn!(claim = %key, error = %e, "Claim cannot be satisfied");
            }
            Err(e) => errors.push(e),
            Ok(()) => {}
        }
        if let Err(e) = self.write_status(&old_status, &claim).await {
            errors.push(e);
        }

        match CoreError::join(errors) {
            Some(err) => Err(err),
            None => Ok(action),
        }
    }

    /// Claims map to themselves; Sandboxes and NetworkPolicies map to the
    /// claim that controls them.
    fn map_event(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        let kind = event.kind();
        if kind == SandboxClaim::KIND {
            return vec![event.object.key()];
        }
        if kind != Sandbox::KIND && kind != NetworkPolicy::KIND {
            return Vec::new();
        }

        let mut keys: Vec<ObjectKey> = event
            .objects()
            .filter_map(|object| {
                object
                    .metadata
                    .controller()
                    .filter(|owner| owner.kind == SandboxClaim::KIND)
                    .map(|owner| ObjectKey::new(&object.metadata.namespace, &owner.name))
            })
            .collect();
        keys.dedup();
        keys
    }
}
