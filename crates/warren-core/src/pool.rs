//! Warm pool controller.
//!
//! Keeps a target number of pre-started, unclaimed pods per
//! [`SandboxWarmPool`] so that claims can adopt a running pod instead of
//! waiting for a cold start.
//!
//! # Membership
//!
//! A pool member is a pod carrying the pool label with no owner reference.
//! Adoption gives the pod an owner and strips the pool labels, so it leaves
//! the pool in the same write that hands it to a Sandbox. Members carry no
//! owner reference, so when the pool itself is deleted this controller
//! removes them explicitly.

use crate::error::{CoreError, Result};
use crate::hash::name_hash;
use crate::runtime::{Action, Reconciler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use warren_api::extensions::SandboxWarmPoolStatus;
use warren_api::keys::{POOL_LABEL, TEMPLATE_REF_HASH_LABEL};
use warren_api::{
    Api, LabelSelector, ObjectKey, ObjectMeta, ObjectStore, Pod, Resource, SandboxTemplate,
    SandboxWarmPool, WatchEvent,
};

// ============================================================================
// Statistics
// ============================================================================

/// Warm pool statistics for observability.
///
/// All counters are atomic and can be read without locking. Hits and misses
/// are recorded by the claim controller when it adopts or falls back.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Claims served by adopting a pool pod.
    pub warm_hits: AtomicU64,
    /// Claims that needed a fresh pod.
    pub cold_misses: AtomicU64,
    /// Pool pods created.
    pub created: AtomicU64,
    /// Pool pods deleted when scaling down or cleaning up.
    pub deleted: AtomicU64,
}

impl PoolStats {
    pub fn warm_hits(&self) -> u64 {
        self.warm_hits.load(Ordering::Relaxed)
    }

    pub fn cold_misses(&self) -> u64 {
        self.cold_misses.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Calculate the warm hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.warm_hits() as f64;
        let misses = self.cold_misses() as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            (hits / total) * 100.0
        }
    }
}

// ============================================================================
// Pool pods
// ============================================================================

/// Whether `pod` is an unclaimed pool member.
pub fn is_unclaimed(pod: &Pod) -> bool {
    pod.metadata.owner_references.is_empty() && !pod.metadata.is_being_deleted()
}

/// Unowned pod for `pool` built from `template`.
pub fn build_pool_pod(pool: &SandboxWarmPool, template: &SandboxTemplate) -> Pod {
    let pod_template = &template.spec.pod_template;

    let mut metadata = ObjectMeta::new(&pool.metadata.namespace, "");
    metadata.generate_name = Some(format!("{}-", pool.metadata.name));
    metadata.labels = pod_template.metadata.labels.clone();
    metadata
        .labels
        .insert(POOL_LABEL.to_string(), pool.metadata.name.clone());
    metadata.labels.insert(
        TEMPLATE_REF_HASH_LABEL.to_string(),
        name_hash(&template.metadata.name),
    );
    metadata.annotations = pod_template.metadata.annotations.clone();

    let mut spec = pod_template.spec.clone();
    if spec.automount_service_account_token.is_none() {
        spec.automount_service_account_token = Some(false);
    }

    Pod {
        metadata,
        spec,
        ..Default::default()
    }
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct WarmPoolReconciler {
    pools: Api<SandboxWarmPool>,
    templates: Api<SandboxTemplate>,
    pods: Api<Pod>,
    stats: Arc<PoolStats>,
}

impl WarmPoolReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, stats: Arc<PoolStats>) -> Self {
        Self {
            pools: Api::new(Arc::clone(&store)),
            templates: Api::new(Arc::clone(&store)),
            pods: Api::new(store),
            stats,
        }
    }

    /// Unclaimed members of the pool named `pool`.
    async fn list_members(&self, namespace: &str, pool: &str) -> Result<Vec<Pod>> {
        let selector = LabelSelector::everything().eq(POOL_LABEL, pool);
        let pods = self
            .pods
            .list(namespace, &selector)
            .await
            .map_err(CoreError::context("failed to list pool pods"))?;
        Ok(pods.into_iter().filter(is_unclaimed).collect())
    }

    async fn reconcile_pool(&self, pool: &mut SandboxWarmPool) -> Result<()> {
        let namespace = pool.metadata.namespace.clone();
        let members = self.list_members(&namespace, &pool.metadata.name).await?;
        let desired = usize::try_from(pool.spec.replicas).unwrap_or(0);
        let current = members.len();

        pool.status = SandboxWarmPoolStatus {
            replicas: i32::try_from(current).unwrap_or(i32::MAX),
            pods: members.iter().map(|p| p.metadata.name.clone()).collect(),
        };

        let mut errors = Vec::new();
        if current < desired {
            let template_name = &pool.spec.template_ref.name;
            let template = self
                .templates
                .get_opt(&ObjectKey::new(&namespace, template_name))
                .await
                .map_err(CoreError::context("failed to get sandbox template"))?
                .ok_or_else(|| CoreError::TemplateNotFound(template_name.clone()))?;

            tracing::info!(pool = %pool.key(), current, desired, "Scaling up warm pool");
            for _ in current..desired {
                match self.pods.create(&build_pool_pod(pool, &template)).await {
                    Ok(pod) => {
                        self.stats.created.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(pool = %pool.key(), pod = %pod.metadata.name, "Created pool pod");
                    }
                    Err(e) => errors.push(CoreError::context("failed to create pool pod")(e)),
                }
            }
        } else if current > desired {
            tracing::info!(pool = %pool.key(), current, desired, "Scaling down warm pool");
            let mut excess = members;
            // Least useful first: not ready, then youngest.
            excess.sort_by(|a, b| {
                a.is_ready()
                    .cmp(&b.is_ready())
                    .then_with(|| b.metadata.creation_timestamp.cmp(&a.metadata.creation_timestamp))
            });
            for pod in excess.into_iter().take(current - desired) {
                if let Err(e) = self.delete_member(&pod).await {
                    errors.push(e);
                }
            }
        }

        CoreError::join(errors).map_or(Ok(()), Err)
    }

    /// Delete the unclaimed members of a pool that no longer exists.
    async fn cleanup_orphans(&self, key: &ObjectKey) -> Result<()> {
        let members = self.list_members(&key.namespace, &key.name).await?;
        if members.is_empty() {
            return Ok(());
        }

        tracing::info!(pool = %key, count = members.len(), "Warm pool deleted, removing its pods");
        let mut errors = Vec::new();
        for pod in members {
            if let Err(e) = self.delete_member(&pod).await {
                errors.push(e);
            }
        }
        CoreError::join(errors).map_or(Ok(()), Err)
    }

    /// Delete a member exactly as it was listed. A member that changed in
    /// the meantime (adopted, most likely) is left alone; its update event
    /// brings the pool back here.
    async fn delete_member(&self, pod: &Pod) -> Result<bool> {
        match self.pods.delete_unchanged(pod).await {
            Ok(()) => {
                self.stats.deleted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pod = %pod.key(), "Deleted pool pod");
                Ok(true)
            }
            Err(e) if e.is_not_found() || e.is_conflict() => {
                tracing::debug!(pod = %pod.key(), error = %e, "Pool pod changed since listing, skipping");
                Ok(false)
            }
            Err(e) => Err(CoreError::context("failed to delete pool pod")(e)),
        }
    }
}

#[async_trait]
impl Reconciler for WarmPoolReconciler {
    fn name(&self) -> &'static str {
        "warm-pool"
    }

    fn kind(&self) -> &'static str {
        SandboxWarmPool::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut pool) = self
            .pools
            .get_opt(key)
            .await
            .map_err(CoreError::context("failed to get warm pool"))?
        else {
            self.cleanup_orphans(key).await?;
            return Ok(Action::done());
        };

        if pool.metadata.is_being_deleted() {
            return Ok(Action::done());
        }

        let old_status = pool.status.clone();
        let mut errors = Vec::new();
        if let Err(e) = self.reconcile_pool(&mut pool).await {
            errors.push(e);
        }

        if old_status != pool.status {
            if let Err(e) = self.pools.replace_status(&pool).await {
                errors.push(CoreError::context("failed to update warm pool status")(e));
            }
        }

        match CoreError::join(errors) {
            Some(err) => Err(err),
            None => Ok(Action::done()),
        }
    }

    /// Pools map to themselves; pods map to the pool named by their pool
    /// label, before or after the change.
    fn map_event(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        let kind = event.kind();
        if kind == SandboxWarmPool::KIND {
            return vec![event.object.key()];
        }
        if kind != Pod::KIND {
            return Vec::new();
        }

        let mut keys: Vec<ObjectKey> = event
            .objects()
            .filter_map(|object| {
                object
                    .metadata
                    .label(POOL_LABEL)
                    .map(|pool| ObjectKey::new(&object.metadata.namespace, pool))
            })
            .collect();
        keys.dedup();
        keys
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use warren_api::platform::{Container, PodCondition};
    use warren_api::{
        set_controller_reference, ConditionStatus, DynamicObject, EventType, MemoryStore,
        Registry, Sandbox,
    };

    struct Fixture {
        reconciler: WarmPoolReconciler,
        stats: Arc<PoolStats>,
        pools: Api<SandboxWarmPool>,
        templates: Api<SandboxTemplate>,
        pods: Api<Pod>,
        sandboxes: Api<Sandbox>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new(Arc::new(
            Registry::core().with_extensions(),
        )));
        let stats = Arc::new(PoolStats::default());
        Fixture {
            reconciler: WarmPoolReconciler::new(Arc::clone(&store), Arc::clone(&stats)),
            stats,
            pools: Api::new(Arc::clone(&store)),
            templates: Api::new(Arc::clone(&store)),
            pods: Api::new(Arc::clone(&store)),
            sandboxes: Api::new(store),
        }
    }

    fn template() -> SandboxTemplate {
        let mut template = SandboxTemplate::new("default", "python");
        template
            .spec
            .pod_template
            .spec
            .containers
            .push(Container::new("main", "python:3.12"));
        template
            .spec
            .pod_template
            .metadata
            .labels
            .insert("app".into(), "agent".into());
        template
    }

    fn pool_key() -> ObjectKey {
        ObjectKey::new("default", "pool")
    }

    async fn members(f: &Fixture) -> Vec<Pod> {
        f.pods
            .list("default", &LabelSelector::everything().eq(POOL_LABEL, "pool"))
            .await
            .unwrap()
    }

    #[test]
    fn test_pool_stats_hit_rate() {
        let stats = PoolStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.warm_hits.fetch_add(3, Ordering::Relaxed);
        stats.cold_misses.fetch_add(1, Ordering::Relaxed);
        assert!((stats.hit_rate() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_build_pool_pod() {
        let pool = SandboxWarmPool::new("default", "pool", "python", 2);
        let pod = build_pool_pod(&pool, &template());

        assert!(pod.metadata.name.is_empty());
        assert_eq!(pod.metadata.generate_name.as_deref(), Some("pool-"));
        assert_eq!(pod.metadata.labels[POOL_LABEL], "pool");
        assert_eq!(pod.metadata.labels[TEMPLATE_REF_HASH_LABEL], name_hash("python"));
        assert_eq!(pod.metadata.labels["app"], "agent");
        assert!(pod.metadata.owner_references.is_empty());
        assert_eq!(pod.spec.automount_service_account_token, Some(false));
    }

    #[tokio::test]
    async fn test_scales_up_to_replicas() {
        let f = fixture();
        f.templates.create(&template()).await.unwrap();
        f.pools
            .create(&SandboxWarmPool::new("default", "pool", "python", 3))
            .await
            .unwrap();

        f.reconciler.reconcile(&pool_key()).await.unwrap();
        assert_eq!(members(&f).await.len(), 3);
        assert_eq!(f.stats.created(), 3);

        // Second pass observes the members and records them.
        f.reconciler.reconcile(&pool_key()).await.unwrap();
        assert_eq!(members(&f).await.len(), 3);
        let pool = f.pools.get(&pool_key()).await.unwrap();
        assert_eq!(pool.status.replicas, 3);
        assert_eq!(pool.status.pods.len(), 3);
        assert!(pool.status.pods.iter().all(|name| name.starts_with("pool-")));
    }

    #[tokio::test]
    async fn test_scales_down_preferring_unready_pods() {
        let f = fixture();
        f.templates.create(&template()).await.unwrap();
        f.pools
            .create(&SandboxWarmPool::new("default", "pool", "python", 3))
            .await
            .unwrap();
        f.reconciler.reconcile(&pool_key()).await.unwrap();

        let mut ready = members(&f).await.remove(0);
        ready.status.conditions.push(PodCondition {
            type_: "Ready".into(),
            status: ConditionStatus::True,
        });
        f.pods.replace_status(&ready).await.unwrap();

        let mut pool = f.pools.get(&pool_key()).await.unwrap();
        pool.spec.replicas = 1;
        f.pools.replace(&pool).await.unwrap();
        f.reconciler.reconcile(&pool_key()).await.unwrap();

        let remaining = members(&f).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.name, ready.metadata.name);
        assert_eq!(f.stats.deleted(), 2);
    }

    #[tokio::test]
    async fn test_adopted_pods_are_not_members() {
        let f = fixture();
        f.templates.create(&template()).await.unwrap();
        f.pools
            .create(&SandboxWarmPool::new("default", "pool", "python", 1))
            .await
            .unwrap();
        f.reconciler.reconcile(&pool_key()).await.unwrap();

        // Simulate an adoption that has not stripped the pool label.
        let sandbox = f.sandboxes.create(&Sandbox::new("default", "owner")).await.unwrap();
        let mut adopted = members(&f).await.remove(0);
        set_controller_reference(&sandbox, &mut adopted.metadata).unwrap();
        f.pods.replace(&adopted).await.unwrap();

        f.reconciler.reconcile(&pool_key()).await.unwrap();
        let pods = members(&f).await;
        assert_eq!(pods.len(), 2);
        assert_eq!(pods.iter().filter(|p| is_unclaimed(p)).count(), 1);

        let mut pool = f.pools.get(&pool_key()).await.unwrap();
        pool.spec.replicas = 0;
        f.pools.replace(&pool).await.unwrap();
        f.reconciler.reconcile(&pool_key()).await.unwrap();
        let pods = members(&f).await;
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name, adopted.metadata.name);
    }

    /// Adopts the first listed pod right after the list returns, so callers
    /// act on a stale copy.
    struct AdoptsAfterList {
        inner: MemoryStore,
        adopter: std::sync::Mutex<Option<Sandbox>>,
    }

    #[async_trait]
    impl ObjectStore for AdoptsAfterList {
        async fn get(&self, kind: &str, key: &ObjectKey) -> warren_api::Result<DynamicObject> {
            self.inner.get(kind, key).await
        }

        async fn list(
            &self,
            kind: &str,
            namespace: Option<&str>,
            selector: &LabelSelector,
        ) -> warren_api::Result<Vec<DynamicObject>> {
            let listed = self.inner.list(kind, namespace, selector).await?;
            let adopter = self.adopter.lock().unwrap().take();
            if let (Some(sandbox), Some(first)) = (adopter, listed.first()) {
                let mut pod: Pod = first.clone().into_resource()?;
                pod.metadata.labels.remove(POOL_LABEL);
                set_controller_reference(&sandbox, &mut pod.metadata)?;
                self.inner.update(DynamicObject::from_resource(&pod)?).await?;
            }
            Ok(listed)
        }

        async fn create(&self, object: DynamicObject) -> warren_api::Result<DynamicObject> {
            self.inner.create(object).await
        }

        async fn update(&self, object: DynamicObject) -> warren_api::Result<DynamicObject> {
            self.inner.update(object).await
        }

        async fn update_status(&self, object: DynamicObject) -> warren_api::Result<DynamicObject> {
            self.inner.update_status(object).await
        }

        async fn delete(
            &self,
            kind: &str,
            key: &ObjectKey,
            preconditions: &warren_api::Preconditions,
        ) -> warren_api::Result<()> {
            self.inner.delete(kind, key, preconditions).await
        }

        fn watch(&self) -> tokio::sync::broadcast::Receiver<WatchEvent> {
            self.inner.watch()
        }
    }

    #[tokio::test]
    async fn test_scale_down_spares_pod_adopted_after_listing() {
        let racing = Arc::new(AdoptsAfterList {
            inner: MemoryStore::new(Arc::new(Registry::core().with_extensions())),
            adopter: std::sync::Mutex::new(None),
        });
        let store: Arc<dyn ObjectStore> = racing.clone();
        let stats = Arc::new(PoolStats::default());
        let reconciler = WarmPoolReconciler::new(Arc::clone(&store), Arc::clone(&stats));
        let pools: Api<SandboxWarmPool> = Api::new(Arc::clone(&store));
        let templates: Api<SandboxTemplate> = Api::new(Arc::clone(&store));
        let sandboxes: Api<Sandbox> = Api::new(Arc::clone(&store));
        let pods: Api<Pod> = Api::new(store);

        templates.create(&template()).await.unwrap();
        pools
            .create(&SandboxWarmPool::new("default", "pool", "python", 1))
            .await
            .unwrap();
        reconciler.reconcile(&pool_key()).await.unwrap();
        let member = pods
            .list("default", &LabelSelector::everything().eq(POOL_LABEL, "pool"))
            .await
            .unwrap()
            .remove(0);

        let sandbox = sandboxes.create(&Sandbox::new("default", "claimed")).await.unwrap();
        *racing.adopter.lock().unwrap() = Some(sandbox.clone());

        let mut pool = pools.get(&pool_key()).await.unwrap();
        pool.spec.replicas = 0;
        pools.replace(&pool).await.unwrap();
        reconciler.reconcile(&pool_key()).await.unwrap();

        let adopted = pods.get(&member.key()).await.unwrap();
        assert!(adopted.metadata.is_controlled_by(&sandbox.metadata));
        assert_eq!(stats.deleted(), 0);
    }

    #[tokio::test]
    async fn test_missing_template_is_an_error() {
        let f = fixture();
        f.pools
            .create(&SandboxWarmPool::new("default", "pool", "missing", 2))
            .await
            .unwrap();

        let err = f.reconciler.reconcile(&pool_key()).await.unwrap_err();
        assert!(matches!(err, CoreError::TemplateNotFound(ref name) if name == "missing"));
        assert!(members(&f).await.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_pool_cleans_up_unclaimed_pods() {
        let f = fixture();
        f.templates.create(&template()).await.unwrap();
        f.pools
            .create(&SandboxWarmPool::new("default", "pool", "python", 2))
            .await
            .unwrap();
        f.reconciler.reconcile(&pool_key()).await.unwrap();

        f.pools.delete(&pool_key()).await.unwrap();
        f.reconciler.reconcile(&pool_key()).await.unwrap();
        assert!(members(&f).await.is_empty());
    }

    #[test]
    fn test_map_event_uses_old_and_new_labels() {
        let f = fixture();
        let mut before = ObjectMeta::new("default", "pool-abcde");
        before.labels.insert(POOL_LABEL.into(), "pool".into());
        let after = ObjectMeta::new("default", "pool-abcde");

        let event = WatchEvent {
            event_type: EventType::Modified,
            object: DynamicObject::new("Pod", after),
            previous: Some(DynamicObject::new("Pod", before)),
        };
        assert_eq!(f.reconciler.map_event(&event), vec![pool_key()]);
    }
}
