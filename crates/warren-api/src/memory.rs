//! In-memory [`ObjectStore`] with optimistic concurrency, watch fan-out and
//! ownership-based garbage collection.

use crate::store::{EventType, ObjectStore, Preconditions, WatchEvent};
use crate::{DynamicObject, LabelSelector, ObjectKey, Registry, Result, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// Buffered events per subscriber before it starts lagging.
const WATCH_CAPACITY: usize = 1024;

const DEFAULT_NAMESPACE: &str = "default";

const GENERATED_SUFFIX_LEN: usize = 5;

type StoreKey = (String, ObjectKey);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    /// Store-wide write counter, used as the resource version.
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn get(&self, kind: &str, key: &ObjectKey) -> Result<&DynamicObject> {
        self.objects
            .get(&(kind.to_string(), key.clone()))
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })
    }
}

/// Object store kept entirely in process memory.
///
/// All writes are serialized by one lock, and watch events are published
/// while it is held, so subscribers observe writes in commit order.
pub struct MemoryStore {
    registry: Arc<Registry>,
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_watch_capacity(registry, WATCH_CAPACITY)
    }

    /// A store whose watchers lag after `capacity` unread events.
    pub fn with_watch_capacity(registry: Arc<Registry>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            state: Mutex::new(State::default()),
            events,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current store revision. Unchanged revision means no writes happened.
    pub async fn revision(&self) -> u64 {
        self.state.lock().await.revision
    }

    /// Number of stored objects across all kinds.
    pub async fn len(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn publish(&self, event_type: EventType, object: &DynamicObject, previous: Option<DynamicObject>) {
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent {
            event_type,
            object: object.clone(),
            previous,
        });
    }
}

fn check_version(existing: &DynamicObject, incoming: &DynamicObject) -> Result<()> {
    let expected = incoming.metadata.resource_version;
    let actual = existing.metadata.resource_version;
    // Zero means an unconditional write.
    if expected != 0 && expected != actual {
        return Err(StoreError::Conflict {
            kind: existing.kind.clone(),
            key: existing.key(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_preconditions(existing: &DynamicObject, preconditions: &Preconditions) -> Result<()> {
    if let Some(uid) = &preconditions.uid {
        if *uid != existing.metadata.uid {
            return Err(StoreError::UidMismatch {
                kind: existing.kind.clone(),
                key: existing.key(),
                expected: uid.clone(),
                actual: existing.metadata.uid.clone(),
            });
        }
    }
    if let Some(expected) = preconditions.resource_version {
        let actual = existing.metadata.resource_version;
        if expected != actual {
            return Err(StoreError::Conflict {
                kind: existing.kind.clone(),
                key: existing.key(),
                expected,
                actual,
            });
        }
    }
    Ok(())
}

fn generated_name(prefix: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(GENERATED_SUFFIX_LEN)
        .collect();
    format!("{prefix}{suffix}")
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &str, key: &ObjectKey) -> Result<DynamicObject> {
        self.registry.lookup(kind)?;
        let state = self.state.lock().await;
        state.get(kind, key).cloned()
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>> {
        self.registry.lookup(kind)?;
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .filter(|((k, key), object)| {
                k == kind
                    && namespace.map_or(true, |ns| key.namespace == ns)
                    && selector.matches(&object.metadata.labels)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, mut object: DynamicObject) -> Result<DynamicObject> {
        self.registry.lookup(&object.kind)?;
        let mut state = self.state.lock().await;

        if object.metadata.namespace.is_empty() {
            object.metadata.namespace = DEFAULT_NAMESPACE.to_string();
        }

        if object.metadata.name.is_empty() {
            let prefix = object
                .metadata
                .generate_name
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    StoreError::InvalidObject("metadata.name or metadata.generateName is required".into())
                })?;
            object.metadata.name = loop {
                let candidate = generated_name(&prefix);
                let key = (
                    object.kind.clone(),
                    ObjectKey::new(&object.metadata.namespace, &candidate),
                );
                if !state.objects.contains_key(&key) {
                    break candidate;
                }
            };
        }

        let store_key = (object.kind.clone(), object.metadata.key());
        if state.objects.contains_key(&store_key) {
            return Err(StoreError::AlreadyExists {
                kind: object.kind,
                key: store_key.1,
            });
        }

        let revision = state.next_revision();
        let meta = &mut object.metadata;
        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = revision;
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        state.objects.insert(store_key, object.clone());
        tracing::trace!(kind = %object.kind, object = %object.key(), revision, "Object created");
        self.publish(EventType::Added, &object, None);
        Ok(object)
    }

    async fn update(&self, mut object: DynamicObject) -> Result<DynamicObject> {
        self.registry.lookup(&object.kind)?;
        let mut state = self.state.lock().await;
        let existing = state.get(&object.kind, &object.metadata.key())?.clone();
        check_version(&existing, &object)?;

        // Server-owned fields always come from the stored object.
        let meta = &mut object.metadata;
        meta.uid = existing.metadata.uid.clone();
        meta.resource_version = existing.metadata.resource_version;
        meta.generation = existing.metadata.generation;
        meta.creation_timestamp = existing.metadata.creation_timestamp;
        meta.deletion_timestamp = existing.metadata.deletion_timestamp;
        meta.generate_name = existing.metadata.generate_name.clone();
        object.status = existing.status.clone();

        if object == existing {
            return Ok(existing);
        }
        if object.spec != existing.spec {
            object.metadata.generation += 1;
        }
        object.metadata.resource_version = state.next_revision();

        state
            .objects
            .insert((object.kind.clone(), object.key()), object.clone());
        self.publish(EventType::Modified, &object, Some(existing));
        Ok(object)
    }

    async fn update_status(&self, object: DynamicObject) -> Result<DynamicObject> {
        self.registry.lookup(&object.kind)?;
        let mut state = self.state.lock().await;
        let existing = state.get(&object.kind, &object.metadata.key())?.clone();
        check_version(&existing, &object)?;

        if object.status == existing.status {
            return Ok(existing);
        }

        let mut updated = existing.clone();
        updated.status = object.status;
        updated.metadata.resource_version = state.next_revision();

        state
            .objects
            .insert((updated.kind.clone(), updated.key()), updated.clone());
        self.publish(EventType::Modified, &updated, Some(existing));
        Ok(updated)
    }

    async fn delete(&self, kind: &str, key: &ObjectKey, preconditions: &Preconditions) -> Result<()> {
        self.registry.lookup(kind)?;
        let mut state = self.state.lock().await;

        check_preconditions(state.get(kind, key)?, preconditions)?;
        let mut removed = state
            .objects
            .remove(&(kind.to_string(), key.clone()))
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })?;
        removed.metadata.resource_version = state.next_revision();
        self.publish(EventType::Deleted, &removed, None);

        // Cascade: a dependent goes once none of its owners remain.
        let mut gone = vec![removed.metadata.uid];
        while let Some(owner_uid) = gone.pop() {
            let live: HashSet<&str> = state
                .objects
                .values()
                .map(|o| o.metadata.uid.as_str())
                .collect();
            let orphans: Vec<StoreKey> = state
                .objects
                .iter()
                .filter(|(_, o)| {
                    let owners = &o.metadata.owner_references;
                    owners.iter().any(|r| r.uid == owner_uid)
                        && owners.iter().all(|r| !live.contains(r.uid.as_str()))
                })
                .map(|(k, _)| k.clone())
                .collect();
            drop(live);

            for orphan in orphans {
                if let Some(mut object) = state.objects.remove(&orphan) {
                    tracing::debug!(
                        kind = %object.kind,
                        object = %object.key(),
                        "Garbage collecting dependent"
                    );
                    object.metadata.resource_version = state.next_revision();
                    self.publish(EventType::Deleted, &object, None);
                    gone.push(object.metadata.uid);
                }
            }
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{set_controller_reference, Api, Pod, Resource, Sandbox, Service};

    fn setup() -> (Arc<MemoryStore>, Api<Sandbox>, Api<Pod>) {
        let store = Arc::new(MemoryStore::new(Arc::new(Registry::core())));
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        (store, Api::new(dyn_store.clone()), Api::new(dyn_store))
    }

    #[tokio::test]
    async fn test_create_assigns_server_fields() {
        let (_, sandboxes, _) = setup();
        let created = sandboxes.create(&Sandbox::new("default", "a")).await.unwrap();

        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.resource_version > 0);
        assert!(created.metadata.creation_timestamp.is_some());

        let err = sandboxes.create(&Sandbox::new("default", "a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let (store, _, _) = setup();
        let object = DynamicObject::new("SandboxClaim", crate::ObjectMeta::new("default", "c"));
        let err = store.create(object).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn test_generate_name() {
        let (_, _, pods) = setup();
        let mut pod = Pod::new("default", "");
        pod.metadata.generate_name = Some("pool-".into());

        let a = pods.create(&pod).await.unwrap();
        let b = pods.create(&pod).await.unwrap();
        assert!(a.metadata.name.starts_with("pool-"));
        assert_eq!(a.metadata.name.len(), "pool-".len() + GENERATED_SUFFIX_LEN);
        assert_ne!(a.metadata.name, b.metadata.name);

        let err = pods.create(&Pod::new("default", "")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidObject(_)));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let (_, sandboxes, _) = setup();
        let created = sandboxes.create(&Sandbox::new("default", "a")).await.unwrap();

        let mut first = created.clone();
        first.spec.replicas = Some(0);
        sandboxes.replace(&first).await.unwrap();

        let mut second = created;
        second.metadata.labels.insert("x".into(), "y".into());
        let err = sandboxes.replace(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_generation_tracks_spec_only() {
        let (store, sandboxes, _) = setup();
        let mut sandbox = sandboxes.create(&Sandbox::new("default", "a")).await.unwrap();

        sandbox.metadata.labels.insert("team".into(), "a".into());
        let sandbox = sandboxes.replace(&sandbox).await.unwrap();
        assert_eq!(sandbox.metadata.generation, 1);

        let mut with_status = sandbox.clone();
        with_status.status.replicas = 1;
        let with_status = sandboxes.replace_status(&with_status).await.unwrap();
        assert_eq!(with_status.metadata.generation, 1);

        let mut scaled = with_status.clone();
        scaled.spec.replicas = Some(0);
        scaled.status.replicas = 7;
        let scaled = sandboxes.replace(&scaled).await.unwrap();
        assert_eq!(scaled.metadata.generation, 2);
        // Spec writes never touch status.
        assert_eq!(scaled.status.replicas, 1);

        let revision = store.revision().await;
        sandboxes.replace(&scaled).await.unwrap();
        sandboxes.replace_status(&scaled).await.unwrap();
        assert_eq!(store.revision().await, revision);
    }

    #[tokio::test]
    async fn test_delete_cascades_through_owners() {
        let (store, sandboxes, pods) = setup();
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        let services: Api<Service> = Api::new(dyn_store);

        let sandbox = sandboxes.create(&Sandbox::new("default", "a")).await.unwrap();
        let mut pod = Pod::new("default", "a");
        set_controller_reference(&sandbox, &mut pod.metadata).unwrap();
        let pod = pods.create(&pod).await.unwrap();

        let mut svc = Service::default();
        svc.metadata = crate::ObjectMeta::new("default", "a");
        set_controller_reference(&pod, &mut svc.metadata).unwrap();
        services.create(&svc).await.unwrap();

        pods.create(&Pod::new("default", "unrelated")).await.unwrap();

        sandboxes.delete(&sandbox.key()).await.unwrap();
        assert!(pods.get_opt(&pod.key()).await.unwrap().is_none());
        assert!(services.get_opt(&svc.metadata.key()).await.unwrap().is_none());
        assert_eq!(store.len().await, 1);

        assert!(!sandboxes.delete_opt(&sandbox.key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_preconditions() {
        let (_, _, pods) = setup();
        let listed = pods.create(&Pod::new("default", "p")).await.unwrap();

        // Changed after it was listed.
        let mut changed = listed.clone();
        changed.metadata.labels.insert("claimed".into(), "yes".into());
        pods.replace(&changed).await.unwrap();
        let err = pods.delete_unchanged(&listed).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Same name, different object.
        pods.delete(&listed.key()).await.unwrap();
        let recreated = pods.create(&Pod::new("default", "p")).await.unwrap();
        let mut stale = listed.clone();
        stale.metadata.resource_version = recreated.metadata.resource_version;
        let err = pods.delete_unchanged(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::UidMismatch { .. }));
        assert!(err.is_conflict());
        assert!(pods.get_opt(&recreated.key()).await.unwrap().is_some());

        pods.delete_unchanged(&recreated).await.unwrap();
        assert!(pods.get_opt(&recreated.key()).await.unwrap().is_none());

        let err = pods.delete_unchanged(&recreated).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_watch_carries_previous_object() {
        let (store, sandboxes, _) = setup();
        let mut events = store.watch();

        let mut sandbox = sandboxes.create(&Sandbox::new("default", "a")).await.unwrap();
        sandbox.metadata.labels.insert("v".into(), "2".into());
        sandboxes.replace(&sandbox).await.unwrap();
        sandboxes.delete(&sandbox.key()).await.unwrap();

        let added = events.recv().await.unwrap();
        assert_eq!(added.event_type, EventType::Added);

        let modified = events.recv().await.unwrap();
        assert_eq!(modified.event_type, EventType::Modified);
        let previous = modified.previous.as_ref().expect("previous object");
        assert!(previous.metadata.labels.is_empty());
        assert_eq!(modified.object.metadata.labels["v"], "2");
        assert_eq!(modified.objects().count(), 2);

        let deleted = events.recv().await.unwrap();
        assert_eq!(deleted.event_type, EventType::Deleted);
        assert_eq!(deleted.kind(), "Sandbox");
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (_, _, pods) = setup();
        let mut labelled = Pod::new("team-a", "one");
        labelled.metadata.labels.insert("pool".into(), "p".into());
        pods.create(&labelled).await.unwrap();
        pods.create(&Pod::new("team-a", "two")).await.unwrap();
        pods.create(&Pod::new("team-b", "three")).await.unwrap();

        assert_eq!(pods.list("team-a", &LabelSelector::everything()).await.unwrap().len(), 2);
        let pooled = pods
            .list("team-a", &LabelSelector::everything().eq("pool", "p"))
            .await
            .unwrap();
        assert_eq!(pooled.len(), 1);
        assert_eq!(pooled[0].metadata.name, "one");
    }
}
