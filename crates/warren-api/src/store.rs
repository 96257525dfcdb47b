//! The object store seam and a typed client over it.

use crate::{DynamicObject, LabelSelector, ObjectKey, ObjectMeta, Resource, Result};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A change to one stored object.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// The object after the change, or its last state for deletions.
    pub object: DynamicObject,
    /// The object before the change, for modifications.
    pub previous: Option<DynamicObject>,
}

impl WatchEvent {
    pub fn kind(&self) -> &str {
        &self.object.kind
    }

    /// The new object followed by the previous one, if any.
    pub fn objects(&self) -> impl Iterator<Item = &DynamicObject> {
        std::iter::once(&self.object).chain(self.previous.as_ref())
    }
}

/// Conditions a delete must meet. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<u64>,
}

impl Preconditions {
    /// Only delete the exact object described by `meta`, unchanged.
    pub fn matching(meta: &ObjectMeta) -> Self {
        Self {
            uid: Some(meta.uid.clone()),
            resource_version: Some(meta.resource_version),
        }
    }
}

/// Declarative object storage with optimistic concurrency.
///
/// Writes carry the `resource_version` the writer last observed and fail with
/// a conflict if the stored object has moved on. Spec and status are written
/// through separate calls; a status write never bumps `generation`.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, kind: &str, key: &ObjectKey) -> Result<DynamicObject>;

    /// List objects of `kind`, optionally restricted to one namespace.
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Replace metadata and spec. The stored status is kept.
    async fn update(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Replace status only.
    async fn update_status(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Delete an object and, by cascade, everything it controls.
    ///
    /// Fails with a conflict when the stored object does not meet
    /// `preconditions`.
    async fn delete(&self, kind: &str, key: &ObjectKey, preconditions: &Preconditions) -> Result<()>;

    /// Subscribe to changes of every kind.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Typed access to one kind of an [`ObjectStore`].
pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.store.get(K::KIND, key).await?.into_resource()
    }

    /// Like [`get`](Self::get), with not-found mapped to `None`.
    pub async fn get_opt(&self, key: &ObjectKey) -> Result<Option<K>> {
        match self.get(key).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K>> {
        self.store
            .list(K::KIND, Some(namespace), selector)
            .await?
            .into_iter()
            .map(DynamicObject::into_resource)
            .collect()
    }

    pub async fn create(&self, object: &K) -> Result<K> {
        self.store
            .create(DynamicObject::from_resource(object)?)
            .await?
            .into_resource()
    }

    pub async fn replace(&self, object: &K) -> Result<K> {
        self.store
            .update(DynamicObject::from_resource(object)?)
            .await?
            .into_resource()
    }

    pub async fn replace_status(&self, object: &K) -> Result<K> {
        self.store
            .update_status(DynamicObject::from_resource(object)?)
            .await?
            .into_resource()
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.store.delete(K::KIND, key, &Preconditions::default()).await
    }

    /// Delete `object` only if the stored copy is still the one given.
    pub async fn delete_unchanged(&self, object: &K) -> Result<()> {
        self.store
            .delete(K::KIND, &object.key(), &Preconditions::matching(object.meta()))
            .await
    }

    /// Delete treating an already-absent object as success. Returns whether
    /// anything was deleted.
    pub async fn delete_opt(&self, key: &ObjectKey) -> Result<bool> {
        match self.delete(key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
