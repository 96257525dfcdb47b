//! The [`Resource`] trait and the kind-erased [`DynamicObject`].

use crate::{ObjectKey, ObjectMeta, OwnerReference, Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A typed resource kind stored in an [`ObjectStore`](crate::ObjectStore).
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;
    const API_VERSION: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr, $api_version:expr) => {
        impl $crate::Resource for $ty {
            const KIND: &'static str = $kind;
            const API_VERSION: &'static str = $api_version;

            fn meta(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
pub(crate) use impl_resource;

/// Any stored object, with spec and status kept as raw JSON.
///
/// This is the store's native representation; [`Api`](crate::Api) converts
/// to and from typed resources at the edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: Value,
}

impl DynamicObject {
    pub fn new(kind: impl Into<String>, metadata: ObjectMeta) -> Self {
        Self {
            kind: kind.into(),
            metadata,
            spec: Value::Null,
            status: Value::Null,
        }
    }

    pub fn from_resource<K: Resource>(resource: &K) -> Result<Self> {
        let mut value = serde_json::to_value(resource)?;
        let fields = value.as_object_mut().ok_or_else(|| {
            StoreError::InvalidObject(format!("{} did not serialize to an object", K::KIND))
        })?;

        let metadata = match fields.remove("metadata") {
            Some(meta) => serde_json::from_value(meta)?,
            None => ObjectMeta::default(),
        };

        Ok(Self {
            kind: K::KIND.to_string(),
            metadata,
            spec: fields.remove("spec").unwrap_or(Value::Null),
            status: fields.remove("status").unwrap_or(Value::Null),
        })
    }

    pub fn into_resource<K: Resource>(self) -> Result<K> {
        if self.kind != K::KIND {
            return Err(StoreError::KindMismatch {
                expected: K::KIND.to_string(),
                actual: self.kind,
            });
        }

        let mut fields = Map::new();
        fields.insert("metadata".into(), serde_json::to_value(&self.metadata)?);
        if !self.spec.is_null() {
            fields.insert("spec".into(), self.spec);
        }
        if !self.status.is_null() {
            fields.insert("status".into(), self.status);
        }
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

/// Make `owner` the controller of the object described by `child`.
///
/// Fails if the child already has a different controller. Setting the same
/// controller again is a no-op.
pub fn set_controller_reference<O: Resource>(owner: &O, child: &mut ObjectMeta) -> Result<()> {
    let owner_meta = owner.meta();
    if owner_meta.uid.is_empty() {
        return Err(StoreError::InvalidObject(format!(
            "{} {} has no uid and cannot own objects",
            O::KIND,
            owner_meta.key()
        )));
    }

    if let Some(existing) = child.controller() {
        if existing.uid == owner_meta.uid {
            return Ok(());
        }
        return Err(StoreError::AlreadyOwned {
            child: child.key().to_string(),
            owner: format!("{} {}", existing.kind, existing.name),
        });
    }

    child.owner_references.push(OwnerReference {
        api_version: O::API_VERSION.to_string(),
        kind: O::KIND.to_string(),
        name: owner_meta.name.clone(),
        uid: owner_meta.uid.clone(),
        controller: true,
        block_owner_deletion: true,
    });
    Ok(())
}
