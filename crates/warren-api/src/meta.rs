//! Object metadata shared by every resource kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Namespaced identity of an object within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from a dependent object to the object that owns it.
///
/// At most one owner reference per object has `controller` set; that owner is
/// responsible for the dependent's lifecycle, and deleting it cascades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

/// Standard object metadata.
///
/// `uid`, `resource_version`, `generation` and `creation_timestamp` are owned
/// by the store and ignored on writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    /// Name prefix used by the store when `name` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Version used for optimistic concurrency; bumped on every write.
    #[serde(default)]
    pub resource_version: u64,

    /// Bumped only when the spec changes.
    #[serde(default)]
    pub generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// The owner reference marked as controller, if any.
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// Whether `owner` is this object's controller.
    pub fn is_controlled_by(&self, owner: &ObjectMeta) -> bool {
        !owner.uid.is_empty() && self.controller().is_some_and(|r| r.uid == owner.uid)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "v1".into(),
            kind: "Thing".into(),
            name: "owner".into(),
            uid: uid.into(),
            controller,
            block_owner_deletion: true,
        }
    }

    #[test]
    fn test_controller_lookup() {
        let mut meta = ObjectMeta::new("default", "child");
        meta.owner_references.push(owner("a", false));
        assert!(meta.controller().is_none());

        meta.owner_references.push(owner("b", true));
        assert_eq!(meta.controller().map(|r| r.uid.as_str()), Some("b"));

        let mut parent = ObjectMeta::new("default", "owner");
        parent.uid = "b".into();
        assert!(meta.is_controlled_by(&parent));
        parent.uid = "a".into();
        assert!(!meta.is_controlled_by(&parent));
    }

    #[test]
    fn test_owner_without_uid_controls_nothing() {
        let mut meta = ObjectMeta::new("default", "child");
        meta.owner_references.push(owner("", true));
        assert!(!meta.is_controlled_by(&ObjectMeta::new("default", "owner")));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ObjectKey::new("ns", "name").to_string(), "ns/name");
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = serde_json::to_value(ObjectMeta::new("default", "x")).unwrap();
        assert!(json.get("labels").is_none());
        assert!(json.get("ownerReferences").is_none());
        assert_eq!(json["resourceVersion"], 0);
    }
}
