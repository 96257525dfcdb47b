//! The Sandbox resource.

use crate::condition::{find_condition, Condition};
use crate::platform::{PersistentVolumeClaimTemplate, PodTemplateSpec};
use crate::keys::POD_NAME_ANNOTATION;
use crate::resource::impl_resource;
use crate::ObjectMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SANDBOX_API_VERSION: &str = "agents.x-k8s.io/v1alpha1";

/// The single condition type Sandboxes and claims report.
pub const CONDITION_READY: &str = "Ready";

/// Reasons carried by the Ready condition.
pub mod reasons {
    pub const DEPENDENCIES_READY: &str = "DependenciesReady";
    pub const DEPENDENCIES_NOT_READY: &str = "DependenciesNotReady";
    pub const RECONCILER_ERROR: &str = "ReconcilerError";
    pub const EXPIRED: &str = "Expired";
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

/// A single stateful workload: one Pod, a headless Service, and optional
/// per-sandbox storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SandboxSpec,
    #[serde(default)]
    pub status: SandboxStatus,
}

impl_resource!(Sandbox, "Sandbox", SANDBOX_API_VERSION);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    #[serde(default)]
    pub pod_template: PodTemplateSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaimTemplate>,

    /// Either 0 or 1; unset means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Absolute time after which the Sandbox's Pod and Service are deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_fqdn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label_selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Sandbox {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            ..Default::default()
        }
    }

    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    /// Name of the backing Pod: the adopted pod if one was recorded, otherwise
    /// the Sandbox's own name.
    pub fn pod_name(&self) -> &str {
        self.metadata
            .annotation(POD_NAME_ANNOTATION)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.metadata.name)
    }

    pub fn ready_condition(&self) -> Option<&Condition> {
        find_condition(&self.status.conditions, CONDITION_READY)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_condition().is_some_and(Condition::is_true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let sandbox = Sandbox::new("default", "demo");
        assert_eq!(sandbox.desired_replicas(), 1);
        assert_eq!(sandbox.pod_name(), "demo");
        assert!(!sandbox.is_ready());
    }

    #[test]
    fn test_pod_name_annotation() {
        let mut sandbox = Sandbox::new("default", "demo");
        sandbox
            .metadata
            .annotations
            .insert(POD_NAME_ANNOTATION.into(), "pool-abc12".into());
        assert_eq!(sandbox.pod_name(), "pool-abc12");

        sandbox
            .metadata
            .annotations
            .insert(POD_NAME_ANNOTATION.into(), String::new());
        assert_eq!(sandbox.pod_name(), "demo");
    }

    #[test]
    fn test_spec_wire_format() {
        let json = serde_json::json!({
            "podTemplate": {
                "metadata": {"labels": {"app": "agent"}},
                "spec": {"containers": [{"name": "main", "image": "python:3.12"}]}
            },
            "volumeClaimTemplates": [{"metadata": {"name": "workspace"}, "spec": {}}],
            "replicas": 0,
            "shutdownTime": "2030-01-01T00:00:00Z"
        });
        let spec: SandboxSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.replicas, Some(0));
        assert_eq!(spec.pod_template.spec.containers[0].image, "python:3.12");
        assert_eq!(spec.volume_claim_templates[0].metadata.name, "workspace");
        assert!(spec.shutdown_time.is_some());
    }
}
