//! Extension kinds: templates, warm pools and claims.

use crate::condition::{find_condition, Condition};
use crate::platform::PodTemplateSpec;
use crate::resource::impl_resource;
use crate::sandbox::CONDITION_READY;
use crate::ObjectMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXTENSIONS_API_VERSION: &str = "extensions.agents.x-k8s.io/v1alpha1";

/// Ready reasons specific to claims.
pub mod reasons {
    pub const CLAIM_EXPIRED: &str = "ClaimExpired";
    pub const TEMPLATE_NOT_FOUND: &str = "TemplateNotFound";
    pub const SANDBOX_MISSING: &str = "SandboxMissing";
    pub const SANDBOX_NOT_READY: &str = "SandboxNotReady";
}

/// Reference to a [`SandboxTemplate`] in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxTemplateRef {
    pub name: String,
}

impl SandboxTemplateRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// ============================================================================
// SandboxTemplate
// ============================================================================

/// Reusable blueprint for sandboxes. Read-only to the controllers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SandboxTemplateSpec,
}

impl_resource!(SandboxTemplate, "SandboxTemplate", EXTENSIONS_API_VERSION);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTemplateSpec {
    #[serde(default)]
    pub pod_template: PodTemplateSpec,
    /// Applied to every claimed sandbox built from this template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicyRules>,
}

/// Ingress and egress rules in the platform's NetworkPolicy rule format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicyRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<serde_json::Value>,
}

impl SandboxTemplate {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            ..Default::default()
        }
    }
}

// ============================================================================
// SandboxWarmPool
// ============================================================================

/// A target number of pre-started, unclaimed pods built from a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxWarmPool {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SandboxWarmPoolSpec,
    #[serde(default)]
    pub status: SandboxWarmPoolStatus,
}

impl_resource!(SandboxWarmPool, "SandboxWarmPool", EXTENSIONS_API_VERSION);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxWarmPoolSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub template_ref: SandboxTemplateRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxWarmPoolStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<String>,
}

impl SandboxWarmPool {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        template: impl Into<String>,
        replicas: i32,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: SandboxWarmPoolSpec {
                replicas,
                template_ref: SandboxTemplateRef::new(template),
            },
            status: SandboxWarmPoolStatus::default(),
        }
    }
}

// ============================================================================
// SandboxClaim
// ============================================================================

/// What happens to a claim once its shutdown time passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPolicy {
    /// Delete the claim itself; the Sandbox follows by cascade.
    Delete,
    /// Delete the Sandbox but keep the claim with an expired status.
    #[default]
    Retain,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
}

/// A request for one Sandbox built from a named template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxClaim {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SandboxClaimSpec,
    #[serde(default)]
    pub status: SandboxClaimStatus,
}

impl_resource!(SandboxClaim, "SandboxClaim", EXTENSIONS_API_VERSION);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimSpec {
    #[serde(default)]
    pub template_ref: SandboxTemplateRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxClaimStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub sandbox: ClaimedSandbox,
}

/// The Sandbox a claim resulted in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedSandbox {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_fqdn: String,
}

impl SandboxClaim {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: SandboxClaimSpec {
                template_ref: SandboxTemplateRef::new(template),
                lifecycle: None,
            },
            status: SandboxClaimStatus::default(),
        }
    }

    pub fn shutdown_time(&self) -> Option<DateTime<Utc>> {
        self.spec.lifecycle.as_ref().and_then(|l| l.shutdown_time)
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        self.spec
            .lifecycle
            .as_ref()
            .map(|l| l.shutdown_policy)
            .unwrap_or_default()
    }

    pub fn ready_condition(&self) -> Option<&Condition> {
        find_condition(&self.status.conditions, CONDITION_READY)
    }

    /// Whether the claim's status already records its expiry.
    pub fn has_expired_condition(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.reason == reasons::CLAIM_EXPIRED)
    }
}
