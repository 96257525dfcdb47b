//! Explicit registry of the kinds a store accepts.

use crate::extensions::{SandboxClaim, SandboxTemplate, SandboxWarmPool};
use crate::platform::{NetworkPolicy, PersistentVolumeClaim, Pod, Service};
use crate::{Resource, Result, Sandbox, StoreError};
use std::collections::BTreeMap;

/// Static description of a registered kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub kind: &'static str,
    pub api_version: &'static str,
}

/// Kinds known to a store. Built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    kinds: BTreeMap<&'static str, KindInfo>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pod, Service, PersistentVolumeClaim and Sandbox.
    pub fn core() -> Self {
        Self::new()
            .with::<Pod>()
            .with::<Service>()
            .with::<PersistentVolumeClaim>()
            .with::<Sandbox>()
    }

    /// Adds the claim, template and warm pool kinds, and the NetworkPolicy
    /// kind claims manage.
    pub fn with_extensions(self) -> Self {
        self.with::<SandboxClaim>()
            .with::<SandboxTemplate>()
            .with::<SandboxWarmPool>()
            .with::<NetworkPolicy>()
    }

    pub fn with<K: Resource>(mut self) -> Self {
        self.register::<K>();
        self
    }

    pub fn register<K: Resource>(&mut self) {
        self.kinds.insert(
            K::KIND,
            KindInfo {
                kind: K::KIND,
                api_version: K::API_VERSION,
            },
        );
    }

    pub fn lookup(&self, kind: &str) -> Result<&KindInfo> {
        self.kinds
            .get(kind)
            .ok_or_else(|| StoreError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindInfo> {
        self.kinds.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_registry() {
        let registry = Registry::core();
        assert!(registry.contains("Sandbox"));
        assert!(registry.contains("Pod"));
        assert!(!registry.contains("SandboxClaim"));
        assert!(matches!(
            registry.lookup("SandboxClaim"),
            Err(StoreError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_extensions() {
        let registry = Registry::core().with_extensions();
        assert_eq!(registry.kinds().count(), 8);
        let info = registry.lookup("SandboxWarmPool").unwrap();
        assert_eq!(info.api_version, "extensions.agents.x-k8s.io/v1alpha1");
        let info = registry.lookup("NetworkPolicy").unwrap();
        assert_eq!(info.api_version, "networking.k8s.io/v1");
    }
}
