//! Storage, compute and network children of a Sandbox.

use super::SandboxReconciler;
use crate::error::{CoreError, Result};
use crate::hash::name_hash;
use std::collections::BTreeMap;
use warren_api::keys::{PENDING_ADOPTION_ANNOTATION, SANDBOX_NAME_HASH_LABEL};
use warren_api::platform::{PersistentVolumeClaimTemplate, ServiceSpec, Volume, CLUSTER_IP_NONE};
use warren_api::{
    set_controller_reference, ObjectKey, ObjectMeta, PersistentVolumeClaim, Pod, Resource,
    Sandbox, Service,
};

/// Name of the claim created for `template` on `sandbox`.
pub fn pvc_name(template: &PersistentVolumeClaimTemplate, sandbox: &Sandbox) -> String {
    format!("{}-{}", template.metadata.name, sandbox.metadata.name)
}

fn fingerprint_labels(sandbox: &Sandbox) -> BTreeMap<String, String> {
    BTreeMap::from([(
        SANDBOX_NAME_HASH_LABEL.to_string(),
        name_hash(&sandbox.metadata.name),
    )])
}

/// Pod for `sandbox` built from its template, one volume per storage-claim
/// template, the fingerprint label and a controller reference.
pub fn build_pod(sandbox: &Sandbox, pod_name: &str) -> Result<Pod> {
    let template = &sandbox.spec.pod_template;

    let mut metadata = ObjectMeta::new(&sandbox.metadata.namespace, pod_name);
    metadata.labels = template.metadata.labels.clone();
    metadata.labels.extend(fingerprint_labels(sandbox));
    metadata.annotations = template.metadata.annotations.clone();
    set_controller_reference(sandbox, &mut metadata)?;

    let mut spec = template.spec.clone();
    for pvc in &sandbox.spec.volume_claim_templates {
        if spec.volumes.iter().any(|v| v.name == pvc.metadata.name) {
            continue;
        }
        spec.volumes
            .push(Volume::from_claim(&pvc.metadata.name, pvc_name(pvc, sandbox)));
    }

    Ok(Pod {
        metadata,
        spec,
        ..Default::default()
    })
}

/// Headless Service selecting the Sandbox's pod by fingerprint.
pub fn build_service(sandbox: &Sandbox) -> Result<Service> {
    let mut metadata = ObjectMeta::new(&sandbox.metadata.namespace, &sandbox.metadata.name);
    metadata.labels = fingerprint_labels(sandbox);
    set_controller_reference(sandbox, &mut metadata)?;

    Ok(Service {
        metadata,
        spec: ServiceSpec {
            cluster_ip: Some(CLUSTER_IP_NONE.to_string()),
            selector: fingerprint_labels(sandbox),
        },
    })
}

pub fn build_pvc(sandbox: &Sandbox, template: &PersistentVolumeClaimTemplate) -> Result<PersistentVolumeClaim> {
    let mut metadata = ObjectMeta::new(&sandbox.metadata.namespace, pvc_name(template, sandbox));
    metadata.labels = template.metadata.labels.clone();
    set_controller_reference(sandbox, &mut metadata)?;

    Ok(PersistentVolumeClaim {
        metadata,
        spec: template.spec.clone(),
        ..Default::default()
    })
}

impl SandboxReconciler {
    /// Create any missing storage claims. Existing claims are left as they are.
    pub(super) async fn reconcile_pvcs(&self, sandbox: &Sandbox) -> Result<()> {
        let mut errors = Vec::new();
        for template in &sandbox.spec.volume_claim_templates {
            if let Err(e) = self.reconcile_pvc(sandbox, template).await {
                errors.push(e);
            }
        }
        CoreError::join(errors).map_or(Ok(()), Err)
    }

    async fn reconcile_pvc(
        &self,
        sandbox: &Sandbox,
        template: &PersistentVolumeClaimTemplate,
    ) -> Result<()> {
        let key = ObjectKey::new(&sandbox.metadata.namespace, pvc_name(template, sandbox));
        let existing = self
            .pvcs
            .get_opt(&key)
            .await
            .map_err(CoreError::context("failed to get PVC"))?;
        if existing.is_some() {
            return Ok(());
        }

        let pvc = build_pvc(sandbox, template)?;
        tracing::info!(sandbox = %sandbox.key(), pvc = %key.name, "Creating PVC");
        self.pvcs
            .create(&pvc)
            .await
            .map_err(CoreError::context("failed to create PVC"))?;
        Ok(())
    }

    /// Ensure the backing Pod exists (or is gone when scaled to zero) and
    /// return it.
    pub(super) async fn reconcile_pod(&self, sandbox: &Sandbox) -> Result<Option<Pod>> {
        let key = ObjectKey::new(&sandbox.metadata.namespace, sandbox.pod_name());
        let existing = self
            .pods
            .get_opt(&key)
            .await
            .map_err(CoreError::context("failed to get pod"))?;

        if sandbox.desired_replicas() == 0 {
            match existing {
                Some(pod) if !pod.metadata.is_being_deleted() => {
                    tracing::info!(sandbox = %sandbox.key(), pod = %key.name, "Deleting pod because replicas is 0");
                    self.pods
                        .delete_opt(&key)
                        .await
                        .map_err(CoreError::context("failed to delete pod"))?;
                }
                Some(_) => {
                    tracing::debug!(sandbox = %sandbox.key(), pod = %key.name, "Pod is already being deleted");
                }
                None => {}
            }
            return Ok(None);
        }

        if let Some(pod) = existing {
            if let Some(owner) = pod.metadata.controller() {
                if owner.uid != sandbox.metadata.uid {
                    return Err(CoreError::NotControlled {
                        kind: Pod::KIND,
                        name: key.name,
                        owner: format!("{} {:?}", Sandbox::KIND, sandbox.metadata.name),
                    });
                }
            }
            tracing::debug!(sandbox = %sandbox.key(), pod = %key.name, "Found pod");
            return Ok(Some(pod));
        }

        if sandbox.metadata.annotations.contains_key(PENDING_ADOPTION_ANNOTATION) {
            tracing::debug!(sandbox = %sandbox.key(), "Waiting for warm pool adoption before creating a pod");
            return Ok(None);
        }

        let pod = build_pod(sandbox, &key.name)?;
        tracing::info!(sandbox = %sandbox.key(), pod = %key.name, "Creating pod");
        let created = self
            .pods
            .create(&pod)
            .await
            .map_err(CoreError::context("failed to create pod"))?;
        Ok(Some(created))
    }

    /// Ensure the headless Service exists and return it.
    pub(super) async fn reconcile_service(&self, sandbox: &Sandbox) -> Result<Service> {
        let key = sandbox.key();
        if let Some(service) = self
            .services
            .get_opt(&key)
            .await
            .map_err(CoreError::context("failed to get service"))?
        {
            tracing::debug!(sandbox = %key, "Found service");
            return Ok(service);
        }

        let service = build_service(sandbox)?;
        tracing::info!(sandbox = %key, "Creating service");
        self.services
            .create(&service)
            .await
            .map_err(CoreError::context("failed to create service"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_api::platform::Container;

    fn sandbox() -> Sandbox {
        let mut sandbox = Sandbox::new("team-a", "demo");
        sandbox.metadata.uid = "sandbox-uid".into();
        sandbox.spec.pod_template.spec.containers.push(Container::new("main", "python:3.12"));
        sandbox
            .spec
            .pod_template
            .metadata
            .labels
            .insert("app".into(), "agent".into());
        sandbox.spec.volume_claim_templates.push(PersistentVolumeClaimTemplate {
            metadata: ObjectMeta::new("", "workspace"),
            ..Default::default()
        });
        sandbox
    }

    #[test]
    fn test_build_pod() {
        let sandbox = sandbox();
        let pod = build_pod(&sandbox, "demo").unwrap();

        assert_eq!(pod.metadata.key(), ObjectKey::new("team-a", "demo"));
        assert_eq!(pod.metadata.labels["app"], "agent");
        assert_eq!(
            pod.metadata.labels[SANDBOX_NAME_HASH_LABEL],
            name_hash("demo")
        );
        assert!(pod.metadata.is_controlled_by(&sandbox.metadata));
        assert_eq!(pod.spec.containers[0].image, "python:3.12");

        let volume = &pod.spec.volumes[0];
        assert_eq!(volume.name, "workspace");
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "workspace-demo"
        );
    }

    #[test]
    fn test_fingerprint_overrides_template_label() {
        let mut sandbox = sandbox();
        sandbox
            .spec
            .pod_template
            .metadata
            .labels
            .insert(SANDBOX_NAME_HASH_LABEL.into(), "spoofed".into());
        let pod = build_pod(&sandbox, "demo").unwrap();
        assert_eq!(
            pod.metadata.labels[SANDBOX_NAME_HASH_LABEL],
            name_hash("demo")
        );
    }

    #[test]
    fn test_build_service_is_headless() {
        let sandbox = sandbox();
        let service = build_service(&sandbox).unwrap();
        assert!(service.is_headless());
        assert_eq!(service.metadata.name, "demo");
        assert_eq!(
            service.spec.selector[SANDBOX_NAME_HASH_LABEL],
            name_hash("demo")
        );
        assert_eq!(service.metadata.labels, service.spec.selector);
        assert!(service.metadata.is_controlled_by(&sandbox.metadata));
    }

    #[test]
    fn test_build_pvc() {
        let sandbox = sandbox();
        let pvc = build_pvc(&sandbox, &sandbox.spec.volume_claim_templates[0]).unwrap();
        assert_eq!(pvc.metadata.key(), ObjectKey::new("team-a", "workspace-demo"));
        assert!(pvc.metadata.is_controlled_by(&sandbox.metadata));
    }
}
