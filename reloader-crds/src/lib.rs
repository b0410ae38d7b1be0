//! Typed clients for the foreign resources the reloader consumes.
//!
//! None of these kinds are owned by this project: `DeploymentConfig` comes
//! from OpenShift, `Rollout` from Argo and the secrets-store pair from the
//! Secrets Store CSI driver. Only the fields the controller reads or writes
//! are modeled; everything else is kept in a flattened map so a
//! read-modify-write cycle never drops server-side state.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::NamespaceResourceScope;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Argo Rollout, `argoproj.io/v1alpha1`.
///
/// `restartAt` is the field the restart strategy writes; the pod template
/// is what the default strategy stamps.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Rollout",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_at: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// OpenShift DeploymentConfig, `apps.openshift.io/v1`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.openshift.io",
    version = "v1",
    kind = "DeploymentConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Secrets Store CSI SecretProviderClass, `secrets-store.csi.x-k8s.io/v1`.
///
/// The controller only reads its annotations; the spec passes through.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets-store.csi.x-k8s.io",
    version = "v1",
    kind = "SecretProviderClass",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClassSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Secrets Store CSI per-pod status object.
///
/// This kind carries no `spec` at all, which rules out the
/// `CustomResource` derive; `kube::Resource` is implemented by hand
/// instead.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClassPodStatus {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SecretProviderClassPodStatusStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClassPodStatusStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_provider_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<SecretProviderClassObject>,
}

/// One projected object as reported by the CSI driver.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClassObject {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

impl kube::Resource for SecretProviderClassPodStatus {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> std::borrow::Cow<'_, str> {
        "SecretProviderClassPodStatus".into()
    }

    fn group(_: &()) -> std::borrow::Cow<'_, str> {
        "secrets-store.csi.x-k8s.io".into()
    }

    fn version(_: &()) -> std::borrow::Cow<'_, str> {
        "v1".into()
    }

    fn plural(_: &()) -> std::borrow::Cow<'_, str> {
        "secretproviderclasspodstatuses".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_round_trip_preserves_unknown_spec_fields() {
        let raw = serde_json::json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Rollout",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": 3,
                "strategy": {"canary": {"steps": [{"setWeight": 20}]}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "web", "image": "web:1"}]}
                }
            }
        });

        let rollout: Rollout = serde_json::from_value(raw.clone()).unwrap();
        assert!(rollout.spec.template.is_some());
        assert_eq!(rollout.spec.extra["replicas"], 3);

        let back = serde_json::to_value(&rollout).unwrap();
        assert_eq!(back["spec"]["replicas"], raw["spec"]["replicas"]);
        assert_eq!(back["spec"]["strategy"], raw["spec"]["strategy"]);
    }

    #[test]
    fn deployment_config_round_trip_preserves_triggers() {
        let raw = serde_json::json!({
            "apiVersion": "apps.openshift.io/v1",
            "kind": "DeploymentConfig",
            "metadata": {"name": "legacy", "namespace": "apps"},
            "spec": {
                "replicas": 2,
                "triggers": [{"type": "ConfigChange"}],
                "template": {
                    "metadata": {},
                    "spec": {"containers": [{"name": "app", "image": "app:1"}]}
                }
            }
        });

        let dc: DeploymentConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(dc.spec.paused, None);

        let back = serde_json::to_value(&dc).unwrap();
        assert_eq!(back["spec"]["triggers"], raw["spec"]["triggers"]);
    }

    #[test]
    fn spcps_deserializes_without_spec() {
        let raw = serde_json::json!({
            "apiVersion": "secrets-store.csi.x-k8s.io/v1",
            "kind": "SecretProviderClassPodStatus",
            "metadata": {"name": "app-pod-default-vault", "namespace": "default"},
            "status": {
                "mounted": true,
                "podName": "app-pod",
                "secretProviderClassName": "vault",
                "targetPath": "/var/run/secrets",
                "objects": [
                    {"id": "secret/db-password", "version": "7"}
                ]
            }
        });

        let spcps: SecretProviderClassPodStatus = serde_json::from_value(raw).unwrap();
        let status = spcps.status.unwrap();
        assert_eq!(status.secret_provider_class_name.as_deref(), Some("vault"));
        assert_eq!(status.objects.len(), 1);
        assert_eq!(status.objects[0].version, "7");
    }

    #[test]
    fn spcps_resource_coordinates() {
        use kube::Resource;

        assert_eq!(SecretProviderClassPodStatus::kind(&()), "SecretProviderClassPodStatus");
        assert_eq!(SecretProviderClassPodStatus::group(&()), "secrets-store.csi.x-k8s.io");
        assert_eq!(
            SecretProviderClassPodStatus::plural(&()),
            "secretproviderclasspodstatuses"
        );
    }
}
