//! OpenShift DeploymentConfig: template stamp plus pause support, same
//! shape as a Deployment.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use reloader_crds::DeploymentConfig;

use super::{TemplatedWorkload, WorkloadKind};

impl TemplatedWorkload for DeploymentConfig {
    const KIND: WorkloadKind = WorkloadKind::DeploymentConfig;
    const PAUSABLE: bool = true;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.template.as_ref()
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.template.as_mut()
    }

    fn set_paused(&mut self, paused: bool) -> bool {
        self.spec.paused = paused.then_some(true);
        true
    }
}
