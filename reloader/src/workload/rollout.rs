//! Argo Rollout: either a plain template stamp or, under
//! `rollout-strategy=restart`, a write to `spec.restartAt`.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use reloader_crds::Rollout;

use super::{TemplatedWorkload, WorkloadKind};

impl TemplatedWorkload for Rollout {
    const KIND: WorkloadKind = WorkloadKind::Rollout;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.template.as_ref()
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.template.as_mut()
    }

    fn set_restart_at(&mut self, at: &str) -> bool {
        self.spec.restart_at = Some(at.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reloader_crds::RolloutSpec;

    #[test]
    fn restart_at_is_written_without_touching_the_template() {
        let template = PodTemplateSpec::default();
        let mut rollout = Rollout::new(
            "web",
            RolloutSpec {
                template: Some(template.clone()),
                restart_at: None,
                extra: Default::default(),
            },
        );

        assert!(rollout.set_restart_at("2026-08-01T12:00:00Z"));
        assert_eq!(rollout.spec.restart_at.as_deref(), Some("2026-08-01T12:00:00Z"));
        assert_eq!(rollout.spec.template.as_ref(), Some(&template));
    }
}
