//! Static extraction of the configuration objects a pod template consumes.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Container, PodTemplateSpec, Volume};

use crate::source::ConfigKind;

const CSI_DRIVER: &str = "secrets-store.csi.k8s.io";
const SPC_ATTRIBUTE: &str = "secretProviderClass";

/// Names of every ConfigMap, Secret and SecretProviderClass a pod
/// template references, by any of the supported mechanisms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    pub configmaps: BTreeSet<String>,
    pub secrets: BTreeSet<String>,
    pub secret_provider_classes: BTreeSet<String>,
}

impl ReferenceSet {
    pub fn contains(&self, kind: ConfigKind, name: &str) -> bool {
        self.names(kind).contains(name)
    }

    pub fn names(&self, kind: ConfigKind) -> &BTreeSet<String> {
        match kind {
            ConfigKind::ConfigMap => &self.configmaps,
            ConfigKind::Secret => &self.secrets,
            ConfigKind::SecretProviderClass => &self.secret_provider_classes,
        }
    }
}

pub fn references(template: &PodTemplateSpec) -> ReferenceSet {
    let mut refs = ReferenceSet::default();
    let Some(spec) = template.spec.as_ref() else {
        return refs;
    };

    for container in spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
    {
        collect_container(container, &mut refs);
    }
    for volume in spec.volumes.iter().flatten() {
        collect_volume(volume, &mut refs);
    }

    refs
}

fn collect_container(container: &Container, refs: &mut ReferenceSet) {
    for env in container.env.iter().flatten() {
        let Some(from) = env.value_from.as_ref() else {
            continue;
        };
        if let Some(name) = from.config_map_key_ref.as_ref().and_then(|r| r.name.clone()) {
            refs.configmaps.insert(name);
        }
        if let Some(name) = from.secret_key_ref.as_ref().and_then(|r| r.name.clone()) {
            refs.secrets.insert(name);
        }
    }

    for env_from in container.env_from.iter().flatten() {
        if let Some(name) = env_from.config_map_ref.as_ref().and_then(|r| r.name.clone()) {
            refs.configmaps.insert(name);
        }
        if let Some(name) = env_from.secret_ref.as_ref().and_then(|r| r.name.clone()) {
            refs.secrets.insert(name);
        }
    }
}

fn collect_volume(volume: &Volume, refs: &mut ReferenceSet) {
    if let Some(name) = volume.config_map.as_ref().and_then(|v| v.name.clone()) {
        refs.configmaps.insert(name);
    }
    if let Some(name) = volume.secret.as_ref().and_then(|v| v.secret_name.clone()) {
        refs.secrets.insert(name);
    }

    for source in volume
        .projected
        .iter()
        .flat_map(|p| p.sources.iter())
        .flatten()
    {
        if let Some(name) = source.config_map.as_ref().and_then(|p| p.name.clone()) {
            refs.configmaps.insert(name);
        }
        if let Some(name) = source.secret.as_ref().and_then(|p| p.name.clone()) {
            refs.secrets.insert(name);
        }
    }

    if let Some(csi) = volume.csi.as_ref() {
        if csi.driver == CSI_DRIVER {
            if let Some(class) = csi
                .volume_attributes
                .as_ref()
                .and_then(|attrs| attrs.get(SPC_ATTRIBUTE))
            {
                refs.secret_provider_classes.insert(class.clone());
            }
        }
    }
}
