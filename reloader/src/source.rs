//! Uniform view over the three watched configuration kinds.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::ListParams;
use kube::{Api, Client};

use reloader_crds::{SecretProviderClass, SecretProviderClassPodStatus};

use crate::annotations::ResourceContract;
use crate::fingerprint::Fingerprint;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    ConfigMap,
    Secret,
    SecretProviderClass,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::ConfigMap => "configmap",
            ConfigKind::Secret => "secret",
            ConfigKind::SecretProviderClass => "secretproviderclass",
        }
    }

    /// Token used in environment-variable stamps.
    pub fn env_token(&self) -> &'static str {
        match self {
            ConfigKind::ConfigMap => "CONFIGMAP",
            ConfigKind::Secret => "SECRET",
            ConfigKind::SecretProviderClass => "SECRETPROVIDERCLASS",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration object as the pipeline sees it.
///
/// `fingerprint` is `None` for deleted objects.
#[derive(Debug, Clone)]
pub struct ConfigObject {
    pub kind: ConfigKind,
    pub namespace: String,
    pub name: String,
    pub contract: ResourceContract,
    pub fingerprint: Option<Fingerprint>,
}

impl ConfigObject {
    /// `kind/name`, the form used in stamps, events and logs.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

pub fn configmap_fingerprint(cm: &ConfigMap) -> Fingerprint {
    let data = cm.data.iter().flatten().map(|(k, v)| (k.as_str(), v.as_bytes()));
    let binary = cm
        .binary_data
        .iter()
        .flatten()
        .map(|(k, v)| (k.as_str(), v.0.as_slice()));
    Fingerprint::of_pairs(data.chain(binary))
}

pub fn secret_fingerprint(secret: &Secret) -> Fingerprint {
    let data = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.as_str(), v.0.as_slice()));
    Fingerprint::of_pairs(data)
}

/// Fingerprint of the objects a single pod-status reports as mounted.
pub fn spcps_fingerprint(spcps: &SecretProviderClassPodStatus) -> Fingerprint {
    let objects = spcps
        .status
        .iter()
        .flat_map(|s| s.objects.iter())
        .map(|o| (o.id.as_str(), o.version.as_bytes()));
    Fingerprint::of_pairs(objects)
}

/// Name of the SecretProviderClass a pod-status belongs to.
pub fn spcps_owner(spcps: &SecretProviderClassPodStatus) -> Option<&str> {
    spcps
        .status
        .as_ref()
        .and_then(|s| s.secret_provider_class_name.as_deref())
}

/// Re-read a configuration object from the API server.
///
/// The worker never trusts a cached snapshot for mutation decisions;
/// every queue item goes through here first. `Ok(None)` means the object
/// is gone.
pub async fn fetch(
    client: &Client,
    kind: ConfigKind,
    namespace: &str,
    name: &str,
) -> Result<Option<ConfigObject>, kube::Error> {
    match kind {
        ConfigKind::ConfigMap => {
            let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
            Ok(api.get_opt(name).await?.map(|cm| ConfigObject {
                kind,
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                contract: ResourceContract::from_annotations(cm.metadata.annotations.as_ref()),
                fingerprint: Some(configmap_fingerprint(&cm)),
            }))
        }
        ConfigKind::Secret => {
            let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
            Ok(api.get_opt(name).await?.map(|secret| ConfigObject {
                kind,
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                contract: ResourceContract::from_annotations(secret.metadata.annotations.as_ref()),
                fingerprint: Some(secret_fingerprint(&secret)),
            }))
        }
        ConfigKind::SecretProviderClass => fetch_spc(client, namespace, name).await,
    }
}

/// A SecretProviderClass event aggregates every pod-status that belongs
/// to the class: the class object carries the policy annotations, the
/// pod-statuses carry the projected object versions.
async fn fetch_spc(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<ConfigObject>, kube::Error> {
    let classes: Api<SecretProviderClass> = Api::namespaced(client.clone(), namespace);
    let class = classes.get_opt(name).await?;

    let statuses: Api<SecretProviderClassPodStatus> = Api::namespaced(client.clone(), namespace);
    let mut objects: BTreeMap<String, String> = BTreeMap::new();
    let mut seen = false;
    for spcps in statuses.list(&ListParams::default()).await? {
        if spcps_owner(&spcps) != Some(name) {
            continue;
        }
        seen = true;
        for object in spcps.status.iter().flat_map(|s| s.objects.iter()) {
            objects.insert(object.id.clone(), object.version.clone());
        }
    }

    if class.is_none() && !seen {
        return Ok(None);
    }

    let contract = class
        .as_ref()
        .map(|c| ResourceContract::from_annotations(c.metadata.annotations.as_ref()))
        .unwrap_or_default();
    let fingerprint =
        Fingerprint::of_pairs(objects.iter().map(|(k, v)| (k.as_str(), v.as_bytes())));

    Ok(Some(ConfigObject {
        kind: ConfigKind::SecretProviderClass,
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        contract,
        fingerprint: Some(fingerprint),
    }))
}
