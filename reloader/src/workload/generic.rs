//! Catch-all adapter for additional workload kinds configured as
//! `group/version/Kind`, driven through the dynamic API. The only
//! assumption is the conventional pod-template location at
//! `spec.template`.

use anyhow::{bail, Context};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, PodTemplateSpec};
use kube::api::{ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use log::debug;
use serde_json::Value;

use crate::errors::ApplyError;

use super::{apply_to_template, ApplyOutcome, Mutation, Workload, WorkloadAdapter, WorkloadKind};

pub(crate) struct GenericAdapter {
    client: Client,
    resource: ApiResource,
}

impl GenericAdapter {
    /// Build an adapter from a `group/version/Kind` triple
    /// (`version/Kind` for the core group). The plural resource name is
    /// inferred from the kind.
    pub(crate) fn from_gvk_spec(client: Client, spec: &str) -> anyhow::Result<Self> {
        let gvk = parse_gvk(spec)?;
        Ok(GenericAdapter {
            client,
            resource: ApiResource::from_gvk(&gvk),
        })
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

fn parse_gvk(spec: &str) -> anyhow::Result<GroupVersionKind> {
    let parts: Vec<&str> = spec.split('/').collect();
    match parts.as_slice() {
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk("", version, kind))
        }
        _ => bail!("invalid workload kind {spec:?}, expected group/version/Kind"),
    }
}

fn extract_template(data: &Value) -> Option<PodTemplateSpec> {
    let template = data.get("spec")?.get("template")?;
    serde_json::from_value(template.clone()).ok()
}

fn store_template(data: &mut Value, template: &PodTemplateSpec) -> anyhow::Result<()> {
    let spec = data
        .get_mut("spec")
        .context("object has no spec")?
        .as_object_mut()
        .context("spec is not an object")?;
    spec.insert("template".to_string(), serde_json::to_value(template)?);
    Ok(())
}

#[async_trait]
impl WorkloadAdapter for GenericAdapter {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Generic
    }

    fn kind_name(&self) -> String {
        self.resource.kind.clone()
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Workload>, kube::Error> {
        let objects = self.api(namespace).list(&ListParams::default()).await?;
        Ok(objects
            .items
            .into_iter()
            .filter_map(|obj| {
                let template = extract_template(&obj.data)?;
                Some(Workload {
                    kind: WorkloadKind::Generic,
                    namespace: obj.metadata.namespace.clone()?,
                    name: obj.metadata.name.clone()?,
                    annotations: obj.metadata.annotations.clone().unwrap_or_default(),
                    template,
                })
            })
            .collect())
    }

    async fn apply(
        &self,
        workload: &Workload,
        mutation: &Mutation,
    ) -> Result<ApplyOutcome, ApplyError> {
        if matches!(mutation, Mutation::RestartAt(_)) {
            return Err(ApplyError::Unsupported(format!(
                "{} has no restart field",
                self.resource.kind
            )));
        }

        let api = self.api(&workload.namespace);
        let Some(mut obj) = api.get_opt(&workload.name).await? else {
            return Err(ApplyError::Gone);
        };

        let Some(mut template) = extract_template(&obj.data) else {
            return Err(ApplyError::Unsupported(format!(
                "{} {} has no pod template at spec.template",
                self.resource.kind, workload.name
            )));
        };

        if !apply_to_template(&mut template, mutation) {
            debug!("{} already carries the reload stamp", workload.key());
            return Ok(ApplyOutcome::Unchanged);
        }
        store_template(&mut obj.data, &template)
            .map_err(|e| ApplyError::Unsupported(e.to_string()))?;
        api.replace(&workload.name, &PostParams::default(), &obj).await?;
        Ok(ApplyOutcome::Mutated)
    }

    fn object_reference(&self, workload: &Workload) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.resource.api_version.clone()),
            kind: Some(self.resource.kind.clone()),
            namespace: Some(workload.namespace.clone()),
            name: Some(workload.name.clone()),
            ..Default::default()
        }
    }
}
