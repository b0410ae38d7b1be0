//! Polymorphic access to the workload kinds the controller can restart.
//!
//! Every kind exposes the same operations (list, snapshot, mutate,
//! pause) behind `WorkloadAdapter`; the per-kind mutation idioms live in
//! the kind modules. Kinds whose reload is a plain pod-template write are
//! driven through `TemplatedWorkload` + `TypedAdapter`; Job (immutable,
//! delete-and-recreate) and the dynamic catch-all get their own adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, ObjectReference, PodTemplateSpec};
use kube::api::{ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::annotations;
use crate::config::ReloaderConfig;
use crate::errors::ApplyError;

pub mod apps;
pub mod batch;
pub mod generic;
pub mod openshift;
pub mod rollout;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    CronJob,
    Job,
    DeploymentConfig,
    Rollout,
    Generic,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::DaemonSet => "daemonset",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::CronJob => "cronjob",
            WorkloadKind::Job => "job",
            WorkloadKind::DeploymentConfig => "deploymentconfig",
            WorkloadKind::Rollout => "rollout",
            WorkloadKind::Generic => "workload",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time view of a workload, produced by `WorkloadAdapter::list`.
///
/// Snapshots drive matching only; the adapter re-reads the object before
/// every write.
#[derive(Debug, Clone)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    /// Workload-level annotations.
    pub annotations: BTreeMap<String, String>,
    pub template: PodTemplateSpec,
}

impl Workload {
    /// Canonical key: `kind/namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }

    /// Reload policy from the union of workload-level and pod-template
    /// annotations, workload-level winning ties.
    pub fn contract(&self) -> annotations::MatchContract {
        let empty = BTreeMap::new();
        let template = self
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.annotations.as_ref())
            .unwrap_or(&empty);
        annotations::MatchContract::from_annotations(&self.annotations, template)
    }

    pub fn references(&self) -> crate::refs::ReferenceSet {
        crate::refs::references(&self.template)
    }
}

/// The concrete change a reload decision turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Write an annotation on the pod-template metadata.
    TemplateAnnotation { key: String, value: String },
    /// Ensure the given env vars on every main container.
    ContainerEnv { vars: Vec<(String, String)> },
    /// Write `spec.restartAt` (Argo Rollout only); the template is left
    /// untouched.
    RestartAt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Mutated,
    /// The object already carried the mutation; no write was issued.
    Unchanged,
}

/// Pause request for kinds that support `spec.paused`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseState {
    /// Pause and stamp the pause time (RFC3339).
    Paused { at: String },
    /// Resume and drop the stamp.
    Resumed,
}

#[async_trait]
pub trait WorkloadAdapter: Send + Sync {
    fn kind(&self) -> WorkloadKind;

    /// API kind name, e.g. `Deployment`.
    fn kind_name(&self) -> String;

    async fn list(&self, namespace: &str) -> Result<Vec<Workload>, kube::Error>;

    /// Read-modify-write under optimistic concurrency: the object is
    /// re-read immediately before the write and replaced with its own
    /// resourceVersion, so a concurrent writer surfaces as a conflict.
    async fn apply(&self, workload: &Workload, mutation: &Mutation)
        -> Result<ApplyOutcome, ApplyError>;

    async fn set_paused(
        &self,
        _namespace: &str,
        _name: &str,
        _state: PauseState,
    ) -> Result<(), ApplyError> {
        Err(ApplyError::Unsupported(format!(
            "{} does not support pausing",
            self.kind_name()
        )))
    }

    fn supports_env_strategy(&self) -> bool {
        true
    }

    fn supports_pause(&self) -> bool {
        false
    }

    fn object_reference(&self, workload: &Workload) -> ObjectReference;
}

/// Apply a template-level mutation, reporting whether anything changed.
pub(crate) fn apply_to_template(template: &mut PodTemplateSpec, mutation: &Mutation) -> bool {
    match mutation {
        Mutation::TemplateAnnotation { key, value } => {
            let metadata = template.metadata.get_or_insert_with(Default::default);
            let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
            if annotations.get(key) == Some(value) {
                return false;
            }
            annotations.insert(key.clone(), value.clone());
            true
        }
        Mutation::ContainerEnv { vars } => {
            let Some(spec) = template.spec.as_mut() else {
                return false;
            };
            let mut changed = false;
            for container in spec.containers.iter_mut() {
                let env = container.env.get_or_insert_with(Vec::new);
                for (name, value) in vars {
                    match env.iter_mut().find(|e| &e.name == name) {
                        Some(var) if var.value.as_deref() == Some(value) => {}
                        Some(var) => {
                            var.value = Some(value.clone());
                            var.value_from = None;
                            changed = true;
                        }
                        None => {
                            env.push(EnvVar {
                                name: name.clone(),
                                value: Some(value.clone()),
                                value_from: None,
                            });
                            changed = true;
                        }
                    }
                }
            }
            changed
        }
        // Object-level field, not a template write
        Mutation::RestartAt(_) => false,
    }
}

/// Kinds whose reload is a pod-template write on a typed resource.
pub(crate) trait TemplatedWorkload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;
    const ENV_STRATEGY: bool = true;
    const PAUSABLE: bool = false;

    fn template(&self) -> Option<&PodTemplateSpec>;
    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec>;

    /// Argo-style restart field; only the Rollout implements it.
    fn set_restart_at(&mut self, _at: &str) -> bool {
        false
    }

    /// `spec.paused`; only Deployment and DeploymentConfig implement it.
    fn set_paused(&mut self, _paused: bool) -> bool {
        false
    }
}

pub(crate) fn snapshot<K: TemplatedWorkload>(obj: &K) -> Option<Workload> {
    let meta = obj.meta();
    Some(Workload {
        kind: K::KIND,
        namespace: meta.namespace.clone()?,
        name: meta.name.clone()?,
        annotations: meta.annotations.clone().unwrap_or_default(),
        template: obj.template()?.clone(),
    })
}

pub(crate) struct TypedAdapter<K> {
    client: Client,
    _kind: PhantomData<K>,
}

impl<K> TypedAdapter<K> {
    pub(crate) fn new(client: Client) -> Self {
        TypedAdapter {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: TemplatedWorkload> WorkloadAdapter for TypedAdapter<K> {
    fn kind(&self) -> WorkloadKind {
        K::KIND
    }

    fn kind_name(&self) -> String {
        K::kind(&()).into_owned()
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Workload>, kube::Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().filter_map(snapshot).collect())
    }

    async fn apply(
        &self,
        workload: &Workload,
        mutation: &Mutation,
    ) -> Result<ApplyOutcome, ApplyError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &workload.namespace);
        let Some(mut obj) = api.get_opt(&workload.name).await? else {
            return Err(ApplyError::Gone);
        };

        let changed = match mutation {
            Mutation::RestartAt(at) => {
                if !obj.set_restart_at(at) {
                    return Err(ApplyError::Unsupported(format!(
                        "{} has no restart field",
                        self.kind_name()
                    )));
                }
                true
            }
            Mutation::ContainerEnv { .. } if !K::ENV_STRATEGY => {
                return Err(ApplyError::Unsupported(format!(
                    "the env-vars strategy cannot reload a {}",
                    self.kind_name()
                )));
            }
            mutation => {
                let Some(template) = obj.template_mut() else {
                    return Err(ApplyError::Unsupported(format!(
                        "{} {} has no pod template",
                        self.kind_name(),
                        workload.name
                    )));
                };
                apply_to_template(template, mutation)
            }
        };

        if !changed {
            debug!("{} already carries the reload stamp", workload.key());
            return Ok(ApplyOutcome::Unchanged);
        }
        api.replace(&workload.name, &PostParams::default(), &obj).await?;
        Ok(ApplyOutcome::Mutated)
    }

    async fn set_paused(
        &self,
        namespace: &str,
        name: &str,
        state: PauseState,
    ) -> Result<(), ApplyError> {
        if !K::PAUSABLE {
            return Err(ApplyError::Unsupported(format!(
                "{} does not support pausing",
                self.kind_name()
            )));
        }
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let Some(mut obj) = api.get_opt(name).await? else {
            return Err(ApplyError::Gone);
        };

        match &state {
            PauseState::Paused { at } => {
                obj.set_paused(true);
                obj.meta_mut()
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(annotations::PAUSED_AT.to_string(), at.clone());
            }
            PauseState::Resumed => {
                obj.set_paused(false);
                if let Some(anns) = obj.meta_mut().annotations.as_mut() {
                    anns.remove(annotations::PAUSED_AT);
                }
            }
        }
        api.replace(name, &PostParams::default(), &obj).await?;
        Ok(())
    }

    fn supports_env_strategy(&self) -> bool {
        K::ENV_STRATEGY
    }

    fn supports_pause(&self) -> bool {
        K::PAUSABLE
    }

    fn object_reference(&self, workload: &Workload) -> ObjectReference {
        ObjectReference {
            api_version: Some(K::api_version(&()).into_owned()),
            kind: Some(K::kind(&()).into_owned()),
            namespace: Some(workload.namespace.clone()),
            name: Some(workload.name.clone()),
            ..Default::default()
        }
    }
}

/// Assemble the adapter set for the current configuration.
pub fn build_adapters(
    config: &ReloaderConfig,
    client: &Client,
) -> anyhow::Result<Vec<Arc<dyn WorkloadAdapter>>> {
    let mut adapters: Vec<Arc<dyn WorkloadAdapter>> = vec![
        Arc::new(TypedAdapter::<k8s_openapi::api::apps::v1::Deployment>::new(client.clone())),
        Arc::new(TypedAdapter::<k8s_openapi::api::apps::v1::DaemonSet>::new(client.clone())),
        Arc::new(TypedAdapter::<k8s_openapi::api::apps::v1::StatefulSet>::new(client.clone())),
    ];

    if !config.ignore_cronjobs() {
        adapters.push(Arc::new(TypedAdapter::<k8s_openapi::api::batch::v1::CronJob>::new(
            client.clone(),
        )));
    }
    if !config.ignore_jobs() {
        adapters.push(Arc::new(batch::JobAdapter::new(client.clone())));
    }
    if config.is_openshift() {
        adapters.push(Arc::new(TypedAdapter::<reloader_crds::DeploymentConfig>::new(
            client.clone(),
        )));
    }
    if config.is_argo_rollouts() {
        adapters.push(Arc::new(TypedAdapter::<reloader_crds::Rollout>::new(client.clone())));
    }
    for spec in config.extra_workload_kinds() {
        adapters.push(Arc::new(generic::GenericAdapter::from_gvk_spec(
            client.clone(),
            spec,
        )?));
    }

    Ok(adapters)
}
