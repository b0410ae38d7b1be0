//! The batch/v1 kinds.
//!
//! A CronJob is reloaded by stamping `spec.jobTemplate.spec.template`, so
//! the next scheduled Job picks the new configuration up. A Job is
//! immutable once created; the adapter deletes it and recreates an
//! identical spec carrying the stamp, which yields a new UID.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ObjectReference, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use log::debug;

use crate::errors::{classify, ApplyError, ErrorClass};

use super::{
    apply_to_template, Mutation, ApplyOutcome, TemplatedWorkload, Workload, WorkloadAdapter,
    WorkloadKind,
};

/// Labels the Job controller stamps on its objects; a recreated Job must
/// not carry them or the server rejects the spec.
const CONTROLLER_LABELS: [&str; 4] = [
    "controller-uid",
    "job-name",
    "batch.kubernetes.io/controller-uid",
    "batch.kubernetes.io/job-name",
];

const CREATE_RETRIES: u32 = 10;
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(500);

impl TemplatedWorkload for CronJob {
    const KIND: WorkloadKind = WorkloadKind::CronJob;
    const ENV_STRATEGY: bool = false;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .map(|js| &js.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec
            .as_mut()
            .and_then(|s| s.job_template.spec.as_mut())
            .map(|js| &mut js.template)
    }
}

pub(crate) struct JobAdapter {
    client: Client,
}

impl JobAdapter {
    pub(crate) fn new(client: Client) -> Self {
        JobAdapter { client }
    }
}

#[async_trait]
impl WorkloadAdapter for JobAdapter {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Job
    }

    fn kind_name(&self) -> String {
        "Job".to_string()
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Workload>, kube::Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let jobs = api.list(&ListParams::default()).await?;
        Ok(jobs
            .items
            .into_iter()
            .filter_map(|job| {
                Some(Workload {
                    kind: WorkloadKind::Job,
                    namespace: job.metadata.namespace.clone()?,
                    name: job.metadata.name.clone()?,
                    annotations: job.metadata.annotations.clone().unwrap_or_default(),
                    template: job.spec.as_ref()?.template.clone(),
                })
            })
            .collect())
    }

    async fn apply(
        &self,
        workload: &Workload,
        mutation: &Mutation,
    ) -> Result<ApplyOutcome, ApplyError> {
        if !matches!(mutation, Mutation::TemplateAnnotation { .. }) {
            return Err(ApplyError::Unsupported(
                "a Job can only be reloaded through the annotation strategy".to_string(),
            ));
        }

        let api: Api<Job> = Api::namespaced(self.client.clone(), &workload.namespace);
        let Some(job) = api.get_opt(&workload.name).await? else {
            return Err(ApplyError::Gone);
        };

        let replacement = recreate_job(&job, mutation);
        api.delete(&workload.name, &DeleteParams::background()).await?;
        debug!("Deleted job {}, recreating with the reload stamp", workload.key());

        // The old object lingers briefly while the garbage collector works
        // through its dependents; retry the name clash away.
        let mut attempt = 0;
        loop {
            match api.create(&PostParams::default(), &replacement).await {
                Ok(_) => return Ok(ApplyOutcome::Mutated),
                Err(e) if classify(&e) == ErrorClass::Conflict && attempt < CREATE_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(CREATE_RETRY_DELAY).await;
                }
                Err(e) => return Err(ApplyError::Api(e)),
            }
        }
    }

    fn supports_env_strategy(&self) -> bool {
        false
    }

    fn object_reference(&self, workload: &Workload) -> ObjectReference {
        ObjectReference {
            api_version: Some("batch/v1".to_string()),
            kind: Some("Job".to_string()),
            namespace: Some(workload.namespace.clone()),
            name: Some(workload.name.clone()),
            ..Default::default()
        }
    }
}

/// Build the replacement for an existing Job: same spec, server-owned
/// fields dropped, controller labels stripped, stamp applied.
pub(crate) fn recreate_job(job: &Job, mutation: &Mutation) -> Job {
    let mut replacement = Job {
        metadata: ObjectMeta {
            name: job.metadata.name.clone(),
            namespace: job.metadata.namespace.clone(),
            labels: strip_controller_labels(job.metadata.labels.as_ref()),
            annotations: job.metadata.annotations.clone(),
            owner_references: job.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: job.spec.clone(),
        status: None,
    };

    if let Some(spec) = replacement.spec.as_mut() {
        spec.selector = None;
        if let Some(meta) = spec.template.metadata.as_mut() {
            meta.labels = strip_controller_labels(meta.labels.as_ref());
        }
        apply_to_template(&mut spec.template, mutation);
    }

    replacement
}

fn strip_controller_labels(
    labels: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut labels = labels?.clone();
    for key in CONTROLLER_LABELS {
        labels.remove(key);
    }
    (!labels.is_empty()).then_some(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations;
    use k8s_openapi::api::batch::v1::JobSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn job() -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("one-shot".into()),
                namespace: Some("default".into()),
                uid: Some("11111111-2222".into()),
                resource_version: Some("42".into()),
                labels: Some(
                    [
                        ("app".to_string(), "one-shot".to_string()),
                        ("controller-uid".to_string(), "11111111-2222".to_string()),
                        ("batch.kubernetes.io/job-name".to_string(), "one-shot".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            spec: Some(JobSpec {
                selector: Some(Default::default()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(
                            [
                                ("app".to_string(), "one-shot".to_string()),
                                ("job-name".to_string(), "one-shot".to_string()),
                            ]
                            .into_iter()
                            .collect(),
                        ),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "task".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: Some(Default::default()),
        }
    }

    fn stamp() -> Mutation {
        Mutation::TemplateAnnotation {
            key: annotations::LAST_RELOADED_FROM.into(),
            value: "secret/s".into(),
        }
    }

    #[test]
    fn recreated_job_drops_server_owned_state() {
        let replacement = recreate_job(&job(), &stamp());

        assert_eq!(replacement.metadata.name.as_deref(), Some("one-shot"));
        assert_eq!(replacement.metadata.uid, None);
        assert_eq!(replacement.metadata.resource_version, None);
        assert!(replacement.status.is_none());
        assert!(replacement.spec.as_ref().unwrap().selector.is_none());
    }

    #[test]
    fn recreated_job_strips_controller_labels() {
        let replacement = recreate_job(&job(), &stamp());

        let labels = replacement.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.len(), 1);
        assert!(labels.contains_key("app"));

        let template_labels = replacement
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert!(!template_labels.contains_key("job-name"));
        assert!(template_labels.contains_key("app"));
    }

    #[test]
    fn recreated_job_carries_the_stamp() {
        let replacement = recreate_job(&job(), &stamp());
        let anns = replacement
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap();
        assert_eq!(
            anns.get(annotations::LAST_RELOADED_FROM).map(String::as_str),
            Some("secret/s")
        );
    }

    #[test]
    fn cronjob_template_path_is_the_job_template() {
        use k8s_openapi::api::batch::v1::{CronJobSpec, JobTemplateSpec};

        let mut cronjob = CronJob {
            spec: Some(CronJobSpec {
                schedule: "0 0 * * *".into(),
                job_template: JobTemplateSpec {
                    metadata: None,
                    spec: Some(JobSpec {
                        template: PodTemplateSpec::default(),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(cronjob.template().is_some());
        let template = cronjob.template_mut().unwrap();
        apply_to_template(
            template,
            &Mutation::TemplateAnnotation {
                key: annotations::LAST_RELOADED_FROM.into(),
                value: "configmap/cj".into(),
            },
        );

        let stamped = cronjob
            .spec
            .unwrap()
            .job_template
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert!(stamped.contains_key(annotations::LAST_RELOADED_FROM));
    }

    #[test]
    fn cronjob_refuses_env_strategy() {
        assert!(!CronJob::ENV_STRATEGY);
    }
}
