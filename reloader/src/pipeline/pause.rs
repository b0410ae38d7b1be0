//! Pause bookkeeping: workloads paused after a reload and when to
//! resume them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::interval;

use crate::annotations;
use crate::errors::ErrorClass;
use crate::workload::{PauseState, Workload, WorkloadAdapter, WorkloadKind};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Retry distance after a failed resume.
const RESUME_RETRY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PauseKey {
    kind: WorkloadKind,
    namespace: String,
    name: String,
}

/// Unpause timer index, one mutex around the whole table.
#[derive(Default)]
pub struct PauseIndex {
    inner: Mutex<HashMap<PauseKey, DateTime<Utc>>>,
}

impl PauseIndex {
    /// Register (or reset) the resume time for a paused workload. A new
    /// reload landing on a paused workload pushes its window out.
    pub fn schedule(&self, kind: WorkloadKind, namespace: &str, name: &str, until: DateTime<Utc>) {
        let key = PauseKey {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.inner.lock().unwrap().insert(key, until);
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<PauseKey> {
        let mut inner = self.inner.lock().unwrap();
        let due: Vec<PauseKey> = inner
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            inner.remove(key);
        }
        due
    }

    /// Periodic sweep resuming workloads whose pause window elapsed.
    pub async fn run_sweeper(
        self: Arc<Self>,
        adapters: Vec<Arc<dyn WorkloadAdapter>>,
        mut running: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(&adapters).await,
                _ = running.changed() => {
                    if !*running.borrow() {
                        info!("Stopping the pause sweeper");
                        return;
                    }
                }
            }
        }
    }

    async fn sweep(&self, adapters: &[Arc<dyn WorkloadAdapter>]) {
        for key in self.due(Utc::now()) {
            let Some(adapter) = adapters.iter().find(|a| a.kind() == key.kind) else {
                continue;
            };
            match adapter
                .set_paused(&key.namespace, &key.name, PauseState::Resumed)
                .await
            {
                Ok(()) => info!("Resumed {}/{}/{}", key.kind, key.namespace, key.name),
                Err(e) if e.class() == ErrorClass::NotFound => {
                    debug!("{}/{}/{} is gone, nothing to resume", key.kind, key.namespace, key.name);
                }
                Err(e) => {
                    warn!(
                        "Failed to resume {}/{}/{}: {e}; retrying",
                        key.kind, key.namespace, key.name
                    );
                    let retry = chrono::Duration::from_std(RESUME_RETRY)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    self.schedule(key.kind, &key.namespace, &key.name, Utc::now() + retry);
                }
            }
        }
    }

    /// Rebuild the index after a controller restart by scanning for
    /// workloads still carrying the paused-at stamp.
    pub async fn rebuild(&self, adapters: &[Arc<dyn WorkloadAdapter>], namespaces: &[String]) {
        for adapter in adapters.iter().filter(|a| a.supports_pause()) {
            for namespace in namespaces {
                let workloads = match adapter.list(namespace).await {
                    Ok(workloads) => workloads,
                    Err(e) => {
                        warn!("Failed to scan {}s in {namespace}: {e}", adapter.kind_name());
                        continue;
                    }
                };
                for workload in workloads {
                    if let Some(until) = resume_time(&workload) {
                        self.schedule(workload.kind, &workload.namespace, &workload.name, until);
                    }
                }
            }
        }

        let recovered = self.inner.lock().unwrap().len();
        if recovered > 0 {
            info!("Recovered {recovered} paused workloads");
        }
    }
}

/// When a workload carrying the paused-at stamp should resume: the stamp
/// plus its pause-period, or immediately if that moment has passed or
/// the stamp is unreadable.
fn resume_time(workload: &Workload) -> Option<DateTime<Utc>> {
    let paused_at = workload.annotations.get(annotations::PAUSED_AT)?;
    let period = workload.contract().pause_period.unwrap_or(Duration::ZERO);

    match DateTime::parse_from_rfc3339(paused_at) {
        Ok(at) => {
            let delta =
                chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero());
            Some(at.with_timezone(&Utc) + delta)
        }
        Err(e) => {
            warn!("Invalid paused-at stamp on {}: {e}", workload.key());
            Some(Utc::now())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    fn paused_workload(paused_at: &str, period: Option<&str>) -> Workload {
        let mut annotations: std::collections::BTreeMap<String, String> =
            [(annotations::PAUSED_AT.to_string(), paused_at.to_string())]
                .into_iter()
                .collect();
        if let Some(period) = period {
            annotations.insert(annotations::PAUSE_PERIOD.to_string(), period.to_string());
        }
        Workload {
            kind: WorkloadKind::Deployment,
            namespace: "default".into(),
            name: "app".into(),
            annotations,
            template: PodTemplateSpec::default(),
        }
    }

    #[test]
    fn due_entries_are_drained_once() {
        let index = PauseIndex::default();
        let now = Utc::now();
        index.schedule(WorkloadKind::Deployment, "default", "app", now - chrono::Duration::seconds(1));
        index.schedule(WorkloadKind::Deployment, "default", "later", now + chrono::Duration::seconds(60));

        let due = index.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "app");
        assert!(index.due(now).is_empty());
        assert_eq!(index.inner.lock().unwrap().len(), 1);
    }

    #[test]
    fn rescheduling_resets_the_window() {
        let index = PauseIndex::default();
        let now = Utc::now();
        index.schedule(WorkloadKind::Deployment, "default", "app", now - chrono::Duration::seconds(1));
        index.schedule(WorkloadKind::Deployment, "default", "app", now + chrono::Duration::seconds(60));
        assert!(index.due(now).is_empty());
    }

    #[test]
    fn resume_time_is_stamp_plus_period() {
        let workload = paused_workload("2026-08-01T12:00:00Z", Some("10s"));
        let until = resume_time(&workload).unwrap();
        assert_eq!(until.to_rfc3339(), "2026-08-01T12:00:10+00:00");
    }

    #[test]
    fn unreadable_stamp_resumes_immediately() {
        let workload = paused_workload("not-a-timestamp", Some("10s"));
        let until = resume_time(&workload).unwrap();
        assert!(until <= Utc::now());
    }

    #[test]
    fn unpaused_workloads_have_no_resume_time() {
        let mut workload = paused_workload("2026-08-01T12:00:00Z", None);
        workload.annotations.remove(annotations::PAUSED_AT);
        assert!(resume_time(&workload).is_none());
    }
}
