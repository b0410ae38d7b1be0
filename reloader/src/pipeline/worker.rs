//! Workers draining the queue: re-read, match, mutate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use kube::Client;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::ReloaderConfig;
use crate::errors::{classify, ErrorClass};
use crate::events::EventPublisher;
use crate::fingerprint::Fingerprint;
use crate::matcher::{self, Match};
use crate::metrics::Metrics;
use crate::source::{self, ConfigObject};
use crate::strategy;
use crate::workload::{ApplyOutcome, PauseState, Workload, WorkloadAdapter};

use super::cache::{ObjectCache, ObjectKey};
use super::pause::PauseIndex;
use super::queue::{Completion, EventReason, WorkQueue};

/// Deadline for a single API call.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for one full decision batch.
const BATCH_DEADLINE: Duration = Duration::from_secs(300);

pub struct Processor {
    client: Client,
    config: Arc<ReloaderConfig>,
    adapters: Vec<Arc<dyn WorkloadAdapter>>,
    cache: Arc<ObjectCache>,
    pause: Arc<PauseIndex>,
    events: EventPublisher,
    metrics: Arc<Metrics>,
    /// Last source version applied per workload; makes retried decisions
    /// idempotent.
    last_applied: Mutex<HashMap<String, (ObjectKey, Fingerprint)>>,
}

pub async fn run_worker(
    index: usize,
    queue: Arc<WorkQueue>,
    processor: Arc<Processor>,
    mut running: watch::Receiver<bool>,
) {
    debug!("Worker {index} started");
    loop {
        tokio::select! {
            item = queue.next() => {
                let (key, reason) = item;
                debug!("Worker {index} processing {key} ({})", reason.as_str());
                let completion = match timeout(BATCH_DEADLINE, processor.process(&key, reason)).await {
                    Ok(Ok(())) => Completion::Success,
                    Ok(Err(class)) => Completion::Retry(class),
                    Err(_) => {
                        warn!("Processing {key} exceeded the batch deadline");
                        processor.metrics.error(ErrorClass::Transient);
                        Completion::Retry(ErrorClass::Transient)
                    }
                };
                queue.complete(&key, completion);
            }
            _ = running.changed() => {
                if !*running.borrow() {
                    debug!("Stopping worker {index}");
                    break;
                }
            }
        }
    }
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        config: Arc<ReloaderConfig>,
        adapters: Vec<Arc<dyn WorkloadAdapter>>,
        cache: Arc<ObjectCache>,
        pause: Arc<PauseIndex>,
        events: EventPublisher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Processor {
            client,
            config,
            adapters,
            cache,
            pause,
            events,
            metrics,
            last_applied: Mutex::new(HashMap::new()),
        }
    }

    /// One worker iteration for one key.
    async fn process(&self, key: &ObjectKey, reason: EventReason) -> Result<(), ErrorClass> {
        // Never trust the cached snapshot for mutation decisions
        let fetched = match timeout(
            CALL_TIMEOUT,
            source::fetch(&self.client, key.kind, &key.namespace, &key.name),
        )
        .await
        {
            Err(_) => {
                warn!("Timed out re-reading {key}");
                self.metrics.error(ErrorClass::Transient);
                return Err(ErrorClass::Transient);
            }
            Ok(Err(e)) => {
                let class = classify(&e);
                warn!("Failed to re-read {key}: {e}");
                self.metrics.error(class);
                return Err(class);
            }
            Ok(Ok(fetched)) => fetched,
        };

        let source_obj = match fetched {
            Some(obj) => obj,
            // NotFound on the source behaves as a delete
            None => {
                if !self.config.reload_on_delete() {
                    self.cache.purge(key);
                    debug!("{key} is gone; deletes do not trigger reloads");
                    return Ok(());
                }
                let contract = self
                    .cache
                    .tombstone(key)
                    .map(|t| t.contract)
                    .unwrap_or_default();
                ConfigObject {
                    kind: key.kind,
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                    contract,
                    fingerprint: None,
                }
            }
        };
        let deleted = source_obj.fingerprint.is_none();

        if source_obj.contract.ignore {
            debug!("{key} carries ignore=true, skipping ({})", reason.as_str());
            if deleted {
                self.cache.purge(key);
            }
            return Ok(());
        }

        let candidates = self.list_candidates(&key.namespace).await?;

        let auto_reload_all = self.config.auto_reload_all();
        let mut retry: Option<ErrorClass> = None;
        for (adapter, workload) in candidates {
            let Some(matched) = matcher::evaluate(&source_obj, &workload, auto_reload_all) else {
                continue;
            };
            if let Err(class) = self
                .execute(adapter.as_ref(), &workload, &matched, &source_obj)
                .await
            {
                retry = Some(merge_class(retry, class));
            }
        }

        match retry {
            Some(class) => Err(class),
            None => {
                if deleted {
                    self.cache.purge(key);
                }
                Ok(())
            }
        }
    }

    /// Candidate workloads live in the changed object's namespace: a pod
    /// cannot consume configuration from another namespace.
    async fn list_candidates(
        &self,
        namespace: &str,
    ) -> Result<Vec<(Arc<dyn WorkloadAdapter>, Workload)>, ErrorClass> {
        let mut candidates = Vec::new();
        for adapter in &self.adapters {
            match timeout(CALL_TIMEOUT, adapter.list(namespace)).await {
                Err(_) => {
                    warn!("Timed out listing {}s in {namespace}", adapter.kind_name());
                    self.metrics.error(ErrorClass::Transient);
                    return Err(ErrorClass::Transient);
                }
                Ok(Err(e)) if classify(&e) == ErrorClass::NotFound => {
                    // The API group is not installed on this cluster
                    debug!("{} API unavailable in {namespace}: {e}", adapter.kind_name());
                }
                Ok(Err(e)) => {
                    let class = classify(&e);
                    warn!("Failed to list {}s in {namespace}: {e}", adapter.kind_name());
                    self.metrics.error(class);
                    return Err(class);
                }
                Ok(Ok(workloads)) => candidates
                    .extend(workloads.into_iter().map(|w| (Arc::clone(adapter), w))),
            }
        }
        Ok(candidates)
    }

    /// Build and apply the mutation for one decision.
    async fn execute(
        &self,
        adapter: &dyn WorkloadAdapter,
        workload: &Workload,
        matched: &Match,
        source: &ConfigObject,
    ) -> Result<(), ErrorClass> {
        let fingerprint = source
            .fingerprint
            .unwrap_or_else(|| Fingerprint::of_pairs(std::iter::empty::<(&str, &[u8])>()));
        let applied = (
            ObjectKey::new(source.kind, &source.namespace, &source.name),
            fingerprint,
        );
        if self.last_applied.lock().unwrap().get(&workload.key()) == Some(&applied) {
            debug!(
                "{} already reloaded for this version of {}",
                workload.key(),
                source.qualified_name()
            );
            return Ok(());
        }

        let mutation = match strategy::build_mutation(
            self.config.reload_strategy(),
            workload,
            matched,
            source,
            |kind, name| self.cache.lookup_fingerprint(kind, &source.namespace, name),
            Utc::now(),
        ) {
            Ok(mutation) => mutation,
            Err(e) => {
                warn!("Skipping {}: {e}", workload.key());
                self.metrics.reload_skipped(workload.kind);
                return Ok(());
            }
        };

        let result = match timeout(CALL_TIMEOUT, adapter.apply(workload, &mutation)).await {
            Err(_) => {
                warn!("Timed out reloading {}", workload.key());
                self.metrics.error(ErrorClass::Transient);
                return Err(ErrorClass::Transient);
            }
            Ok(result) => result,
        };

        match result {
            Ok(outcome) => {
                self.last_applied
                    .lock()
                    .unwrap()
                    .insert(workload.key(), applied);
                if outcome == ApplyOutcome::Mutated {
                    info!(
                        "Reloaded {} after a change to {} ({} match)",
                        workload.key(),
                        source.qualified_name(),
                        matched.channel.as_str()
                    );
                    self.metrics.reloaded(workload.kind);
                    self.events
                        .config_changed(adapter, workload, source, matched.channel)
                        .await;
                    self.maybe_pause(adapter, workload, matched).await;
                }
                Ok(())
            }
            Err(err) => {
                let class = err.class();
                match class {
                    // The workload vanished mid-flight; nothing to reload
                    ErrorClass::NotFound => {
                        debug!("{} is gone, dropping the reload", workload.key());
                        Ok(())
                    }
                    ErrorClass::Permanent => {
                        warn!("Failed to reload {}: {err}", workload.key());
                        self.metrics.reload_failed(workload.kind);
                        self.metrics.error(class);
                        self.events
                            .reload_failed(adapter, workload, source, &err.to_string())
                            .await;
                        Ok(())
                    }
                    ErrorClass::Forbidden => {
                        warn!("Not allowed to reload {}: {err}", workload.key());
                        self.metrics.reload_failed(workload.kind);
                        self.metrics.error(class);
                        self.events
                            .reload_failed(adapter, workload, source, &err.to_string())
                            .await;
                        Err(class)
                    }
                    ErrorClass::Conflict | ErrorClass::Transient => {
                        warn!("Reload of {} failed, will retry: {err}", workload.key());
                        self.metrics.error(class);
                        Err(class)
                    }
                }
            }
        }
    }

    async fn maybe_pause(&self, adapter: &dyn WorkloadAdapter, workload: &Workload, matched: &Match) {
        let Some(period) = matched.contract.pause_period else {
            return;
        };
        if !adapter.supports_pause() {
            return;
        }

        let now = Utc::now();
        let at = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        match timeout(
            CALL_TIMEOUT,
            adapter.set_paused(&workload.namespace, &workload.name, PauseState::Paused { at }),
        )
        .await
        {
            Ok(Ok(())) => {
                if let Ok(delta) = chrono::Duration::from_std(period) {
                    info!("Paused {} for {}", workload.key(), humantime::format_duration(period));
                    self.pause
                        .schedule(workload.kind, &workload.namespace, &workload.name, now + delta);
                }
            }
            Ok(Err(e)) => warn!("Failed to pause {}: {e}", workload.key()),
            Err(_) => warn!("Timed out pausing {}", workload.key()),
        }
    }
}

fn merge_class(current: Option<ErrorClass>, new: ErrorClass) -> ErrorClass {
    // Prefer the class that retries soonest; a transient hiccup on one
    // workload should not stretch the whole key to the forbidden cadence.
    fn rank(class: ErrorClass) -> u8 {
        match class {
            ErrorClass::Transient => 0,
            ErrorClass::Conflict => 1,
            ErrorClass::Forbidden => 2,
            ErrorClass::NotFound => 3,
            ErrorClass::Permanent => 4,
        }
    }
    match current {
        None => new,
        Some(current) if rank(new) < rank(current) => new,
        Some(current) => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_class_prefers_the_soonest_retry() {
        assert_eq!(merge_class(None, ErrorClass::Forbidden), ErrorClass::Forbidden);
        assert_eq!(
            merge_class(Some(ErrorClass::Forbidden), ErrorClass::Transient),
            ErrorClass::Transient
        );
        assert_eq!(
            merge_class(Some(ErrorClass::Transient), ErrorClass::Conflict),
            ErrorClass::Transient
        );
        assert_eq!(
            merge_class(Some(ErrorClass::Conflict), ErrorClass::Permanent),
            ErrorClass::Conflict
        );
    }
}
