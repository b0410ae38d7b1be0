//! Watchers feeding the work queue.
//!
//! One watch stream runs per (enabled kind × namespace scope). Observed
//! versions go through the fingerprint cache; only semantic changes (and,
//! when enabled, creations and deletions) become queue items.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::ListParams;
use kube::core::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use log::{info, warn};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use reloader_crds::SecretProviderClassPodStatus;

use crate::annotations::ResourceContract;
use crate::config::ReloaderConfig;
use crate::fingerprint::Fingerprint;
use crate::source::{self, ConfigKind};

use super::cache::{ObjectCache, ObjectKey, Observation};
use super::queue::{EventReason, WorkQueue};

/// The set of namespaces the controller watches.
#[derive(Debug, Clone)]
pub enum WatchScope {
    /// Every namespace except the ignore list.
    Cluster { ignore: BTreeSet<String> },
    /// A fixed list, resolved at startup.
    Namespaces(Vec<String>),
}

impl WatchScope {
    pub async fn resolve(config: &ReloaderConfig, client: &Client) -> anyhow::Result<Self> {
        if !config.watch_globally() {
            return Ok(WatchScope::Namespaces(vec![installation_namespace()]));
        }

        if let Some(selector) = config.namespace_selector() {
            let ignore = config.ignore_namespaces();
            let api: Api<Namespace> = Api::all(client.clone());
            let namespaces: Vec<String> = api
                .list(&ListParams::default().labels(selector))
                .await
                .with_context(|| format!("Failed to list namespaces matching {selector:?}"))?
                .items
                .into_iter()
                .filter_map(|ns| ns.metadata.name)
                .filter(|name| !ignore.contains(name))
                .collect();
            if namespaces.is_empty() {
                warn!("Namespace selector {selector:?} matches no namespaces");
            }
            return Ok(WatchScope::Namespaces(namespaces));
        }

        Ok(WatchScope::Cluster {
            ignore: config.ignore_namespaces(),
        })
    }

    pub fn includes(&self, namespace: &str) -> bool {
        match self {
            WatchScope::Cluster { ignore } => !ignore.contains(namespace),
            WatchScope::Namespaces(list) => list.iter().any(|ns| ns == namespace),
        }
    }

    /// Concrete namespace list, for startup scans that cannot use a
    /// cluster-wide watch.
    pub async fn expand(&self, client: &Client) -> anyhow::Result<Vec<String>> {
        match self {
            WatchScope::Namespaces(list) => Ok(list.clone()),
            WatchScope::Cluster { ignore } => {
                let api: Api<Namespace> = Api::all(client.clone());
                Ok(api
                    .list(&ListParams::default())
                    .await
                    .context("Failed to list namespaces")?
                    .items
                    .into_iter()
                    .filter_map(|ns| ns.metadata.name)
                    .filter(|name| !ignore.contains(name))
                    .collect())
            }
        }
    }
}

fn installation_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string())
}

/// A configuration kind the pipeline can watch.
pub(crate) trait WatchedKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    const KIND: ConfigKind;
    /// Whether the resource label selector applies to this watcher.
    const LABEL_FILTERED: bool = true;

    fn fingerprint(&self) -> Fingerprint;

    /// Name carried by the queue key; differs from the object name for
    /// pod-statuses, which enqueue under their owning class.
    fn queue_name(&self) -> Option<String> {
        self.meta().name.clone()
    }

    fn contract(&self) -> ResourceContract {
        ResourceContract::from_annotations(self.meta().annotations.as_ref())
    }

    fn spc_name(&self) -> Option<String> {
        None
    }
}

impl WatchedKind for ConfigMap {
    const KIND: ConfigKind = ConfigKind::ConfigMap;

    fn fingerprint(&self) -> Fingerprint {
        source::configmap_fingerprint(self)
    }
}

impl WatchedKind for Secret {
    const KIND: ConfigKind = ConfigKind::Secret;

    fn fingerprint(&self) -> Fingerprint {
        source::secret_fingerprint(self)
    }
}

impl WatchedKind for SecretProviderClassPodStatus {
    const KIND: ConfigKind = ConfigKind::SecretProviderClass;
    // Pod-statuses are written by the CSI driver; user label selectors
    // are not expected on them.
    const LABEL_FILTERED: bool = false;

    fn fingerprint(&self) -> Fingerprint {
        source::spcps_fingerprint(self)
    }

    fn queue_name(&self) -> Option<String> {
        source::spcps_owner(self).map(str::to_owned)
    }

    // The policy annotations live on the class object; the worker
    // re-derives them on every run.
    fn contract(&self) -> ResourceContract {
        ResourceContract::default()
    }

    fn spc_name(&self) -> Option<String> {
        source::spcps_owner(self).map(str::to_owned)
    }
}

pub fn spawn_watchers(
    client: &Client,
    config: &Arc<ReloaderConfig>,
    scope: &WatchScope,
    cache: &Arc<ObjectCache>,
    queue: &Arc<WorkQueue>,
    running: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if !config.ignore_configmaps() {
        handles.extend(spawn_kind::<ConfigMap>(client, config, scope, cache, queue, running));
    }
    if !config.ignore_secrets() {
        handles.extend(spawn_kind::<Secret>(client, config, scope, cache, queue, running));
    }
    if config.enable_csi_integration() {
        handles.extend(spawn_kind::<SecretProviderClassPodStatus>(
            client, config, scope, cache, queue, running,
        ));
    }
    handles
}

fn spawn_kind<K: WatchedKind>(
    client: &Client,
    config: &Arc<ReloaderConfig>,
    scope: &WatchScope,
    cache: &Arc<ObjectCache>,
    queue: &Arc<WorkQueue>,
    running: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut watcher_config = watcher::Config::default();
    if K::LABEL_FILTERED {
        if let Some(selector) = config.resource_label_selector() {
            watcher_config = watcher_config.labels(selector);
        }
    }

    let apis: Vec<Api<K>> = match scope {
        WatchScope::Cluster { .. } => vec![Api::all(client.clone())],
        WatchScope::Namespaces(list) => list
            .iter()
            .map(|ns| Api::namespaced(client.clone(), ns))
            .collect(),
    };

    apis.into_iter()
        .map(|api| {
            tokio::spawn(watch_kind(
                api,
                watcher_config.clone(),
                scope.clone(),
                Arc::clone(config),
                Arc::clone(cache),
                Arc::clone(queue),
                running.clone(),
            ))
        })
        .collect()
}

async fn watch_kind<K: WatchedKind>(
    api: Api<K>,
    watcher_config: watcher::Config,
    scope: WatchScope,
    config: Arc<ReloaderConfig>,
    cache: Arc<ObjectCache>,
    queue: Arc<WorkQueue>,
    mut running: watch::Receiver<bool>,
) {
    info!("Watching {} objects", K::KIND);
    let mut known: HashSet<ObjectKey> = HashSet::new();

    let stream = watcher(api, watcher_config);
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else {
                    warn!("{} watch stream ended", K::KIND);
                    return;
                };
                match event {
                    Ok(watcher::Event::Applied(obj)) => {
                        if let Some(key) = handle_applied(&obj, false, &scope, &config, &cache, &queue) {
                            known.insert(key);
                        }
                    }
                    Ok(watcher::Event::Deleted(obj)) => {
                        if let Some(key) = handle_deleted(&obj, &scope, &config, &cache, &queue) {
                            known.remove(&key);
                        }
                    }
                    Ok(watcher::Event::Restarted(objs)) => {
                        // Full re-list: prime the cache, surface changes
                        // that happened while the watch was down, and
                        // synthesize deletes for entries that vanished.
                        let mut seen = HashSet::new();
                        for obj in &objs {
                            if let Some(key) = handle_applied(obj, true, &scope, &config, &cache, &queue) {
                                seen.insert(key);
                            }
                        }
                        for key in known.difference(&seen) {
                            cache.mark_deleted(key);
                            let owner = cache.tombstone(key).and_then(|t| t.spc_name);
                            if !config.reload_on_delete() {
                                cache.purge(key);
                                continue;
                            }
                            match owner {
                                Some(class) if class != key.name => {
                                    // Tombstones keyed by a pod-status are
                                    // never revisited; the class aggregate
                                    // is re-read by the worker.
                                    cache.purge(key);
                                    queue.enqueue(
                                        ObjectKey::new(key.kind, &key.namespace, class),
                                        EventReason::Deleted,
                                    );
                                }
                                _ => queue.enqueue(key.clone(), EventReason::Deleted),
                            }
                        }
                        known = seen;
                    }
                    Err(e) => warn!("Error watching {} objects: {e}", K::KIND),
                }
            }
            _ = running.changed() => {
                if !*running.borrow() {
                    info!("Stopping the {} watcher", K::KIND);
                    return;
                }
            }
        }
    }
}

fn handle_applied<K: WatchedKind>(
    obj: &K,
    initial: bool,
    scope: &WatchScope,
    config: &ReloaderConfig,
    cache: &ObjectCache,
    queue: &WorkQueue,
) -> Option<ObjectKey> {
    let meta = obj.meta();
    let namespace = meta.namespace.as_deref()?;
    let name = meta.name.as_deref()?;
    if !scope.includes(namespace) {
        return None;
    }

    let cache_key = ObjectKey::new(K::KIND, namespace, name);
    let observation = cache.observe(
        cache_key.clone(),
        obj.fingerprint(),
        obj.contract(),
        obj.spc_name(),
    );

    let Some(queue_name) = obj.queue_name() else {
        return Some(cache_key);
    };
    let queue_key = ObjectKey::new(K::KIND, namespace, queue_name);

    match observation {
        // The initial listing is not a wave of creations
        Observation::New if initial => {}
        Observation::New => {
            if config.reload_on_create() {
                queue.enqueue(queue_key, EventReason::Created);
            }
        }
        Observation::Changed => queue.enqueue(queue_key, EventReason::DataChanged),
        Observation::Unchanged => {}
    }

    Some(cache_key)
}

fn handle_deleted<K: WatchedKind>(
    obj: &K,
    scope: &WatchScope,
    config: &ReloaderConfig,
    cache: &ObjectCache,
    queue: &WorkQueue,
) -> Option<ObjectKey> {
    let meta = obj.meta();
    let namespace = meta.namespace.as_deref()?;
    let name = meta.name.as_deref()?;
    if !scope.includes(namespace) {
        return None;
    }

    let cache_key = ObjectKey::new(K::KIND, namespace, name);
    if !config.reload_on_delete() {
        cache.purge(&cache_key);
        return Some(cache_key);
    }

    match obj.queue_name() {
        Some(queue_name) if queue_name == name => {
            cache.mark_deleted(&cache_key);
            queue.enqueue(
                ObjectKey::new(K::KIND, namespace, queue_name),
                EventReason::Deleted,
            );
        }
        Some(queue_name) => {
            // Pod-status tombstones would never be revisited under their
            // own key; the worker re-reads the class aggregate instead.
            cache.purge(&cache_key);
            queue.enqueue(
                ObjectKey::new(K::KIND, namespace, queue_name),
                EventReason::Deleted,
            );
        }
        None => cache.purge(&cache_key),
    }
    Some(cache_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_scope_honors_the_ignore_list() {
        let scope = WatchScope::Cluster {
            ignore: ["kube-system".to_string()].into_iter().collect(),
        };
        assert!(scope.includes("default"));
        assert!(!scope.includes("kube-system"));
    }

    #[test]
    fn namespace_scope_is_a_closed_list() {
        let scope = WatchScope::Namespaces(vec!["apps".into(), "batch".into()]);
        assert!(scope.includes("apps"));
        assert!(!scope.includes("default"));
    }

    #[test]
    fn spcps_queues_under_its_class() {
        use reloader_crds::SecretProviderClassPodStatusStatus;

        let spcps = SecretProviderClassPodStatus {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("app-pod-default-vault".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            status: Some(SecretProviderClassPodStatusStatus {
                secret_provider_class_name: Some("vault".into()),
                ..Default::default()
            }),
        };
        assert_eq!(spcps.queue_name().as_deref(), Some("vault"));
        assert_eq!(spcps.spc_name().as_deref(), Some("vault"));
    }
}
