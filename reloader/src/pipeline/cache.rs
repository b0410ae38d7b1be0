//! Fingerprint cache fed by the watchers.
//!
//! One entry per observed configuration object, keyed by
//! `(kind, namespace, name)`. Deleted objects leave a tombstone so the
//! worker can still honor the object's last-known contract; the worker
//! purges it once the delete is handled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::annotations::ResourceContract;
use crate::fingerprint::Fingerprint;
use crate::source::ConfigKind;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ConfigKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ConfigKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectKey {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Clone, Debug)]
pub struct CachedObject {
    pub fingerprint: Fingerprint,
    pub contract: ResourceContract,
    /// For pod-status objects, the owning SecretProviderClass.
    pub spc_name: Option<String>,
    deleted: bool,
}

/// Outcome of feeding one observed version into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Unchanged,
    Changed,
}

#[derive(Default)]
pub struct ObjectCache {
    inner: Mutex<HashMap<ObjectKey, CachedObject>>,
}

impl ObjectCache {
    pub fn observe(
        &self,
        key: ObjectKey,
        fingerprint: Fingerprint,
        contract: ResourceContract,
        spc_name: Option<String>,
    ) -> Observation {
        let mut inner = self.inner.lock().unwrap();
        let entry = CachedObject {
            fingerprint,
            contract,
            spc_name,
            deleted: false,
        };
        match inner.insert(key, entry) {
            None => Observation::New,
            Some(old) if old.deleted => Observation::New,
            Some(old) if old.fingerprint == fingerprint => Observation::Unchanged,
            Some(_) => Observation::Changed,
        }
    }

    /// Keep the entry around as a tombstone for the delete handler.
    pub fn mark_deleted(&self, key: &ObjectKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(key) {
            entry.deleted = true;
        }
    }

    pub fn tombstone(&self, key: &ObjectKey) -> Option<CachedObject> {
        let inner = self.inner.lock().unwrap();
        inner.get(key).filter(|e| e.deleted).cloned()
    }

    pub fn purge(&self, key: &ObjectKey) {
        self.inner.lock().unwrap().remove(key);
    }

    /// Fingerprint of a live entry, for stamping co-referenced objects.
    pub fn lookup_fingerprint(
        &self,
        kind: ConfigKind,
        namespace: &str,
        name: &str,
    ) -> Option<Fingerprint> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&ObjectKey::new(kind, namespace, name))
            .filter(|e| !e.deleted)
            .map(|e| e.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(data: &str) -> Fingerprint {
        Fingerprint::of_pairs([("k", data.as_bytes())])
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(ConfigKind::ConfigMap, "default", name)
    }

    #[test]
    fn first_observation_is_new() {
        let cache = ObjectCache::default();
        let obs = cache.observe(key("cm"), fp("v1"), Default::default(), None);
        assert_eq!(obs, Observation::New);
    }

    #[test]
    fn unchanged_data_is_not_a_change() {
        let cache = ObjectCache::default();
        cache.observe(key("cm"), fp("v1"), Default::default(), None);
        let obs = cache.observe(key("cm"), fp("v1"), Default::default(), None);
        assert_eq!(obs, Observation::Unchanged);
    }

    #[test]
    fn data_change_is_detected() {
        let cache = ObjectCache::default();
        cache.observe(key("cm"), fp("v1"), Default::default(), None);
        let obs = cache.observe(key("cm"), fp("v2"), Default::default(), None);
        assert_eq!(obs, Observation::Changed);
    }

    #[test]
    fn recreation_after_delete_counts_as_new() {
        let cache = ObjectCache::default();
        cache.observe(key("cm"), fp("v1"), Default::default(), None);
        cache.mark_deleted(&key("cm"));
        let obs = cache.observe(key("cm"), fp("v1"), Default::default(), None);
        assert_eq!(obs, Observation::New);
    }

    #[test]
    fn tombstones_keep_the_contract_until_purged() {
        let cache = ObjectCache::default();
        let contract = ResourceContract {
            ignore: true,
            search_match: false,
        };
        cache.observe(key("cm"), fp("v1"), contract, None);

        assert!(cache.tombstone(&key("cm")).is_none(), "live entries are not tombstones");
        cache.mark_deleted(&key("cm"));
        assert!(cache.tombstone(&key("cm")).unwrap().contract.ignore);
        assert_eq!(
            cache.lookup_fingerprint(ConfigKind::ConfigMap, "default", "cm"),
            None,
            "deleted entries no longer resolve fingerprints"
        );

        cache.purge(&key("cm"));
        assert!(cache.tombstone(&key("cm")).is_none());
    }
}
