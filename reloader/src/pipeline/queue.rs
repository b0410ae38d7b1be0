//! Work queue with per-key serialization and rate-limited retries.
//!
//! Each key moves through pending → running → (done | waiting-for-retry).
//! At most one worker processes a key at a time; events arriving while a
//! key runs coalesce into exactly one re-run. Retries back off
//! exponentially (base 1s, cap 5min, jitter below 25%); conflicts are
//! bounded, RBAC failures poll at a flat long interval.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use prometheus_client::metrics::gauge::Gauge;
use rand::Rng;
use tokio::sync::Notify;

use crate::errors::ErrorClass;

use super::cache::ObjectKey;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(300);
const FORBIDDEN_RETRY: Duration = Duration::from_secs(300);
const MAX_CONFLICT_RETRIES: u32 = 5;
const MAX_TRANSIENT_RETRIES: u32 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventReason {
    Created,
    DataChanged,
    Deleted,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::Created => "created",
            EventReason::DataChanged => "data-changed",
            EventReason::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Retry(ErrorClass),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    /// A retry is scheduled; a fresh event promotes the key immediately.
    Waiting,
}

struct Entry {
    phase: Phase,
    reason: EventReason,
    rerun: Option<EventReason>,
    attempts: u32,
}

struct Inner {
    ready: VecDeque<ObjectKey>,
    entries: HashMap<ObjectKey, Entry>,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    depth: Gauge,
}

impl WorkQueue {
    pub fn new(depth: Gauge) -> Arc<Self> {
        Arc::new(WorkQueue {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                entries: HashMap::new(),
            }),
            notify: Notify::new(),
            depth,
        })
    }

    /// Feed an observed event in. Events on a key that is already queued
    /// coalesce; events on a running key cause exactly one re-run.
    pub fn enqueue(&self, key: ObjectKey, reason: EventReason) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(entry) = inner.entries.get_mut(&key) {
            match entry.phase {
                Phase::Pending => {
                    // Latest event wins the coalesced reason
                    entry.reason = reason;
                }
                Phase::Running => {
                    entry.rerun = Some(reason);
                }
                Phase::Waiting => {
                    entry.phase = Phase::Pending;
                    entry.reason = reason;
                    entry.attempts = 0;
                    inner.ready.push_back(key);
                    self.depth.inc();
                    self.notify.notify_one();
                }
            }
            return;
        }

        inner.entries.insert(
            key.clone(),
            Entry {
                phase: Phase::Pending,
                reason,
                rerun: None,
                attempts: 0,
            },
        );
        inner.ready.push_back(key);
        self.depth.inc();
        self.notify.notify_one();
    }

    /// Wait for the next key. Cancel-safe; workers race fairly.
    pub async fn next(&self) -> (ObjectKey, EventReason) {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_next() {
                return item;
            }
            notified.await;
        }
    }

    fn try_next(&self) -> Option<(ObjectKey, EventReason)> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(key) = inner.ready.pop_front() {
            self.depth.dec();
            if let Some(entry) = inner.entries.get_mut(&key) {
                if entry.phase == Phase::Pending {
                    entry.phase = Phase::Running;
                    return Some((key, entry.reason));
                }
            }
        }
        None
    }

    /// Report the outcome of a finished run for `key`.
    pub fn complete(self: &Arc<Self>, key: &ObjectKey, completion: Completion) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };

        // A coalesced event beats whatever the run ended with: the next
        // run re-reads the world anyway.
        if let Some(reason) = entry.rerun.take() {
            entry.phase = Phase::Pending;
            entry.reason = reason;
            entry.attempts = 0;
            inner.ready.push_back(key.clone());
            self.depth.inc();
            self.notify.notify_one();
            return;
        }

        match completion {
            Completion::Success => {
                inner.entries.remove(key);
            }
            Completion::Retry(class) => {
                entry.attempts += 1;
                let attempts = entry.attempts;
                let give_up = match class {
                    ErrorClass::Permanent | ErrorClass::NotFound => true,
                    ErrorClass::Conflict => attempts > MAX_CONFLICT_RETRIES,
                    ErrorClass::Transient => attempts > MAX_TRANSIENT_RETRIES,
                    ErrorClass::Forbidden => false,
                };
                if give_up {
                    warn!("Giving up on {key} after {attempts} attempts ({})", class.as_str());
                    inner.entries.remove(key);
                    return;
                }

                entry.phase = Phase::Waiting;
                let delay = match class {
                    ErrorClass::Forbidden => FORBIDDEN_RETRY,
                    _ => backoff(attempts),
                };
                debug!("Retrying {key} in {delay:?} (attempt {attempts}, {})", class.as_str());

                let queue = Arc::clone(self);
                let key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.fire(&key, attempts);
                });
            }
        }
    }

    /// Promote a waiting key whose retry timer elapsed. A fresh event may
    /// have promoted it already; the attempt count disambiguates.
    fn fire(&self, key: &ObjectKey, attempts: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        if entry.phase == Phase::Waiting && entry.attempts == attempts {
            entry.phase = Phase::Pending;
            inner.ready.push_back(key.clone());
            self.depth.inc();
            self.notify.notify_one();
        }
    }
}

/// Exponential backoff with jitter below 25%.
fn backoff(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    deterministic_backoff(attempt).mul_f64(1.0 + jitter)
}

fn deterministic_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .checked_mul(1u32 << shift)
        .map(|d| d.min(BACKOFF_CAP))
        .unwrap_or(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ConfigKind;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(ConfigKind::ConfigMap, "default", name)
    }

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Gauge::default())
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(deterministic_backoff(1), Duration::from_secs(1));
        assert_eq!(deterministic_backoff(2), Duration::from_secs(2));
        assert_eq!(deterministic_backoff(5), Duration::from_secs(16));
        assert_eq!(deterministic_backoff(9), Duration::from_secs(256));
        assert_eq!(deterministic_backoff(10), BACKOFF_CAP);
        assert_eq!(deterministic_backoff(30), BACKOFF_CAP);
    }

    #[test]
    fn jittered_backoff_stays_below_a_quarter_over() {
        for attempt in 1..6 {
            let base = deterministic_backoff(attempt);
            for _ in 0..50 {
                let jittered = backoff(attempt);
                assert!(jittered >= base);
                assert!(jittered < base.mul_f64(1.25));
            }
        }
    }

    #[tokio::test]
    async fn events_dedup_by_key() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::Created);
        q.enqueue(key("cm"), EventReason::DataChanged);

        let (k, reason) = q.next().await;
        assert_eq!(k, key("cm"));
        assert_eq!(reason, EventReason::DataChanged, "latest event wins");
        assert!(q.try_next().is_none());
    }

    #[tokio::test]
    async fn success_clears_the_key() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::DataChanged);
        let (k, _) = q.next().await;
        q.complete(&k, Completion::Success);
        assert!(q.try_next().is_none());
        assert!(q.inner.lock().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn event_while_running_causes_exactly_one_rerun() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::DataChanged);
        let (k, _) = q.next().await;

        q.enqueue(key("cm"), EventReason::DataChanged);
        q.enqueue(key("cm"), EventReason::Deleted);
        assert!(q.try_next().is_none(), "key is serialized while running");

        q.complete(&k, Completion::Success);
        let (k, reason) = q.next().await;
        assert_eq!(reason, EventReason::Deleted);

        q.complete(&k, Completion::Success);
        assert!(q.try_next().is_none(), "exactly one re-run");
    }

    #[tokio::test]
    async fn rerun_wins_over_a_failed_outcome() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::DataChanged);
        let (k, _) = q.next().await;
        q.enqueue(key("cm"), EventReason::DataChanged);
        q.complete(&k, Completion::Retry(ErrorClass::Permanent));

        let next = q.try_next();
        assert!(next.is_some(), "the coalesced event still runs");
    }

    #[tokio::test]
    async fn permanent_failures_drop_the_key() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::DataChanged);
        let (k, _) = q.next().await;
        q.complete(&k, Completion::Retry(ErrorClass::Permanent));
        assert!(q.inner.lock().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn retries_wait_and_a_fresh_event_promotes_immediately() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::DataChanged);
        let (k, _) = q.next().await;
        q.complete(&k, Completion::Retry(ErrorClass::Transient));

        assert!(q.try_next().is_none(), "waiting keys are not ready");

        q.enqueue(key("cm"), EventReason::DataChanged);
        let (_, reason) = q.try_next().expect("fresh event promotes the key");
        assert_eq!(reason, EventReason::DataChanged);
    }

    #[tokio::test]
    async fn stale_retry_timers_do_not_double_fire() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::DataChanged);
        let (k, _) = q.next().await;
        q.complete(&k, Completion::Retry(ErrorClass::Transient));

        // The fresh event reset the attempt counter; the old timer is stale
        q.enqueue(key("cm"), EventReason::DataChanged);
        q.fire(&key("cm"), 1);

        let first = q.try_next();
        assert!(first.is_some());
        assert!(q.try_next().is_none(), "no duplicate ready entry");
    }

    #[tokio::test]
    async fn conflicts_give_up_after_the_cap() {
        let q = queue();
        q.enqueue(key("cm"), EventReason::DataChanged);

        for _ in 0..MAX_CONFLICT_RETRIES {
            let (k, _) = q.next().await;
            q.complete(&k, Completion::Retry(ErrorClass::Conflict));
            let attempts = q.inner.lock().unwrap().entries[&key("cm")].attempts;
            q.fire(&key("cm"), attempts);
        }

        let (k, _) = q.next().await;
        q.complete(&k, Completion::Retry(ErrorClass::Conflict));
        assert!(
            q.inner.lock().unwrap().entries.is_empty(),
            "the key is surfaced as a permanent failure"
        );
    }
}
