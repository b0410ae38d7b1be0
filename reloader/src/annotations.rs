//! The closed annotation vocabulary understood by the controller.
//!
//! Workload-side keys are read from the workload object and its pod
//! template (workload-level wins when both carry the same key); the
//! resource-side keys live on the configuration objects themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use log::warn;

use crate::source::ConfigKind;

pub const PREFIX: &str = "reloader.stakater.com";

pub const AUTO: &str = "reloader.stakater.com/auto";
pub const SEARCH: &str = "reloader.stakater.com/search";
pub const MATCH: &str = "reloader.stakater.com/match";
pub const IGNORE: &str = "reloader.stakater.com/ignore";
pub const PAUSE_PERIOD: &str = "reloader.stakater.com/pause-period";
pub const PAUSED_AT: &str = "reloader.stakater.com/paused-at";
pub const LAST_RELOADED_FROM: &str = "reloader.stakater.com/last-reloaded-from";
pub const ROLLOUT_STRATEGY: &str = "reloader.stakater.com/rollout-strategy";

const CONFIGMAP_AUTO: &str = "configmap.reloader.stakater.com/auto";
const SECRET_AUTO: &str = "secret.reloader.stakater.com/auto";
const SPC_AUTO: &str = "secretproviderclass.reloader.stakater.com/auto";

const CONFIGMAP_RELOAD: &str = "configmap.reloader.stakater.com/reload";
const SECRET_RELOAD: &str = "secret.reloader.stakater.com/reload";
const SPC_RELOAD: &str = "secretproviderclass.reloader.stakater.com/reload";

const CONFIGMAP_EXCLUDE: &str = "configmap.reloader.stakater.com/exclude";
const SECRET_EXCLUDE: &str = "secret.reloader.stakater.com/exclude";
const SPC_EXCLUDE: &str = "secretproviderclass.reloader.stakater.com/exclude";

/// One value per watched configuration kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerKind<T> {
    pub configmap: T,
    pub secret: T,
    pub secret_provider_class: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: ConfigKind) -> &T {
        match kind {
            ConfigKind::ConfigMap => &self.configmap,
            ConfigKind::Secret => &self.secret,
            ConfigKind::SecretProviderClass => &self.secret_provider_class,
        }
    }
}

/// How an Argo Rollout should be reloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RolloutStrategy {
    /// Stamp the pod template like any other workload.
    #[default]
    Default,
    /// Write `spec.restartAt` and leave the template untouched.
    Restart,
}

/// Reload policy derived fresh from a workload's annotations at each event.
#[derive(Debug, Clone, Default)]
pub struct MatchContract {
    pub auto: Option<bool>,
    pub auto_per_kind: PerKind<Option<bool>>,
    pub reload: PerKind<Vec<String>>,
    pub exclude: PerKind<BTreeSet<String>>,
    pub search: bool,
    pub pause_period: Option<Duration>,
    pub rollout_strategy: RolloutStrategy,
}

impl MatchContract {
    /// Derive the contract from the workload-level and pod-template
    /// annotation maps. Workload-level wins conflicting keys.
    pub fn from_annotations(
        workload: &BTreeMap<String, String>,
        template: &BTreeMap<String, String>,
    ) -> Self {
        let get = |key: &str| workload.get(key).or_else(|| template.get(key));

        let auto_per_kind = PerKind {
            configmap: get(CONFIGMAP_AUTO).and_then(|v| parse_bool(CONFIGMAP_AUTO, v)),
            secret: get(SECRET_AUTO).and_then(|v| parse_bool(SECRET_AUTO, v)),
            secret_provider_class: get(SPC_AUTO).and_then(|v| parse_bool(SPC_AUTO, v)),
        };
        let reload = PerKind {
            configmap: get(CONFIGMAP_RELOAD).map(|v| parse_list(v)).unwrap_or_default(),
            secret: get(SECRET_RELOAD).map(|v| parse_list(v)).unwrap_or_default(),
            secret_provider_class: get(SPC_RELOAD).map(|v| parse_list(v)).unwrap_or_default(),
        };
        let exclude = PerKind {
            configmap: get(CONFIGMAP_EXCLUDE)
                .map(|v| parse_list(v).into_iter().collect())
                .unwrap_or_default(),
            secret: get(SECRET_EXCLUDE)
                .map(|v| parse_list(v).into_iter().collect())
                .unwrap_or_default(),
            secret_provider_class: get(SPC_EXCLUDE)
                .map(|v| parse_list(v).into_iter().collect())
                .unwrap_or_default(),
        };

        MatchContract {
            auto: get(AUTO).and_then(|v| parse_bool(AUTO, v)),
            auto_per_kind,
            reload,
            exclude,
            search: get(SEARCH).and_then(|v| parse_bool(SEARCH, v)).unwrap_or(false),
            pause_period: get(PAUSE_PERIOD).and_then(|v| parse_pause_period(v)),
            rollout_strategy: get(ROLLOUT_STRATEGY)
                .map(|v| parse_rollout_strategy(v))
                .unwrap_or_default(),
        }
    }
}

/// Policy carried by a configuration object itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceContract {
    /// `ignore=true` suppresses every reload caused by this object.
    pub ignore: bool,
    /// `match=true` exposes this object to the search channel.
    pub search_match: bool,
}

impl ResourceContract {
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Self {
        let Some(annotations) = annotations else {
            return ResourceContract::default();
        };
        ResourceContract {
            ignore: annotations
                .get(IGNORE)
                .and_then(|v| parse_bool(IGNORE, v))
                .unwrap_or(false),
            search_match: annotations
                .get(MATCH)
                .and_then(|v| parse_bool(MATCH, v))
                .unwrap_or(false),
        }
    }
}

/// Strict boolean: anything other than `true`/`false` counts as unset.
fn parse_bool(key: &str, value: &str) -> Option<bool> {
    match value.trim() {
        "true" => Some(true),
        "false" => Some(false),
        other => {
            warn!("Ignoring annotation {key}: expected true or false, got {other:?}");
            None
        }
    }
}

/// Comma list with trimmed tokens; empty tokens are dropped.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Pause period in the standard duration grammar (ns/us/ms/s/m/h).
///
/// Values that fail to parse or are not strictly positive disable pausing.
pub fn parse_pause_period(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.starts_with('-') {
        return None;
    }
    match humantime::parse_duration(value) {
        Ok(d) if !d.is_zero() => Some(d),
        Ok(_) => None,
        Err(e) => {
            warn!("Ignoring annotation {PAUSE_PERIOD}: invalid duration {value:?}: {e}");
            None
        }
    }
}

fn parse_rollout_strategy(value: &str) -> RolloutStrategy {
    match value.trim() {
        "restart" => RolloutStrategy::Restart,
        "default" => RolloutStrategy::Default,
        other => {
            warn!("Ignoring annotation {ROLLOUT_STRATEGY}: unknown strategy {other:?}");
            RolloutStrategy::Default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn booleans_are_strict() {
        assert_eq!(parse_bool(AUTO, "true"), Some(true));
        assert_eq!(parse_bool(AUTO, "false"), Some(false));
        assert_eq!(parse_bool(AUTO, " true "), Some(true));
        assert_eq!(parse_bool(AUTO, "True"), None);
        assert_eq!(parse_bool(AUTO, "yes"), None);
        assert_eq!(parse_bool(AUTO, ""), None);
    }

    #[test]
    fn lists_are_trimmed() {
        assert_eq!(parse_list("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_list("a,,b,"), vec!["a", "b"]);
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn pause_periods() {
        let tests = [
            ("10s", Some(Duration::from_secs(10))),
            ("500ms", Some(Duration::from_millis(500))),
            ("1m", Some(Duration::from_secs(60))),
            ("2h", Some(Duration::from_secs(7200))),
            ("0s", None),
            ("-10s", None),
            ("soon", None),
            ("", None),
        ];
        for (input, expected) in tests {
            assert_eq!(parse_pause_period(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn workload_level_wins_conflicts() {
        let workload = map(&[(AUTO, "true")]);
        let template = map(&[(AUTO, "false")]);
        let contract = MatchContract::from_annotations(&workload, &template);
        assert_eq!(contract.auto, Some(true));
    }

    #[test]
    fn template_annotations_count_when_workload_is_silent() {
        let workload = map(&[]);
        let template = map(&[(SEARCH, "true"), (CONFIGMAP_RELOAD, "cm-a,cm-b")]);
        let contract = MatchContract::from_annotations(&workload, &template);
        assert!(contract.search);
        assert_eq!(contract.reload.configmap, vec!["cm-a", "cm-b"]);
    }

    #[test]
    fn kind_scoped_keys_land_on_their_kind() {
        let workload = map(&[
            (CONFIGMAP_AUTO, "true"),
            (SECRET_AUTO, "false"),
            (SECRET_EXCLUDE, "noisy"),
            (SPC_RELOAD, "vault-spc"),
        ]);
        let contract = MatchContract::from_annotations(&workload, &map(&[]));
        assert_eq!(contract.auto_per_kind.configmap, Some(true));
        assert_eq!(contract.auto_per_kind.secret, Some(false));
        assert_eq!(contract.auto_per_kind.secret_provider_class, None);
        assert!(contract.exclude.secret.contains("noisy"));
        assert_eq!(contract.reload.secret_provider_class, vec!["vault-spc"]);
    }

    #[test]
    fn rollout_strategy_parses() {
        let restart = map(&[(ROLLOUT_STRATEGY, "restart")]);
        let contract = MatchContract::from_annotations(&restart, &map(&[]));
        assert_eq!(contract.rollout_strategy, RolloutStrategy::Restart);

        let junk = map(&[(ROLLOUT_STRATEGY, "rolling")]);
        let contract = MatchContract::from_annotations(&junk, &map(&[]));
        assert_eq!(contract.rollout_strategy, RolloutStrategy::Default);
    }

    #[test]
    fn resource_contract_defaults_off() {
        assert_eq!(ResourceContract::from_annotations(None), ResourceContract::default());

        let annotations = map(&[(IGNORE, "true"), (MATCH, "true")]);
        let contract = ResourceContract::from_annotations(Some(&annotations));
        assert!(contract.ignore);
        assert!(contract.search_match);

        let junk = map(&[(IGNORE, "yes")]);
        let contract = ResourceContract::from_annotations(Some(&junk));
        assert!(!contract.ignore);
    }
}
