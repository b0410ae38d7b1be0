//! The match engine: decides whether a changed configuration object
//! should reload a given workload, applying the layered policy.

use log::warn;
use regex::Regex;

use crate::annotations::MatchContract;
use crate::source::ConfigObject;
use crate::workload::Workload;

/// Presence of any of these marks a reload token as a regex; tokens
/// without them must match exactly.
const REGEX_METACHARACTERS: &[char] = &[
    '^', '$', '.', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchChannel {
    Explicit,
    Auto,
    Search,
}

impl MatchChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchChannel::Explicit => "explicit",
            MatchChannel::Auto => "auto",
            MatchChannel::Search => "search",
        }
    }
}

/// A positive match, carrying the contract the reload will honor.
#[derive(Debug, Clone)]
pub struct Match {
    pub channel: MatchChannel,
    pub contract: MatchContract,
}

/// Evaluate one candidate workload against a changed object.
///
/// Channel precedence is explicit, auto, search; the first hit wins. An
/// exclude entry or a global `auto=false` veto beats everything.
pub fn evaluate(source: &ConfigObject, workload: &Workload, auto_reload_all: bool) -> Option<Match> {
    if source.contract.ignore {
        return None;
    }

    let contract = workload.contract();

    // Hard veto: nothing, not even an explicit entry, reloads this workload.
    if contract.auto == Some(false) {
        return None;
    }

    // An exclude drops the match regardless of the channel that found it.
    if contract.exclude.get(source.kind).contains(&source.name) {
        return None;
    }

    let channel = find_channel(source, workload, &contract, auto_reload_all)?;
    Some(Match { channel, contract })
}

fn find_channel(
    source: &ConfigObject,
    workload: &Workload,
    contract: &MatchContract,
    auto_reload_all: bool,
) -> Option<MatchChannel> {
    for token in contract.reload.get(source.kind) {
        match token_matches(token, &source.name) {
            Ok(true) => return Some(MatchChannel::Explicit),
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "Skipping {}: invalid reload token {token:?}: {e}",
                    workload.key()
                );
                return None;
            }
        }
    }

    let refs = workload.references();
    if !refs.contains(source.kind, &source.name) {
        return None;
    }

    let auto_enabled = match contract.auto_per_kind.get(source.kind) {
        Some(enabled) => *enabled,
        None => contract.auto == Some(true) || auto_reload_all,
    };
    if auto_enabled {
        return Some(MatchChannel::Auto);
    }

    if contract.search && source.contract.search_match {
        return Some(MatchChannel::Search);
    }

    None
}

fn token_matches(token: &str, name: &str) -> Result<bool, regex::Error> {
    if token.contains(REGEX_METACHARACTERS) {
        let re = Regex::new(&format!("^(?:{token})$"))?;
        Ok(re.is_match(name))
    } else {
        Ok(token == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{self, ResourceContract};
    use crate::source::ConfigKind;
    use crate::workload::WorkloadKind;
    use k8s_openapi::api::core::v1::{
        ConfigMapEnvSource, Container, EnvFromSource, PodSpec, PodTemplateSpec, SecretEnvSource,
    };

    fn source(kind: ConfigKind, name: &str) -> ConfigObject {
        ConfigObject {
            kind,
            namespace: "default".into(),
            name: name.into(),
            contract: ResourceContract::default(),
            fingerprint: None,
        }
    }

    fn workload(annotations: &[(&str, &str)], configmaps: &[&str], secrets: &[&str]) -> Workload {
        let env_from: Vec<EnvFromSource> = configmaps
            .iter()
            .map(|name| EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .chain(secrets.iter().map(|name| EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }))
            .collect();

        Workload {
            kind: WorkloadKind::Deployment,
            namespace: "default".into(),
            name: "app".into(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "main".into(),
                        env_from: Some(env_from),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
        }
    }

    #[test]
    fn explicit_literal_name() {
        let w = workload(
            &[("configmap.reloader.stakater.com/reload", "app-cm")],
            &[],
            &[],
        );
        let m = evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false).unwrap();
        assert_eq!(m.channel, MatchChannel::Explicit);

        // Explicit entries do not require the workload to mount the object
        assert!(evaluate(&source(ConfigKind::ConfigMap, "other"), &w, false).is_none());
    }

    #[test]
    fn literal_tokens_never_match_partially() {
        let w = workload(
            &[("configmap.reloader.stakater.com/reload", "app-cm")],
            &[],
            &[],
        );
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm-extra"), &w, false).is_none());
    }

    #[test]
    fn regex_tokens_are_anchored() {
        let w = workload(
            &[("configmap.reloader.stakater.com/reload", "app-.*")],
            &[],
            &[],
        );
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false).is_some());
        assert!(evaluate(&source(ConfigKind::ConfigMap, "xapp-cm"), &w, false).is_none());
    }

    #[test]
    fn invalid_regex_skips_the_workload() {
        let w = workload(
            &[("configmap.reloader.stakater.com/reload", "app-cm,(unclosed")],
            &[],
            &[],
        );
        // Even the valid literal before the bad token is off the table
        assert!(evaluate(&source(ConfigKind::ConfigMap, "(unclosed"), &w, false).is_none());
        let m = evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false);
        assert!(m.is_some(), "tokens before the invalid one still match");
    }

    #[test]
    fn auto_requires_a_reference() {
        let w = workload(&[(annotations::AUTO, "true")], &["app-cm"], &[]);
        let m = evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false).unwrap();
        assert_eq!(m.channel, MatchChannel::Auto);
        assert!(evaluate(&source(ConfigKind::ConfigMap, "unrelated"), &w, false).is_none());
    }

    #[test]
    fn kind_scoped_auto_restricts_the_kind() {
        let w = workload(
            &[("configmap.reloader.stakater.com/auto", "true")],
            &["app-cm"],
            &["db-secret"],
        );
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false).is_some());
        assert!(evaluate(&source(ConfigKind::Secret, "db-secret"), &w, false).is_none());
    }

    #[test]
    fn kind_scoped_false_disables_auto_under_auto_reload_all() {
        let w = workload(
            &[("secret.reloader.stakater.com/auto", "false")],
            &["app-cm"],
            &["db-secret"],
        );
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, true).is_some());
        assert!(evaluate(&source(ConfigKind::Secret, "db-secret"), &w, true).is_none());
    }

    #[test]
    fn auto_reload_all_covers_unannotated_workloads() {
        let w = workload(&[], &["app-cm"], &[]);
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false).is_none());
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, true).is_some());
    }

    #[test]
    fn auto_false_is_a_hard_veto() {
        let w = workload(
            &[
                (annotations::AUTO, "false"),
                ("configmap.reloader.stakater.com/reload", "app-cm"),
            ],
            &["app-cm"],
            &[],
        );
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false).is_none());
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, true).is_none());
    }

    #[test]
    fn ignored_sources_never_match() {
        let w = workload(&[(annotations::AUTO, "true")], &["db"], &[]);
        let mut s = source(ConfigKind::ConfigMap, "db");
        s.contract.ignore = true;
        assert!(evaluate(&s, &w, false).is_none());
    }

    #[test]
    fn exclude_beats_every_channel() {
        let w = workload(
            &[
                (annotations::AUTO, "true"),
                ("configmap.reloader.stakater.com/reload", "app-cm"),
                ("configmap.reloader.stakater.com/exclude", "app-cm"),
            ],
            &["app-cm"],
            &[],
        );
        assert!(evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, true).is_none());
    }

    #[test]
    fn search_channel_requires_both_flags() {
        let searching = workload(&[(annotations::SEARCH, "true")], &["app-cm"], &[]);
        let plain = workload(&[], &["app-cm"], &[]);

        let mut exposed = source(ConfigKind::ConfigMap, "app-cm");
        exposed.contract.search_match = true;
        let hidden = source(ConfigKind::ConfigMap, "app-cm");

        let m = evaluate(&exposed, &searching, false).unwrap();
        assert_eq!(m.channel, MatchChannel::Search);
        assert!(evaluate(&hidden, &searching, false).is_none());
        assert!(evaluate(&exposed, &plain, false).is_none());
    }

    #[test]
    fn search_still_requires_a_reference() {
        let w = workload(&[(annotations::SEARCH, "true")], &[], &[]);
        let mut s = source(ConfigKind::ConfigMap, "app-cm");
        s.contract.search_match = true;
        assert!(evaluate(&s, &w, false).is_none());
    }

    #[test]
    fn explicit_wins_channel_attribution() {
        let w = workload(
            &[
                (annotations::AUTO, "true"),
                ("configmap.reloader.stakater.com/reload", "app-cm"),
            ],
            &["app-cm"],
            &[],
        );
        let m = evaluate(&source(ConfigKind::ConfigMap, "app-cm"), &w, false).unwrap();
        assert_eq!(m.channel, MatchChannel::Explicit);
    }
}
