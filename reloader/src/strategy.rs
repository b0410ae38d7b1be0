//! The two interchangeable reload mutations, plus the Rollout restart
//! override.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::annotations::{self, RolloutStrategy};
use crate::fingerprint::Fingerprint;
use crate::matcher::Match;
use crate::source::{ConfigKind, ConfigObject};
use crate::workload::{Mutation, Workload, WorkloadKind};

/// Process-wide mutation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReloadStrategy {
    /// Stamp the pod template with a `last-reloaded-from` annotation.
    #[default]
    Annotations,
    /// Stamp every main container with a fingerprint env var.
    EnvVars,
}

impl ReloadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadStrategy::Annotations => "annotations",
            ReloadStrategy::EnvVars => "env-vars",
        }
    }
}

impl fmt::Display for ReloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReloadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "annotations" => Ok(ReloadStrategy::Annotations),
            "env-vars" => Ok(ReloadStrategy::EnvVars),
            other => Err(format!(
                "unknown reload strategy {other:?}, expected annotations or env-vars"
            )),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("the env-vars strategy cannot reload a {0}")]
    Incompatible(WorkloadKind),
}

/// Turn a match into the concrete mutation for its workload.
///
/// `lookup` resolves fingerprints of referenced objects other than the
/// changed one; `now` feeds the restart timestamp and the uniqueness
/// suffix.
pub fn build_mutation<F>(
    strategy: ReloadStrategy,
    workload: &Workload,
    matched: &Match,
    source: &ConfigObject,
    lookup: F,
    now: DateTime<Utc>,
) -> Result<Mutation, StrategyError>
where
    F: Fn(ConfigKind, &str) -> Option<Fingerprint>,
{
    // The per-workload restart override beats the process-wide strategy.
    if workload.kind == WorkloadKind::Rollout
        && matched.contract.rollout_strategy == RolloutStrategy::Restart
    {
        return Ok(Mutation::RestartAt(
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
    }

    match strategy {
        ReloadStrategy::Annotations => Ok(annotation_stamp(workload, source, now)),
        ReloadStrategy::EnvVars => {
            if matches!(workload.kind, WorkloadKind::CronJob | WorkloadKind::Job) {
                return Err(StrategyError::Incompatible(workload.kind));
            }
            Ok(env_var_stamp(workload, source, lookup))
        }
    }
}

/// `last-reloaded-from = "<kind>/<name>"`; when the template already
/// carries exactly that value a wall-clock suffix forces a fresh
/// pod-template hash.
fn annotation_stamp(workload: &Workload, source: &ConfigObject, now: DateTime<Utc>) -> Mutation {
    let base = source.qualified_name();
    let current = workload
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(annotations::LAST_RELOADED_FROM));

    let value = if current.map(String::as_str) == Some(base.as_str()) {
        format!("{base}-{}", now.timestamp_millis())
    } else {
        base
    };

    Mutation::TemplateAnnotation {
        key: annotations::LAST_RELOADED_FROM.to_string(),
        value,
    }
}

/// One `STAKATER_<KIND>_<NAME>` var per referenced object with a known
/// fingerprint; the changed object is always included, mounted or not.
fn env_var_stamp<F>(workload: &Workload, source: &ConfigObject, lookup: F) -> Mutation
where
    F: Fn(ConfigKind, &str) -> Option<Fingerprint>,
{
    let refs = workload.references();
    let mut vars = Vec::new();

    for kind in [
        ConfigKind::ConfigMap,
        ConfigKind::Secret,
        ConfigKind::SecretProviderClass,
    ] {
        for name in refs.names(kind) {
            let fingerprint = if kind == source.kind && name == &source.name {
                Some(source_fingerprint(source))
            } else {
                lookup(kind, name)
            };
            if let Some(fingerprint) = fingerprint {
                vars.push((env_var_name(kind, name), fingerprint.hex()));
            }
        }
    }

    if !refs.contains(source.kind, &source.name) {
        vars.push((
            env_var_name(source.kind, &source.name),
            source_fingerprint(source).hex(),
        ));
    }

    Mutation::ContainerEnv { vars }
}

/// A deleted object hashes like one with no data left.
fn source_fingerprint(source: &ConfigObject) -> Fingerprint {
    source
        .fingerprint
        .unwrap_or_else(|| Fingerprint::of_pairs(std::iter::empty::<(&str, &[u8])>()))
}

pub fn env_var_name(kind: ConfigKind, name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c.to_ascii_uppercase());
        } else {
            sanitized.push('_');
        }
    }
    format!("STAKATER_{}_{sanitized}", kind.env_token())
}
