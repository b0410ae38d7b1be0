use std::{
    collections::BTreeSet,
    fs::read_to_string,
    net::SocketAddr,
    path::Path,
};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use yaml_rust2::{Yaml, YamlLoader};

use crate::strategy::ReloadStrategy;

/// Config files merged in order before CLI arguments apply.
pub const CONFIG_PATHS: &[&str] = &["/etc/reloader/config.yml", "/etc/reloader/config.yaml"];

const MAX_WORKERS: i64 = 64;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloaderConfig {
    watch_globally: Option<bool>,
    namespace_selector: Option<String>,
    ignore_namespaces: Option<Vec<String>>,
    resource_label_selector: Option<String>,
    ignore_configmaps: Option<bool>,
    ignore_secrets: Option<bool>,
    ignore_cronjobs: Option<bool>,
    ignore_jobs: Option<bool>,
    reload_on_create: Option<bool>,
    reload_on_delete: Option<bool>,
    auto_reload_all: Option<bool>,
    reload_strategy: Option<ReloadStrategy>,
    is_argo_rollouts: Option<bool>,
    is_openshift: Option<bool>,
    enable_csi_integration: Option<bool>,
    workers: Option<usize>,
    log_level: Option<String>,
    extra_workload_kinds: Option<Vec<String>>,
    endpoint: Option<SocketAddr>,
    expose_metrics: Option<bool>,
    health_check: Option<bool>,
}


impl ReloaderConfig {
    pub fn new(paths: &[&str]) -> anyhow::Result<Self> {
        let mut config = paths
            .iter()
            .filter_map(|p| {
                let p = Path::new(p);
                if p.exists() {
                    Some(p)
                } else {
                    None
                }
            })
            .map(|p| {
                let content =
                    read_to_string(p).with_context(|| format!("Failed to read {}", p.display()))?;
                ReloaderConfig::try_from(content.as_str())
                    .with_context(|| format!("parsing error while processing {}", p.display()))
            })
            .try_fold(
                ReloaderConfig::default(),
                |mut config: ReloaderConfig, other: anyhow::Result<ReloaderConfig>| {
                    config.update(&other?);
                    Ok::<ReloaderConfig, anyhow::Error>(config)
                },
            )?;

        // Once file configuration is handled, apply CLI arguments
        let args = ReloaderCli::try_parse()?;
        config.update(&args.to_config());

        Ok(config)
    }

    pub fn update(&mut self, from: &ReloaderConfig) {
        if let Some(watch_globally) = from.watch_globally {
            self.watch_globally = Some(watch_globally);
        }

        if let Some(namespace_selector) = from.namespace_selector.as_deref() {
            self.namespace_selector = Some(namespace_selector.to_owned());
        }

        if let Some(ignore_namespaces) = from.ignore_namespaces.as_deref() {
            self.ignore_namespaces = Some(ignore_namespaces.to_owned());
        }

        if let Some(resource_label_selector) = from.resource_label_selector.as_deref() {
            self.resource_label_selector = Some(resource_label_selector.to_owned());
        }

        if let Some(ignore_configmaps) = from.ignore_configmaps {
            self.ignore_configmaps = Some(ignore_configmaps);
        }

        if let Some(ignore_secrets) = from.ignore_secrets {
            self.ignore_secrets = Some(ignore_secrets);
        }

        if let Some(ignore_cronjobs) = from.ignore_cronjobs {
            self.ignore_cronjobs = Some(ignore_cronjobs);
        }

        if let Some(ignore_jobs) = from.ignore_jobs {
            self.ignore_jobs = Some(ignore_jobs);
        }

        if let Some(reload_on_create) = from.reload_on_create {
            self.reload_on_create = Some(reload_on_create);
        }

        if let Some(reload_on_delete) = from.reload_on_delete {
            self.reload_on_delete = Some(reload_on_delete);
        }

        if let Some(auto_reload_all) = from.auto_reload_all {
            self.auto_reload_all = Some(auto_reload_all);
        }

        if let Some(reload_strategy) = from.reload_strategy {
            self.reload_strategy = Some(reload_strategy);
        }

        if let Some(is_argo_rollouts) = from.is_argo_rollouts {
            self.is_argo_rollouts = Some(is_argo_rollouts);
        }

        if let Some(is_openshift) = from.is_openshift {
            self.is_openshift = Some(is_openshift);
        }

        if let Some(enable_csi_integration) = from.enable_csi_integration {
            self.enable_csi_integration = Some(enable_csi_integration);
        }

        if let Some(workers) = from.workers {
            self.workers = Some(workers);
        }

        if let Some(log_level) = from.log_level.as_deref() {
            self.log_level = Some(log_level.to_owned());
        }

        if let Some(extra_workload_kinds) = from.extra_workload_kinds.as_deref() {
            self.extra_workload_kinds = Some(extra_workload_kinds.to_owned());
        }

        if let Some(endpoint) = from.endpoint {
            self.endpoint = Some(endpoint);
        }

        if let Some(expose_metrics) = from.expose_metrics {
            self.expose_metrics = Some(expose_metrics);
        }

        if let Some(health_check) = from.health_check {
            self.health_check = Some(health_check);
        }
    }

    pub fn watch_globally(&self) -> bool {
        self.watch_globally.unwrap_or(true)
    }

    pub fn namespace_selector(&self) -> Option<&str> {
        self.namespace_selector.as_deref()
    }

    pub fn ignore_namespaces(&self) -> BTreeSet<String> {
        self.ignore_namespaces
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn resource_label_selector(&self) -> Option<&str> {
        self.resource_label_selector.as_deref()
    }

    pub fn ignore_configmaps(&self) -> bool {
        self.ignore_configmaps.unwrap_or(false)
    }

    pub fn ignore_secrets(&self) -> bool {
        self.ignore_secrets.unwrap_or(false)
    }

    pub fn ignore_cronjobs(&self) -> bool {
        self.ignore_cronjobs.unwrap_or(false)
    }

    pub fn ignore_jobs(&self) -> bool {
        self.ignore_jobs.unwrap_or(false)
    }

    pub fn reload_on_create(&self) -> bool {
        self.reload_on_create.unwrap_or(false)
    }

    pub fn reload_on_delete(&self) -> bool {
        self.reload_on_delete.unwrap_or(false)
    }

    pub fn auto_reload_all(&self) -> bool {
        self.auto_reload_all.unwrap_or(false)
    }

    pub fn reload_strategy(&self) -> ReloadStrategy {
        self.reload_strategy.unwrap_or_default()
    }

    pub fn is_argo_rollouts(&self) -> bool {
        self.is_argo_rollouts.unwrap_or(false)
    }

    pub fn is_openshift(&self) -> bool {
        self.is_openshift.unwrap_or(false)
    }

    pub fn enable_csi_integration(&self) -> bool {
        self.enable_csi_integration.unwrap_or(false)
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(2)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn extra_workload_kinds(&self) -> &[String] {
        self.extra_workload_kinds.as_deref().unwrap_or(&[])
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9090)))
    }

    pub fn expose_metrics(&self) -> bool {
        self.expose_metrics.unwrap_or(true)
    }

    pub fn health_check(&self) -> bool {
        self.health_check.unwrap_or(true)
    }
}

impl TryFrom<&str> for ReloaderConfig {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        YamlLoader::load_from_str(value)?.try_into()
    }
}

impl TryFrom<Vec<Yaml>> for ReloaderConfig {
    type Error = anyhow::Error;

    fn try_from(value: Vec<Yaml>) -> Result<Self, Self::Error> {
        if value.is_empty() {
            // Ignore empty configuration
            return Ok(Default::default());
        }

        if value.len() > 1 {
            bail!("YAML file contains multiple documents");
        }

        let mut config = ReloaderConfig::default();
        let value = &value[0];
        if value.is_null() {
            return Ok(config);
        }

        let Some(value) = value.as_hash() else {
            bail!("Wrong configuration type");
        };

        for (k, v) in value.iter() {
            let Some(k) = k.as_str() else {
                bail!("key is not string: {k:?}")
            };

            match k {
                "watch_globally" => config.watch_globally = Some(yaml_bool(k, v)?),
                "namespace_selector" => config.namespace_selector = Some(yaml_str(k, v)?),
                "ignore_namespaces" => config.ignore_namespaces = Some(yaml_str_list(k, v)?),
                "resource_label_selector" => {
                    config.resource_label_selector = Some(yaml_str(k, v)?)
                }
                "ignore_configmaps" => config.ignore_configmaps = Some(yaml_bool(k, v)?),
                "ignore_secrets" => config.ignore_secrets = Some(yaml_bool(k, v)?),
                "ignore_cronjobs" => config.ignore_cronjobs = Some(yaml_bool(k, v)?),
                "ignore_jobs" => config.ignore_jobs = Some(yaml_bool(k, v)?),
                "reload_on_create" => config.reload_on_create = Some(yaml_bool(k, v)?),
                "reload_on_delete" => config.reload_on_delete = Some(yaml_bool(k, v)?),
                "auto_reload_all" => config.auto_reload_all = Some(yaml_bool(k, v)?),
                "reload_strategy" => {
                    let strategy = yaml_str(k, v)?;
                    config.reload_strategy =
                        Some(strategy.parse().map_err(|e: String| anyhow!(e))?);
                }
                "is_argo_rollouts" => config.is_argo_rollouts = Some(yaml_bool(k, v)?),
                "is_openshift" => config.is_openshift = Some(yaml_bool(k, v)?),
                "enable_csi_integration" => {
                    config.enable_csi_integration = Some(yaml_bool(k, v)?)
                }
                "workers" => {
                    let Some(workers) = v.as_i64() else {
                        bail!("workers field has incorrect type: {v:?}");
                    };
                    if !(1..=MAX_WORKERS).contains(&workers) {
                        bail!("workers out of range: {workers}");
                    }
                    config.workers = Some(workers as usize);
                }
                "log_level" => {
                    let level = yaml_str(k, v)?;
                    level
                        .parse::<log::LevelFilter>()
                        .map_err(|e| anyhow!("invalid log_level {level:?}: {e}"))?;
                    config.log_level = Some(level);
                }
                "extra_workload_kinds" => {
                    config.extra_workload_kinds = Some(yaml_str_list(k, v)?)
                }
                "endpoint" => {
                    let endpoint = yaml_str(k, v)?;
                    let endpoint = endpoint
                        .parse()
                        .map_err(|e| anyhow!("Failed to parse endpoint: {e}"))?;
                    config.endpoint = Some(endpoint);
                }
                "expose_metrics" => config.expose_metrics = Some(yaml_bool(k, v)?),
                "health_check" => config.health_check = Some(yaml_bool(k, v)?),
                name => bail!("Invalid field '{name}' with value: {v:?}"),
            }
        }

        Ok(config)
    }
}

fn yaml_bool(key: &str, value: &Yaml) -> anyhow::Result<bool> {
    let Some(b) = value.as_bool() else {
        bail!("{key} field has incorrect type: {value:?}");
    };
    Ok(b)
}

fn yaml_str(key: &str, value: &Yaml) -> anyhow::Result<String> {
    let Some(s) = value.as_str() else {
        bail!("{key} field has incorrect type: {value:?}");
    };
    Ok(s.to_owned())
}

fn yaml_str_list(key: &str, value: &Yaml) -> anyhow::Result<Vec<String>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let Some(items) = value.as_vec() else {
        bail!("{key} field has incorrect type: {value:?}");
    };
    items
        .iter()
        .map(|item| {
            let Some(item) = item.as_str() else {
                bail!("{key} entry has invalid type: {item:?}");
            };
            Ok(item.to_owned())
        })
        .collect()
}

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct ReloaderCli {
    /// Whether to watch every namespace instead of only the installation one
    #[arg(long, overrides_with("no_watch_globally"), env = "RELOADER_WATCH_GLOBALLY")]
    watch_globally: bool,
    #[arg(long, overrides_with = "watch_globally", hide(true))]
    no_watch_globally: bool,

    /// Label selector restricting the watched namespaces
    #[arg(long, env = "RELOADER_NAMESPACE_SELECTOR")]
    namespace_selector: Option<String>,

    /// Namespaces to subtract from the watch set
    #[arg(long, env = "RELOADER_IGNORE_NAMESPACES", value_delimiter = ',')]
    ignore_namespaces: Option<Vec<String>>,

    /// Label selector restricting the watched configuration objects
    #[arg(long, env = "RELOADER_RESOURCE_LABEL_SELECTOR")]
    resource_label_selector: Option<String>,

    /// Whether to skip the ConfigMap watcher entirely
    #[arg(long, overrides_with("no_ignore_configmaps"), env = "RELOADER_IGNORE_CONFIGMAPS")]
    ignore_configmaps: bool,
    #[arg(long, overrides_with = "ignore_configmaps", hide(true))]
    no_ignore_configmaps: bool,

    /// Whether to skip the Secret watcher entirely
    #[arg(long, overrides_with("no_ignore_secrets"), env = "RELOADER_IGNORE_SECRETS")]
    ignore_secrets: bool,
    #[arg(long, overrides_with = "ignore_secrets", hide(true))]
    no_ignore_secrets: bool,

    /// Whether to skip the CronJob adapter
    #[arg(long, overrides_with("no_ignore_cronjobs"), env = "RELOADER_IGNORE_CRONJOBS")]
    ignore_cronjobs: bool,
    #[arg(long, overrides_with = "ignore_cronjobs", hide(true))]
    no_ignore_cronjobs: bool,

    /// Whether to skip the Job adapter
    #[arg(long, overrides_with("no_ignore_jobs"), env = "RELOADER_IGNORE_JOBS")]
    ignore_jobs: bool,
    #[arg(long, overrides_with = "ignore_jobs", hide(true))]
    no_ignore_jobs: bool,

    /// Whether creations of watched objects trigger reloads
    #[arg(long, overrides_with("no_reload_on_create"), env = "RELOADER_RELOAD_ON_CREATE")]
    reload_on_create: bool,
    #[arg(long, overrides_with = "reload_on_create", hide(true))]
    no_reload_on_create: bool,

    /// Whether deletions of watched objects trigger reloads
    #[arg(long, overrides_with("no_reload_on_delete"), env = "RELOADER_RELOAD_ON_DELETE")]
    reload_on_delete: bool,
    #[arg(long, overrides_with = "reload_on_delete", hide(true))]
    no_reload_on_delete: bool,

    /// Whether every workload is treated as if it carried auto=true
    #[arg(long, overrides_with("no_auto_reload_all"), env = "RELOADER_AUTO_RELOAD_ALL")]
    auto_reload_all: bool,
    #[arg(long, overrides_with = "auto_reload_all", hide(true))]
    no_auto_reload_all: bool,

    /// Mutation strategy used to roll workloads
    #[arg(long, env = "RELOADER_RELOAD_STRATEGY", value_enum)]
    reload_strategy: Option<ReloadStrategy>,

    /// Whether the Argo Rollout adapter is enabled
    #[arg(long, overrides_with("no_is_argo_rollouts"), env = "RELOADER_IS_ARGO_ROLLOUTS")]
    is_argo_rollouts: bool,
    #[arg(long, overrides_with = "is_argo_rollouts", hide(true))]
    no_is_argo_rollouts: bool,

    /// Whether the OpenShift DeploymentConfig adapter is enabled
    #[arg(long, overrides_with("no_is_openshift"), env = "RELOADER_IS_OPENSHIFT")]
    is_openshift: bool,
    #[arg(long, overrides_with = "is_openshift", hide(true))]
    no_is_openshift: bool,

    /// Whether the secrets-store CSI pod-status watcher is enabled
    #[arg(
        long,
        overrides_with("no_enable_csi_integration"),
        env = "RELOADER_ENABLE_CSI_INTEGRATION"
    )]
    enable_csi_integration: bool,
    #[arg(long, overrides_with = "enable_csi_integration", hide(true))]
    no_enable_csi_integration: bool,

    /// Worker concurrency for the reload queue
    #[arg(long, short, env = "RELOADER_WORKERS")]
    workers: Option<usize>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, env = "RELOADER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Additional workload kinds as group/version/Kind triples
    #[arg(long, env = "RELOADER_EXTRA_WORKLOAD_KINDS", value_delimiter = ',')]
    extra_workload_kinds: Option<Vec<String>>,

    /// Bind address for the metrics and health endpoints
    #[arg(long, env = "RELOADER_ENDPOINT")]
    endpoint: Option<SocketAddr>,

    /// Whether prometheus metrics should be collected and exposed
    #[arg(long, overrides_with("no_expose_metrics"), env = "RELOADER_EXPOSE_METRICS")]
    expose_metrics: bool,
    #[arg(long, overrides_with = "expose_metrics", hide(true))]
    no_expose_metrics: bool,

    /// Whether the health_check endpoint should be served
    #[arg(long, overrides_with("no_health_check"), env = "RELOADER_HEALTH_CHECK")]
    health_check: bool,
    #[arg(long, overrides_with = "health_check", hide(true))]
    no_health_check: bool,
}

impl ReloaderCli {
    fn to_config(&self) -> ReloaderConfig {
        ReloaderConfig {
            watch_globally: resolve_bool_arg(self.watch_globally, self.no_watch_globally),
            namespace_selector: self.namespace_selector.clone(),
            ignore_namespaces: self.ignore_namespaces.clone(),
            resource_label_selector: self.resource_label_selector.clone(),
            ignore_configmaps: resolve_bool_arg(self.ignore_configmaps, self.no_ignore_configmaps),
            ignore_secrets: resolve_bool_arg(self.ignore_secrets, self.no_ignore_secrets),
            ignore_cronjobs: resolve_bool_arg(self.ignore_cronjobs, self.no_ignore_cronjobs),
            ignore_jobs: resolve_bool_arg(self.ignore_jobs, self.no_ignore_jobs),
            reload_on_create: resolve_bool_arg(self.reload_on_create, self.no_reload_on_create),
            reload_on_delete: resolve_bool_arg(self.reload_on_delete, self.no_reload_on_delete),
            auto_reload_all: resolve_bool_arg(self.auto_reload_all, self.no_auto_reload_all),
            reload_strategy: self.reload_strategy,
            is_argo_rollouts: resolve_bool_arg(self.is_argo_rollouts, self.no_is_argo_rollouts),
            is_openshift: resolve_bool_arg(self.is_openshift, self.no_is_openshift),
            enable_csi_integration: resolve_bool_arg(
                self.enable_csi_integration,
                self.no_enable_csi_integration,
            ),
            workers: self.workers,
            log_level: self.log_level.clone(),
            extra_workload_kinds: self.extra_workload_kinds.clone(),
            endpoint: self.endpoint,
            expose_metrics: resolve_bool_arg(self.expose_metrics, self.no_expose_metrics),
            health_check: resolve_bool_arg(self.health_check, self.no_health_check),
        }
    }
}

fn resolve_bool_arg(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
        (_, _) => unreachable!("clap should make this impossible"),
    }
}
